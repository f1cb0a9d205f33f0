//! The fully-formed alert record handed to delivery sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single name/value pair carried on a detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionValue {
    pub name: String,
    pub value: String,
}

/// Reference back to the source event a detection was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedEvent {
    pub source_system: String,
    pub stream_id: u64,
    pub event_id: u64,
}

/// A detection that passed match, dedup and throttle stages.
///
/// Immutable once constructed; built exactly once per emitted detection and
/// handed to the delivery sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// When the detection was produced.
    pub detect_time: DateTime<Utc>,
    /// When the owning run started.
    pub execution_time: DateTime<Utc>,
    /// The upper bound of the scanned window, i.e. the effective time the
    /// rule was evaluated up to.
    pub effective_execution_time: DateTime<Utc>,
    pub detector_name: String,
    pub detector_uuid: Uuid,
    pub detector_version: String,
    pub headline: String,
    pub detail: Option<String>,
    pub values: Vec<DetectionValue>,
    pub linked_events: Vec<LinkedEvent>,
}
