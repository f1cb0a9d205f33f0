//! Detection rule definition and the predicate seam.
//!
//! Rules are loaded from an external store and are immutable per load. The
//! compiled filter expression lives behind [`RowPredicate`]; the expression
//! language itself is out of scope here.

use std::fmt;
use std::sync::Arc;

use argus_core::{FieldValue, FieldValueRow};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::throttle::ThrottlePolicy;

// ── Predicate seam ──────────────────────────────────────────────────

/// Compiled filter expression, evaluated once per event row.
pub trait RowPredicate: Send + Sync {
    fn matches(&self, row: &FieldValueRow) -> bool;
}

impl<F> RowPredicate for F
where
    F: Fn(&FieldValueRow) -> bool + Send + Sync,
{
    fn matches(&self, row: &FieldValueRow) -> bool {
        self(row)
    }
}

/// Matches when a named field equals an expected value.
#[derive(Debug, Clone)]
pub struct FieldEqualsPredicate {
    pub field: String,
    pub value: FieldValue,
}

impl RowPredicate for FieldEqualsPredicate {
    fn matches(&self, row: &FieldValueRow) -> bool {
        row.get(&self.field) == Some(&self.value)
    }
}

// ── Rule definition ─────────────────────────────────────────────────

/// One output column of a rule's result table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub name: String,
    /// Source field this column projects from.
    pub source_field: String,
    /// Whether this column participates in grouping.
    pub grouped: bool,
}

impl OutputColumn {
    pub fn new(
        name: impl Into<String>,
        source_field: impl Into<String>,
        grouped: bool,
    ) -> Self {
        Self {
            name: name.into(),
            source_field: source_field.into(),
            grouped,
        }
    }
}

/// Where detections go and how hard the throttle clamps down.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationConfig {
    /// Delivery destination identifier. Required for alerting runs.
    pub destination: Option<String>,
    pub policy: ThrottlePolicy,
}

/// A loaded detection rule.
#[derive(Clone)]
pub struct Rule {
    pub uuid: Uuid,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub predicate: Arc<dyn RowPredicate>,
    pub columns: Vec<OutputColumn>,
    pub notification: NotificationConfig,
    /// Optional lower bound on the first-ever scan window.
    pub min_time: Option<DateTime<Utc>>,
    /// Optional upper bound scan windows may never pass.
    pub max_time: Option<DateTime<Utc>>,
    /// Safety margin for late-arriving events.
    pub wait_for_data: Duration,
}

impl Rule {
    /// The column layout as the duplicate-check store sees it.
    pub fn dedup_columns(&self) -> Vec<argus_dedup::DedupColumn> {
        self.columns
            .iter()
            .map(|c| argus_dedup::DedupColumn::new(c.name.clone(), c.grouped))
            .collect()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("columns", &self.columns)
            .field("notification", &self.notification)
            .finish_non_exhaustive()
    }
}
