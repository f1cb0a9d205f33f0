//! Scan-window computation.
//!
//! Each run scans a half-open `(from, to]` window derived from the previous
//! run's watermark. Successive windows are contiguous and non-overlapping:
//! a run's `from` is exactly the prior run's `to`, so no event is scanned
//! twice and none is skipped as long as `wait_for_data` exceeds the source's
//! true arrival lateness.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Half-open scan window; `from` is exclusive, `to` is inclusive and always
/// after `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Inputs to one window computation.
#[derive(Debug, Clone)]
pub struct WindowParams {
    /// Safety margin subtracted from `to` so late-arriving events are not
    /// skipped.
    pub wait_for_data: Duration,
    /// Upper bound of the last successful run, if any.
    pub last_watermark: Option<DateTime<Utc>>,
    /// Whether the source has fully caught up with its input.
    pub source_up_to_date: bool,
    /// When this run started.
    pub run_start: DateTime<Utc>,
    /// Time of the most recent event the source knows about.
    pub last_event_time: Option<DateTime<Utc>>,
    /// Optional lower bound on the first-ever window.
    pub min_bound: Option<DateTime<Utc>>,
    /// Optional upper bound windows may never pass.
    pub max_bound: Option<DateTime<Utc>>,
}

/// Compute the next scan window, or `None` when there is nothing to scan.
///
/// A `None` result is a correct no-op run: the watermark must not move. Note
/// that a window of exactly zero width never runs (strict `to > from`).
pub fn compute_window(params: &WindowParams) -> Option<ExecutionWindow> {
    let from = params
        .last_watermark
        .or(params.min_bound)
        .unwrap_or(DateTime::UNIX_EPOCH);

    let mut to = if params.source_up_to_date {
        params.run_start
    } else {
        // Without a caught-up source, the newest known event bounds the
        // scan; with neither, fall back to `from` for an empty window.
        params.last_event_time.unwrap_or(from)
    };

    to = to - params.wait_for_data;

    if let Some(max) = params.max_bound {
        if to > max {
            to = max;
        }
    }

    (to > from).then_some(ExecutionWindow { from, to })
}
