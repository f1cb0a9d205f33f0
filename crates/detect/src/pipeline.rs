//! One scheduled run of one rule: window → match → dedup → throttle →
//! deliver.
//!
//! The watermark only advances on clean completion, so a failed window is
//! re-scanned on the next cycle (at-least-once). Rows the failed attempt had
//! already recorded in the duplicate store are re-suppressed on retry, and
//! the recorded partial-progress marker keeps them from even reaching the
//! matcher again.

use argus_core::{Detection, DetectionValue, FieldValueRow};
use argus_dedup::DuplicateCheckStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::DetectError;
use crate::matcher::{ConsumerChain, FieldMatcher, MatchedRow, RowSink};
use crate::rule::Rule;
use crate::sink::DetectionSink;
use crate::throttle::Throttle;
use crate::window::{compute_window, ExecutionWindow, WindowParams};

// ── External collaborators ──────────────────────────────────────────

/// What the extraction stage knows about its own progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceState {
    /// Whether the source has fully caught up with its input.
    pub up_to_date: bool,
    /// Time of the most recent event the source knows about.
    pub last_event_time: Option<DateTime<Utc>>,
}

/// The external extraction/search stage. Produces field-value rows for a
/// window in increasing per-run ordinal order.
pub trait EventSource {
    fn source_state(&self, rule: &Rule) -> Result<SourceState, DetectError>;

    fn events<'s>(
        &'s mut self,
        rule: &Rule,
        window: &ExecutionWindow,
    ) -> Result<Box<dyn Iterator<Item = Result<FieldValueRow, DetectError>> + 's>, DetectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// One line of execution history, persisted by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub rule_uuid: Uuid,
    pub run_time: DateTime<Utc>,
    pub window: ExecutionWindow,
    pub status: ExecutionStatus,
    pub message: String,
}

/// External DAO holding per-rule execution state: the watermark, the
/// partial-progress marker for mid-window resume, execution history, and
/// the node-ownership mapping.
pub trait ExecutionTracker {
    fn watermark(&self, rule_uuid: Uuid) -> Result<Option<DateTime<Utc>>, DetectError>;

    fn advance_watermark(&mut self, rule_uuid: Uuid, to: DateTime<Utc>)
        -> Result<(), DetectError>;

    /// Highest event ordinal durably recorded by a failed attempt at the
    /// current window, if any.
    fn last_committed_event_id(&self, rule_uuid: Uuid) -> Result<Option<u64>, DetectError>;

    fn record_progress(&mut self, rule_uuid: Uuid, last_event_id: u64)
        -> Result<(), DetectError>;

    fn clear_progress(&mut self, rule_uuid: Uuid) -> Result<(), DetectError>;

    fn record_history(&mut self, record: ExecutionRecord) -> Result<(), DetectError>;

    /// Nodes currently mapped to execute this rule.
    fn owner_nodes(&self, rule_uuid: Uuid) -> Result<Vec<String>, DetectError>;
}

// ── Run results ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub events: u64,
    pub matched: u64,
    pub suppressed: u64,
    pub novel: u64,
    pub throttled: u64,
    pub delivered: u64,
}

/// Result of one run. `window` is `None` for a no-op run (nothing to scan).
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub window: Option<ExecutionWindow>,
    pub stats: RunStats,
}

// ── Detection emitter ───────────────────────────────────────────────

/// Terminal row sink of a run: dedup check, throttle, detection build,
/// delivery. Extra observer sinks see every matched row first, with faults
/// isolated per sink.
struct DetectionEmitter<'r> {
    rule: &'r Rule,
    window: ExecutionWindow,
    now: DateTime<Utc>,
    store: &'r DuplicateCheckStore,
    throttle: &'r dyn Throttle,
    sink: &'r mut dyn DetectionSink,
    observers: ConsumerChain,
    stats: RunStats,
    /// Highest ordinal whose row is durably in the duplicate store.
    last_committed: Option<u64>,
}

impl RowSink for DetectionEmitter<'_> {
    fn start(&mut self) -> Result<(), DetectError> {
        self.observers.start()?;
        self.sink.start()
    }

    fn accept(&mut self, matched: &MatchedRow) -> Result<(), DetectError> {
        self.observers.accept(matched)?;
        self.stats.matched += 1;

        if !self.store.check(&matched.row)? {
            self.stats.suppressed += 1;
            debug!(
                rule_id = %self.rule.uuid,
                ordinal = matched.ordinal,
                "row already emitted in a previous run, suppressing"
            );
            return Ok(());
        }
        self.stats.novel += 1;
        self.last_committed = Some(matched.ordinal);

        if !self.throttle.increment_and_check(self.now) {
            self.stats.throttled += 1;
            debug!(rule_id = %self.rule.uuid, "notification throttled");
            return Ok(());
        }

        let detection = build_detection(self.rule, &self.window, self.now, matched);
        self.sink.accept(detection)?;
        self.stats.delivered += 1;
        Ok(())
    }

    fn end(&mut self) -> Result<(), DetectError> {
        self.observers.end()?;
        self.sink.end()
    }
}

fn build_detection(
    rule: &Rule,
    window: &ExecutionWindow,
    now: DateTime<Utc>,
    matched: &MatchedRow,
) -> Detection {
    let values = rule
        .columns
        .iter()
        .zip(&matched.row.values)
        .filter_map(|(column, value)| {
            value.render().map(|rendered| DetectionValue {
                name: column.name.clone(),
                value: rendered,
            })
        })
        .collect();

    Detection {
        detect_time: now,
        execution_time: now,
        effective_execution_time: window.to,
        detector_name: rule.name.clone(),
        detector_uuid: rule.uuid,
        detector_version: rule.version.clone(),
        headline: rule.name.clone(),
        detail: rule.description.clone(),
        values,
        linked_events: matched.origin.clone().into_iter().collect(),
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Orchestrates one run of one rule. Built fresh per run; `run` consumes it.
pub struct DetectionPipeline<'a> {
    rule: &'a Rule,
    node_name: &'a str,
    source: &'a mut dyn EventSource,
    tracker: &'a mut dyn ExecutionTracker,
    store: &'a DuplicateCheckStore,
    throttle: &'a dyn Throttle,
    sink: &'a mut dyn DetectionSink,
    observers: ConsumerChain,
}

impl<'a> DetectionPipeline<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule: &'a Rule,
        node_name: &'a str,
        source: &'a mut dyn EventSource,
        tracker: &'a mut dyn ExecutionTracker,
        store: &'a DuplicateCheckStore,
        throttle: &'a dyn Throttle,
        sink: &'a mut dyn DetectionSink,
    ) -> Self {
        Self {
            rule,
            node_name,
            source,
            tracker,
            store,
            throttle,
            sink,
            observers: ConsumerChain::default(),
        }
    }

    /// Add a row sink that sees every matched row of this run, with faults
    /// isolated from the run itself.
    pub fn add_observer(&mut self, sink: Box<dyn RowSink>) {
        self.observers.push(sink);
    }

    pub fn run(mut self, now: DateTime<Utc>) -> Result<RunOutcome, DetectError> {
        self.validate()?;

        let state = self.source.source_state(self.rule)?;
        let watermark = self.tracker.watermark(self.rule.uuid)?;
        let params = WindowParams {
            wait_for_data: self.rule.wait_for_data,
            last_watermark: watermark,
            source_up_to_date: state.up_to_date,
            run_start: now,
            last_event_time: state.last_event_time,
            min_bound: self.rule.min_time,
            max_bound: self.rule.max_time,
        };
        let Some(window) = compute_window(&params) else {
            debug!(rule_id = %self.rule.uuid, "nothing to scan, run is a no-op");
            return Ok(RunOutcome {
                window: None,
                stats: RunStats::default(),
            });
        };

        let min_event_id = self
            .tracker
            .last_committed_event_id(self.rule.uuid)?
            .map(|id| id + 1);
        if let Some(min) = min_event_id {
            info!(
                rule_id = %self.rule.uuid,
                min_event_id = min,
                "resuming window after a failed attempt"
            );
        }

        let emitter = DetectionEmitter {
            rule: self.rule,
            window,
            now,
            store: self.store,
            throttle: self.throttle,
            sink: self.sink,
            observers: self.observers,
            stats: RunStats::default(),
            last_committed: None,
        };
        let mut matcher = FieldMatcher::new(
            self.rule.predicate.as_ref(),
            &self.rule.columns,
            self.node_name,
            min_event_id,
            emitter,
        );

        let result = (|| -> Result<(), DetectError> {
            matcher.start()?;
            for event in self.source.events(self.rule, &window)? {
                matcher.accept(&event?)?;
            }
            matcher.end()
        })();

        let events_seen = matcher.events_seen();
        let emitter = matcher.into_sink();
        let mut stats = emitter.stats;
        stats.events = events_seen;
        let last_committed = emitter.last_committed;

        match result {
            Ok(()) => {
                self.tracker.clear_progress(self.rule.uuid)?;
                self.tracker.advance_watermark(self.rule.uuid, window.to)?;
                self.tracker.record_history(ExecutionRecord {
                    rule_uuid: self.rule.uuid,
                    run_time: now,
                    window,
                    status: ExecutionStatus::Completed,
                    message: format!(
                        "{} events, {} matched, {} delivered",
                        stats.events, stats.matched, stats.delivered
                    ),
                })?;
                info!(
                    rule_id = %self.rule.uuid,
                    from = %window.from,
                    to = %window.to,
                    events = stats.events,
                    delivered = stats.delivered,
                    "rule run completed"
                );
                Ok(RunOutcome {
                    window: Some(window),
                    stats,
                })
            }
            Err(e) => {
                // The watermark stays put so this window is retried; rows
                // already in the duplicate store get re-suppressed then.
                if let Some(id) = last_committed {
                    if let Err(pe) = self.tracker.record_progress(self.rule.uuid, id) {
                        warn!(rule_id = %self.rule.uuid, error = %pe, "failed to record partial progress");
                    }
                }
                let history = ExecutionRecord {
                    rule_uuid: self.rule.uuid,
                    run_time: now,
                    window,
                    status: ExecutionStatus::Failed,
                    message: e.to_string(),
                };
                if let Err(he) = self.tracker.record_history(history) {
                    warn!(rule_id = %self.rule.uuid, error = %he, "failed to record execution history");
                }
                error!(rule_id = %self.rule.uuid, error = %e, "rule run failed");
                Err(e)
            }
        }
    }

    /// Configuration problems are fatal for the run and must reach the
    /// operator; they are never retried silently.
    fn validate(&self) -> Result<(), DetectError> {
        if self.rule.notification.destination.is_none() {
            return Err(DetectError::Config(format!(
                "rule {} has no notification destination",
                self.rule.uuid
            )));
        }
        let owners = self.tracker.owner_nodes(self.rule.uuid)?;
        if owners.len() > 1 {
            return Err(DetectError::Config(format!(
                "rule {} is mapped to multiple execution nodes ({}); \
                 the duplicate store requires a single writer",
                self.rule.uuid,
                owners.join(", ")
            )));
        }
        Ok(())
    }
}
