//! Field matching, projection, and row fan-out.
//!
//! [`FieldMatcher`] drives one pass over a run's events: it assigns each
//! event its per-run ordinal, applies the resume floor, evaluates the rule
//! predicate, projects matched rows onto the rule's output columns and
//! forwards them to a [`RowSink`]. [`ConsumerChain`] fans a single pass out
//! to several sinks with per-sink fault isolation.

use argus_core::{FieldValue, FieldValueRow, LinkedEvent, ProjectedRow};
use tracing::{trace, warn};

use crate::error::DetectError;
use crate::rule::{OutputColumn, RowPredicate};

/// Source field carrying the originating stream id, when the extraction
/// stage provides one.
pub const STREAM_ID_FIELD: &str = "StreamId";
/// Source field carrying the originating event id within its stream.
pub const EVENT_ID_FIELD: &str = "EventId";

// ── Matched rows and sinks ──────────────────────────────────────────

/// One matched, projected row together with its per-run ordinal and the
/// source event it came from (when the source exposes reference fields).
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRow {
    pub ordinal: u64,
    pub row: ProjectedRow,
    pub origin: Option<LinkedEvent>,
}

/// Downstream consumer of matched rows.
///
/// `start`/`end` bracket a run and are called exactly once per sink per run,
/// however many matchers share the pass. Sinks differing only in their
/// start/end behavior override just those hooks.
pub trait RowSink {
    fn start(&mut self) -> Result<(), DetectError> {
        Ok(())
    }

    fn accept(&mut self, matched: &MatchedRow) -> Result<(), DetectError>;

    fn end(&mut self) -> Result<(), DetectError> {
        Ok(())
    }
}

// ── Field matcher ───────────────────────────────────────────────────

/// Evaluates one rule against a run's events, in arrival order.
pub struct FieldMatcher<'r, S: RowSink> {
    predicate: &'r dyn RowPredicate,
    columns: &'r [OutputColumn],
    source_system: &'r str,
    /// Ordinal floor for idempotent resume after a failed run; events below
    /// it were already durably recorded by the prior attempt.
    min_event_id: Option<u64>,
    ordinal: u64,
    sink: S,
}

impl<'r, S: RowSink> FieldMatcher<'r, S> {
    pub fn new(
        predicate: &'r dyn RowPredicate,
        columns: &'r [OutputColumn],
        source_system: &'r str,
        min_event_id: Option<u64>,
        sink: S,
    ) -> Self {
        Self {
            predicate,
            columns,
            source_system,
            min_event_id,
            ordinal: 0,
            sink,
        }
    }

    pub fn start(&mut self) -> Result<(), DetectError> {
        self.sink.start()
    }

    /// Feed one event row. The ordinal is assigned before any filtering, so
    /// skipped and unmatched events still advance it.
    pub fn accept(&mut self, fields: &FieldValueRow) -> Result<(), DetectError> {
        self.ordinal += 1;
        let ordinal = self.ordinal;

        if let Some(min) = self.min_event_id {
            if ordinal < min {
                trace!(ordinal, min_event_id = min, "skipping already-recorded event");
                return Ok(());
            }
        }

        if !self.predicate.matches(fields) {
            return Ok(());
        }

        let values: Vec<FieldValue> = self
            .columns
            .iter()
            .map(|c| fields.get(&c.source_field).cloned().unwrap_or(FieldValue::Missing))
            .collect();

        let matched = MatchedRow {
            ordinal,
            row: ProjectedRow::new(values),
            origin: self.linked_event(fields),
        };
        self.sink.accept(&matched)
    }

    pub fn end(&mut self) -> Result<(), DetectError> {
        self.sink.end()
    }

    /// Events seen so far this run, including skipped and unmatched ones.
    pub fn events_seen(&self) -> u64 {
        self.ordinal
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn linked_event(&self, fields: &FieldValueRow) -> Option<LinkedEvent> {
        let stream_id = fields.get(STREAM_ID_FIELD)?.as_integer()?;
        let event_id = fields.get(EVENT_ID_FIELD)?.as_integer()?;
        if stream_id < 0 || event_id < 0 {
            return None;
        }
        Some(LinkedEvent {
            source_system: self.source_system.to_string(),
            stream_id: stream_id as u64,
            event_id: event_id as u64,
        })
    }
}

// ── Consumer chain ──────────────────────────────────────────────────

/// A fault recorded while fanning out to one sink.
#[derive(Debug)]
pub struct SinkFault {
    pub sink_index: usize,
    pub stage: &'static str,
    pub error: DetectError,
}

/// Fans one pass of matched rows out to several sinks.
///
/// A fault in one sink is recorded and logged; the remaining sinks still
/// receive the row. One bad destination must not stop delivery to others.
#[derive(Default)]
pub struct ConsumerChain {
    sinks: Vec<Box<dyn RowSink>>,
    faults: Vec<SinkFault>,
}

impl ConsumerChain {
    pub fn new(sinks: Vec<Box<dyn RowSink>>) -> Self {
        Self {
            sinks,
            faults: Vec::new(),
        }
    }

    pub fn push(&mut self, sink: Box<dyn RowSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Faults recorded so far this run.
    pub fn faults(&self) -> &[SinkFault] {
        &self.faults
    }

    fn each(
        &mut self,
        stage: &'static str,
        mut f: impl FnMut(&mut Box<dyn RowSink>) -> Result<(), DetectError>,
    ) {
        for (index, sink) in self.sinks.iter_mut().enumerate() {
            if let Err(error) = f(sink) {
                warn!(sink_index = index, stage, error = %error, "consumer sink failed");
                self.faults.push(SinkFault {
                    sink_index: index,
                    stage,
                    error,
                });
            }
        }
    }
}

impl RowSink for ConsumerChain {
    fn start(&mut self) -> Result<(), DetectError> {
        self.each("start", |sink| sink.start());
        Ok(())
    }

    fn accept(&mut self, matched: &MatchedRow) -> Result<(), DetectError> {
        self.each("accept", |sink| sink.accept(matched));
        Ok(())
    }

    fn end(&mut self) -> Result<(), DetectError> {
        self.each("end", |sink| sink.end());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn row(pairs: &[(&str, FieldValue)]) -> FieldValueRow {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect()
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    /// Collects everything it is given; optionally fails on demand.
    #[derive(Default)]
    struct Recorder {
        started: u64,
        ended: u64,
        rows: Vec<MatchedRow>,
        fail_accept: bool,
    }

    impl RowSink for Rc<RefCell<Recorder>> {
        fn start(&mut self) -> Result<(), DetectError> {
            self.borrow_mut().started += 1;
            Ok(())
        }

        fn accept(&mut self, matched: &MatchedRow) -> Result<(), DetectError> {
            let mut inner = self.borrow_mut();
            if inner.fail_accept {
                return Err(DetectError::Delivery("sink down".into()));
            }
            inner.rows.push(matched.clone());
            Ok(())
        }

        fn end(&mut self) -> Result<(), DetectError> {
            self.borrow_mut().ended += 1;
            Ok(())
        }
    }

    fn match_all(_row: &FieldValueRow) -> bool {
        true
    }

    #[test]
    fn ordinals_count_every_event() {
        let columns = vec![OutputColumn::new("user", "user", false)];
        let predicate = |row: &FieldValueRow| row.get("user") == Some(&text("alice"));
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut matcher =
            FieldMatcher::new(&predicate, &columns, "argus", None, recorder.clone());

        matcher.accept(&row(&[("user", text("bob"))])).unwrap();
        matcher.accept(&row(&[("user", text("alice"))])).unwrap();
        matcher.accept(&row(&[("user", text("alice"))])).unwrap();

        assert_eq!(matcher.events_seen(), 3);
        let rows = &recorder.borrow().rows;
        // Unmatched events still consumed an ordinal.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ordinal, 2);
        assert_eq!(rows[1].ordinal, 3);
    }

    #[test]
    fn resume_floor_skips_already_recorded_ordinals() {
        let columns = vec![OutputColumn::new("user", "user", false)];
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut matcher =
            FieldMatcher::new(&match_all, &columns, "argus", Some(5), recorder.clone());

        for _ in 0..6 {
            matcher.accept(&row(&[("user", text("alice"))])).unwrap();
        }

        // Ordinals 1..4 never reached matching; 5 and 6 did, identical
        // fields notwithstanding.
        let ordinals: Vec<u64> = recorder.borrow().rows.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![5, 6]);
    }

    #[test]
    fn projection_marks_absent_fields_missing() {
        let columns = vec![
            OutputColumn::new("user", "user", false),
            OutputColumn::new("host", "host", false),
        ];
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut matcher =
            FieldMatcher::new(&match_all, &columns, "argus", None, recorder.clone());

        matcher.accept(&row(&[("user", text("alice"))])).unwrap();

        let rows = &recorder.borrow().rows;
        assert_eq!(rows[0].row.values, vec![text("alice"), FieldValue::Missing]);
    }

    #[test]
    fn linked_event_read_from_reference_fields() {
        let columns = vec![OutputColumn::new("user", "user", false)];
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut matcher =
            FieldMatcher::new(&match_all, &columns, "argus", None, recorder.clone());

        matcher
            .accept(&row(&[
                ("user", text("alice")),
                (STREAM_ID_FIELD, FieldValue::Integer(7)),
                (EVENT_ID_FIELD, FieldValue::Integer(42)),
            ]))
            .unwrap();
        matcher.accept(&row(&[("user", text("bob"))])).unwrap();

        let rows = &recorder.borrow().rows;
        assert_eq!(
            rows[0].origin,
            Some(LinkedEvent {
                source_system: "argus".into(),
                stream_id: 7,
                event_id: 42,
            })
        );
        assert_eq!(rows[1].origin, None);
    }

    #[test]
    fn start_and_end_reach_the_sink_once() {
        let columns = vec![OutputColumn::new("user", "user", false)];
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut matcher =
            FieldMatcher::new(&match_all, &columns, "argus", None, recorder.clone());

        matcher.start().unwrap();
        matcher.accept(&row(&[("user", text("alice"))])).unwrap();
        matcher.end().unwrap();

        assert_eq!(recorder.borrow().started, 1);
        assert_eq!(recorder.borrow().ended, 1);
    }

    #[test]
    fn chain_isolates_a_failing_sink() {
        let bad = Rc::new(RefCell::new(Recorder {
            fail_accept: true,
            ..Recorder::default()
        }));
        let good = Rc::new(RefCell::new(Recorder::default()));
        let mut chain =
            ConsumerChain::new(vec![Box::new(bad.clone()), Box::new(good.clone())]);

        chain.start().unwrap();
        let matched = MatchedRow {
            ordinal: 1,
            row: ProjectedRow::new(vec![text("alice")]),
            origin: None,
        };
        chain.accept(&matched).unwrap();
        chain.end().unwrap();

        // The second sink still got the row, and start/end ran exactly once
        // on each sink.
        assert_eq!(good.borrow().rows.len(), 1);
        assert_eq!(bad.borrow().started, 1);
        assert_eq!(bad.borrow().ended, 1);
        assert_eq!(good.borrow().started, 1);
        assert_eq!(good.borrow().ended, 1);

        assert_eq!(chain.faults().len(), 1);
        assert_eq!(chain.faults()[0].sink_index, 0);
        assert_eq!(chain.faults()[0].stage, "accept");
    }
}
