//! Typed field values and the rows that carry them through a run.
//!
//! A [`FieldValueRow`] is one source event's extracted fields, in extraction
//! order. A [`ProjectedRow`] is the reduced column view that flows into
//! duplicate checking and delivery after a rule has matched.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ── Field values ────────────────────────────────────────────────────

/// A single extracted field value.
///
/// `Missing` means the field was not present on the event at all, which is
/// distinct from `Null` (present but empty). Projection never substitutes a
/// default: an absent source field projects as `Missing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Missing,
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, FieldValue::Missing)
    }

    /// Integer view, used for linked-event reference fields.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Deterministic text rendering used for canonical serialization and
    /// detection values. Returns `None` for `Missing`; `Null` renders empty.
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Missing => None,
            FieldValue::Null => Some(String::new()),
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Integer(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Timestamp(t) => Some(t.to_rfc3339()),
        }
    }
}

// ── Event rows ──────────────────────────────────────────────────────

/// One source event's extracted fields, keyed by field name in extraction
/// order. Produced by the external extraction stage and consumed exactly
/// once by the field matcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValueRow {
    fields: IndexMap<String, FieldValue>,
}

impl FieldValueRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, FieldValue)> for FieldValueRow {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// A result row reduced to its declared output columns, post matching.
///
/// Two projected rows are the same detection iff their canonical
/// serialization is byte-identical.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedRow {
    pub values: Vec<FieldValue>,
}

impl ProjectedRow {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_preserves_insertion_order() {
        let mut row = FieldValueRow::new();
        row.insert("zulu", FieldValue::Integer(1));
        row.insert("alpha", FieldValue::Integer(2));
        row.insert("mike", FieldValue::Integer(3));

        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn render_distinguishes_null_from_missing() {
        assert_eq!(FieldValue::Missing.render(), None);
        assert_eq!(FieldValue::Null.render(), Some(String::new()));
        assert_eq!(FieldValue::Text(String::new()).render(), Some(String::new()));
    }

    #[test]
    fn render_is_deterministic_for_timestamps() {
        let t = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = FieldValue::Timestamp(t).render();
        let b = FieldValue::Timestamp(t).render();
        assert_eq!(a, b);
        assert_eq!(a.as_deref(), Some("2024-05-01T12:00:00+00:00"));
    }
}
