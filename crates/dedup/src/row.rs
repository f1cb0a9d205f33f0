//! Canonical row serialization and hashing.
//!
//! A projected row is reduced to its grouping-column values (or all values
//! when the rule is ungrouped), serialized with an explicit length prefix per
//! value so values containing any character are safe, and hashed to the fixed
//! 8-byte store key. The hash only needs to be fast and well distributed;
//! collisions are treated as duplicates by design.

use std::hash::Hasher;

use argus_core::{FieldValue, ProjectedRow};
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::error::DedupError;

/// Value was absent from the source event.
const TAG_ABSENT: u8 = 0;
/// Value present; followed by a u32-LE length and that many UTF-8 bytes.
/// An empty (null) value is a zero-length entry, distinct from absent.
const TAG_VALUE: u8 = 1;

/// One output column of a rule as the store sees it: its name and whether it
/// participates in grouping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupColumn {
    pub name: String,
    pub grouped: bool,
}

impl DedupColumn {
    pub fn new(name: impl Into<String>, grouped: bool) -> Self {
        Self {
            name: name.into(),
            grouped,
        }
    }
}

/// Serialize the dedup-relevant values of `row` into canonical bytes.
///
/// With grouping configured, only grouping-column values are included, in
/// column order; otherwise every column value is included.
pub fn canonical_bytes(row: &ProjectedRow, columns: &[DedupColumn]) -> Result<Vec<u8>, DedupError> {
    if row.values.len() != columns.len() {
        return Err(DedupError::ColumnMismatch {
            expected: columns.len(),
            got: row.values.len(),
        });
    }

    let has_grouping = columns.iter().any(|c| c.grouped);
    let mut out = Vec::with_capacity(row.values.len() * 16);
    for (value, column) in row.values.iter().zip(columns) {
        if has_grouping && !column.grouped {
            continue;
        }
        encode_value(value, &mut out);
    }
    Ok(out)
}

fn encode_value(value: &FieldValue, out: &mut Vec<u8>) {
    match value.render() {
        None => out.push(TAG_ABSENT),
        Some(text) => {
            out.push(TAG_VALUE);
            out.extend_from_slice(&(text.len() as u32).to_le_bytes());
            out.extend_from_slice(text.as_bytes());
        }
    }
}

/// Decode canonical bytes back into displayable values. `None` marks a value
/// that was absent from the source event.
pub fn decode_canonical(bytes: &[u8]) -> Result<Vec<Option<String>>, DedupError> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            TAG_ABSENT => {
                values.push(None);
                pos += 1;
            }
            TAG_VALUE => {
                let len_end = pos + 5;
                if len_end > bytes.len() {
                    return Err(DedupError::CorruptRow("truncated length prefix".into()));
                }
                let len = u32::from_le_bytes(
                    bytes[pos + 1..len_end]
                        .try_into()
                        .map_err(|_| DedupError::CorruptRow("bad length prefix".into()))?,
                ) as usize;
                let value_end = len_end + len;
                if value_end > bytes.len() {
                    return Err(DedupError::CorruptRow("truncated value".into()));
                }
                let text = std::str::from_utf8(&bytes[len_end..value_end])
                    .map_err(|_| DedupError::CorruptRow("value is not UTF-8".into()))?;
                values.push(Some(text.to_string()));
                pos = value_end;
            }
            tag => {
                return Err(DedupError::CorruptRow(format!("unknown value tag {tag}")));
            }
        }
    }
    Ok(values)
}

/// 64-bit non-cryptographic hash of the canonical bytes.
///
/// Fixed keys keep the hash stable across process restarts; the stored key is
/// the little-endian encoding of this value.
pub fn row_hash(canonical: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(canonical);
    hasher.finish()
}
