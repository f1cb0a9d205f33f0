//! Operator-facing administrative surface.
//!
//! Read and cleanup operations over the per-rule stores: list known store
//! identities, delete a named store, check whether a canonical row exists,
//! and page through stored rows. None of this is on the detection hot path,
//! and none of it can create or mutate row data.

use argus_core::ProjectedRow;
use uuid::Uuid;

use crate::dirs::DuplicateCheckDirs;
use crate::error::DedupError;
use crate::store::{DuplicateCheckStore, RowPage};

pub struct DuplicateCheckAdmin {
    dirs: DuplicateCheckDirs,
}

impl DuplicateCheckAdmin {
    pub fn new(dirs: DuplicateCheckDirs) -> Self {
        Self { dirs }
    }

    /// Identities of every per-rule store on disk.
    pub fn list_stores(&self) -> Result<Vec<Uuid>, DedupError> {
        self.dirs.list()
    }

    /// Delete one rule's store entirely.
    pub fn delete_store(&self, rule_uuid: &Uuid) -> Result<(), DedupError> {
        self.dirs.delete(rule_uuid)
    }

    /// Whether the given projected row is already recorded for the rule.
    ///
    /// The row must match the column layout stamped in the store.
    pub fn contains(&self, rule_uuid: Uuid, row: &ProjectedRow) -> Result<bool, DedupError> {
        let store = DuplicateCheckStore::open_existing(&self.dirs, rule_uuid)?;
        store.lookup(row)
    }

    /// Page through the canonical rows recorded for a rule.
    pub fn fetch_rows(
        &self,
        rule_uuid: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<RowPage, DedupError> {
        let store = DuplicateCheckStore::open_existing(&self.dirs, rule_uuid)?;
        store.fetch_rows(offset, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::DedupColumn;
    use argus_core::FieldValue;

    fn seeded_store(dirs: &DuplicateCheckDirs, rule: Uuid, values: &[&str]) {
        let store = DuplicateCheckStore::open(
            dirs,
            rule,
            vec![DedupColumn::new("user", false)],
        )
        .unwrap();
        for v in values {
            store
                .check(&ProjectedRow::new(vec![FieldValue::Text(v.to_string())]))
                .unwrap();
        }
        store.close().unwrap();
    }

    #[test]
    fn list_and_delete_stores() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let rule = Uuid::new_v4();
        seeded_store(&dirs, rule, &["alice"]);

        let admin = DuplicateCheckAdmin::new(dirs);
        assert_eq!(admin.list_stores().unwrap(), vec![rule]);
        admin.delete_store(&rule).unwrap();
        assert!(admin.list_stores().unwrap().is_empty());
    }

    #[test]
    fn contains_reports_recorded_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let rule = Uuid::new_v4();
        seeded_store(&dirs, rule, &["alice", "bob"]);

        let admin = DuplicateCheckAdmin::new(dirs);
        let alice = ProjectedRow::new(vec![FieldValue::Text("alice".into())]);
        let carol = ProjectedRow::new(vec![FieldValue::Text("carol".into())]);
        assert!(admin.contains(rule, &alice).unwrap());
        assert!(!admin.contains(rule, &carol).unwrap());
        // The lookup itself must not have recorded the probed row.
        assert!(!admin.contains(rule, &carol).unwrap());
    }

    #[test]
    fn fetch_rows_returns_stored_values() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let rule = Uuid::new_v4();
        seeded_store(&dirs, rule, &["alice", "bob"]);

        let admin = DuplicateCheckAdmin::new(dirs);
        let page = admin.fetch_rows(rule, 0, 10).unwrap();
        assert_eq!(page.total, 2);
        let mut seen: Vec<String> = page
            .rows
            .iter()
            .map(|r| r.values[0].clone().unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["alice", "bob"]);
    }
}
