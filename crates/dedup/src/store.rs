//! Per-rule persistent duplicate-check store.
//!
//! One RocksDB instance per rule, living in its own directory (see
//! [`DuplicateCheckDirs`]). The `rows` column family maps the 8-byte row hash
//! to the canonical bytes; the `info` column family stamps the schema version
//! and the column layout the canonical bytes were produced under.
//!
//! `check` is insert-if-absent: the first caller to present a row wins, every
//! later byte-identical row is reported as a duplicate. Writers are
//! serialized by an internal mutex; the store must only ever have a single
//! writing process (one execution node per rule).

use std::fs;
use std::sync::Mutex;

use argus_core::ProjectedRow;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, DB};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dirs::DuplicateCheckDirs;
use crate::error::DedupError;
use crate::row::{canonical_bytes, decode_canonical, row_hash, DedupColumn};

const ROWS_CF: &str = "rows";
const INFO_CF: &str = "info";

const SCHEMA_VERSION_KEY: &[u8] = b"schema-version";
const COLUMNS_KEY: &[u8] = b"columns";

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// A canonical row read back out of the store, for operator display.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// One entry per dedup column; `None` marks an absent source value.
    pub values: Vec<Option<String>>,
}

/// One page of stored rows plus the total row count.
#[derive(Debug, Clone)]
pub struct RowPage {
    pub rows: Vec<StoredRow>,
    pub total: u64,
}

#[derive(Debug)]
pub struct DuplicateCheckStore {
    db: DB,
    rule_uuid: Uuid,
    columns: Vec<DedupColumn>,
    write_lock: Mutex<()>,
}

impl DuplicateCheckStore {
    /// Open (or create) the store for one rule with the rule's current
    /// output columns.
    ///
    /// A schema-version mismatch deletes and recreates the store. A changed
    /// column layout keeps the store but clears all row data, since existing
    /// canonical bytes no longer line up with the new layout.
    pub fn open(
        dirs: &DuplicateCheckDirs,
        rule_uuid: Uuid,
        columns: Vec<DedupColumn>,
    ) -> Result<Self, DedupError> {
        let path = dirs.dir_for(&rule_uuid);
        fs::create_dir_all(&path)?;

        let mut db = open_db(&path)?;
        if !schema_is_current(&db)? {
            info!(
                rule_uuid = %rule_uuid,
                dir = %path.display(),
                "duplicate-check store has an unsupported schema, recreating"
            );
            drop(db);
            DB::destroy(&Options::default(), &path)?;
            db = open_db(&path)?;
        }
        write_schema_version(&db)?;

        match read_columns(&db)? {
            Some(stored) if stored != columns => {
                warn!(
                    rule_uuid = %rule_uuid,
                    "output columns changed, clearing all duplicate-check data"
                );
                db.drop_cf(ROWS_CF)?;
                db.create_cf(ROWS_CF, &Options::default())?;
                write_columns(&db, &columns)?;
            }
            Some(_) => {}
            None => write_columns(&db, &columns)?,
        }

        Ok(Self {
            db,
            rule_uuid,
            columns,
            write_lock: Mutex::new(()),
        })
    }

    /// Open an existing store using the column layout stamped inside it.
    ///
    /// This is the administrative path: it never creates, wipes or rewrites
    /// anything, so an operator inspecting a store cannot damage it.
    pub fn open_existing(dirs: &DuplicateCheckDirs, rule_uuid: Uuid) -> Result<Self, DedupError> {
        let path = dirs.dir_for(&rule_uuid);
        if !path.is_dir() {
            return Err(DedupError::StoreNotFound(rule_uuid));
        }
        let db = open_db(&path)?;
        if !schema_is_current(&db)? {
            return Err(DedupError::Internal(format!(
                "store for rule {rule_uuid} has an unsupported schema version"
            )));
        }
        let columns = read_columns(&db)?.ok_or_else(|| {
            DedupError::Internal(format!("store for rule {rule_uuid} has no column layout"))
        })?;
        Ok(Self {
            db,
            rule_uuid,
            columns,
            write_lock: Mutex::new(()),
        })
    }

    pub fn rule_uuid(&self) -> Uuid {
        self.rule_uuid
    }

    pub fn columns(&self) -> &[DedupColumn] {
        &self.columns
    }

    /// Insert-if-absent. Returns `true` when the row is novel (it was
    /// inserted), `false` when a byte-identical canonical row (or a hash
    /// collision, accepted by design) was already present.
    pub fn check(&self, row: &ProjectedRow) -> Result<bool, DedupError> {
        let canonical = canonical_bytes(row, &self.columns)?;
        let key = row_hash(&canonical).to_le_bytes();
        let cf = self.rows_cf()?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.db.get_pinned_cf(cf, key)?.is_some() {
            debug!(rule_uuid = %self.rule_uuid, "duplicate row suppressed");
            Ok(false)
        } else {
            self.db.put_cf(cf, key, &canonical)?;
            Ok(true)
        }
    }

    /// Whether a canonical row is already recorded, without inserting it.
    pub fn lookup(&self, row: &ProjectedRow) -> Result<bool, DedupError> {
        let canonical = canonical_bytes(row, &self.columns)?;
        let key = row_hash(&canonical).to_le_bytes();
        let cf = self.rows_cf()?;
        Ok(self.db.get_pinned_cf(cf, key)?.is_some())
    }

    /// Page through stored canonical rows in key order.
    pub fn fetch_rows(&self, offset: u64, limit: u64) -> Result<RowPage, DedupError> {
        let cf = self.rows_cf()?;
        let mut rows = Vec::new();
        let mut total = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            if total >= offset && (rows.len() as u64) < limit {
                rows.push(StoredRow {
                    values: decode_canonical(&value)?,
                });
            }
            total += 1;
        }
        Ok(RowPage { rows, total })
    }

    pub fn flush(&self) -> Result<(), DedupError> {
        self.db.flush()?;
        Ok(())
    }

    /// Flush and close. The engine is released when the store drops.
    pub fn close(self) -> Result<(), DedupError> {
        self.db.flush()?;
        Ok(())
    }

    fn rows_cf(&self) -> Result<&ColumnFamily, DedupError> {
        self.db
            .cf_handle(ROWS_CF)
            .ok_or_else(|| DedupError::Internal("rows column family missing".into()))
    }
}

fn open_db(path: &std::path::Path) -> Result<DB, DedupError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(ROWS_CF, Options::default()),
        ColumnFamilyDescriptor::new(INFO_CF, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&opts, path, cfs)?)
}

fn info_cf(db: &DB) -> Result<&ColumnFamily, DedupError> {
    db.cf_handle(INFO_CF)
        .ok_or_else(|| DedupError::Internal("info column family missing".into()))
}

/// A store with no version stamp is brand new and counts as current; it gets
/// stamped right after this check.
fn schema_is_current(db: &DB) -> Result<bool, DedupError> {
    let cf = info_cf(db)?;
    match db.get_cf(cf, SCHEMA_VERSION_KEY)? {
        None => Ok(true),
        Some(bytes) => {
            let version = bytes
                .as_slice()
                .try_into()
                .map(u32::from_le_bytes)
                .unwrap_or(0);
            Ok(version == CURRENT_SCHEMA_VERSION)
        }
    }
}

fn write_schema_version(db: &DB) -> Result<(), DedupError> {
    let cf = info_cf(db)?;
    db.put_cf(cf, SCHEMA_VERSION_KEY, CURRENT_SCHEMA_VERSION.to_le_bytes())?;
    Ok(())
}

fn read_columns(db: &DB) -> Result<Option<Vec<DedupColumn>>, DedupError> {
    let cf = info_cf(db)?;
    match db.get_cf(cf, COLUMNS_KEY)? {
        None => Ok(None),
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
    }
}

fn write_columns(db: &DB, columns: &[DedupColumn]) -> Result<(), DedupError> {
    let cf = info_cf(db)?;
    db.put_cf(cf, COLUMNS_KEY, serde_json::to_vec(columns)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::FieldValue;

    fn ungrouped(names: &[&str]) -> Vec<DedupColumn> {
        names.iter().map(|n| DedupColumn::new(*n, false)).collect()
    }

    fn text_row(values: &[&str]) -> ProjectedRow {
        ProjectedRow::new(values.iter().map(|v| FieldValue::Text(v.to_string())).collect())
    }

    #[test]
    fn first_check_is_novel_second_is_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let store =
            DuplicateCheckStore::open(&dirs, Uuid::new_v4(), ungrouped(&["user", "host"])).unwrap();

        let row = text_row(&["alice", "web1"]);
        assert!(store.check(&row).unwrap());
        assert!(!store.check(&row).unwrap());
    }

    #[test]
    fn grouping_makes_non_group_columns_irrelevant() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let columns = vec![
            DedupColumn::new("user", true),
            DedupColumn::new("message", false),
        ];
        let store = DuplicateCheckStore::open(&dirs, Uuid::new_v4(), columns).unwrap();

        assert!(store.check(&text_row(&["alice", "first"])).unwrap());
        assert!(!store.check(&text_row(&["alice", "second"])).unwrap());
        assert!(store.check(&text_row(&["bob", "first"])).unwrap());
    }

    #[test]
    fn duplicates_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let rule = Uuid::new_v4();

        let store = DuplicateCheckStore::open(&dirs, rule, ungrouped(&["user"])).unwrap();
        assert!(store.check(&text_row(&["alice"])).unwrap());
        store.close().unwrap();

        let store = DuplicateCheckStore::open(&dirs, rule, ungrouped(&["user"])).unwrap();
        assert!(!store.check(&text_row(&["alice"])).unwrap());
        assert!(store.check(&text_row(&["bob"])).unwrap());
    }

    #[test]
    fn stores_are_isolated_per_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let store_a =
            DuplicateCheckStore::open(&dirs, Uuid::new_v4(), ungrouped(&["user"])).unwrap();
        let store_b =
            DuplicateCheckStore::open(&dirs, Uuid::new_v4(), ungrouped(&["user"])).unwrap();

        let row = text_row(&["alice"]);
        assert!(store_a.check(&row).unwrap());
        // Rule B never saw this row; rule A's insert must not leak across.
        assert!(store_b.check(&row).unwrap());
    }

    #[test]
    fn column_layout_change_clears_row_data() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let rule = Uuid::new_v4();

        let store = DuplicateCheckStore::open(&dirs, rule, ungrouped(&["user"])).unwrap();
        assert!(store.check(&text_row(&["alice"])).unwrap());
        store.close().unwrap();

        let store =
            DuplicateCheckStore::open(&dirs, rule, ungrouped(&["user", "host"])).unwrap();
        // Old data is gone; the same user is novel again under the new layout.
        assert!(store.check(&text_row(&["alice", "web1"])).unwrap());
        assert_eq!(store.fetch_rows(0, 10).unwrap().total, 1);
    }

    #[test]
    fn lookup_does_not_insert() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let store = DuplicateCheckStore::open(&dirs, Uuid::new_v4(), ungrouped(&["user"])).unwrap();

        let row = text_row(&["alice"]);
        assert!(!store.lookup(&row).unwrap());
        assert!(store.check(&row).unwrap());
        assert!(store.lookup(&row).unwrap());
    }

    #[test]
    fn fetch_rows_pages_through_stored_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let store = DuplicateCheckStore::open(&dirs, Uuid::new_v4(), ungrouped(&["n"])).unwrap();

        for i in 0..5 {
            assert!(store.check(&text_row(&[&i.to_string()])).unwrap());
        }

        let page = store.fetch_rows(0, 3).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.rows.len(), 3);

        let rest = store.fetch_rows(3, 10).unwrap();
        assert_eq!(rest.rows.len(), 2);
    }

    #[test]
    fn unsupported_schema_version_recreates_store() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let rule = Uuid::new_v4();

        let store = DuplicateCheckStore::open(&dirs, rule, ungrouped(&["user"])).unwrap();
        assert!(store.check(&text_row(&["alice"])).unwrap());
        store.close().unwrap();

        // Stamp a future schema version directly into the info column family.
        {
            let db = open_db(&dirs.dir_for(&rule)).unwrap();
            let cf = info_cf(&db).unwrap();
            db.put_cf(cf, SCHEMA_VERSION_KEY, 999u32.to_le_bytes()).unwrap();
        }

        let store = DuplicateCheckStore::open(&dirs, rule, ungrouped(&["user"])).unwrap();
        // The store was rebuilt from scratch, so the old row is novel again.
        assert!(store.check(&text_row(&["alice"])).unwrap());
    }

    #[test]
    fn open_existing_reads_stamped_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let rule = Uuid::new_v4();

        let store = DuplicateCheckStore::open(&dirs, rule, ungrouped(&["user", "host"])).unwrap();
        assert!(store.check(&text_row(&["alice", "web1"])).unwrap());
        store.close().unwrap();

        let store = DuplicateCheckStore::open_existing(&dirs, rule).unwrap();
        assert_eq!(store.columns().len(), 2);
        assert!(store.lookup(&text_row(&["alice", "web1"])).unwrap());
    }

    #[test]
    fn open_existing_fails_for_unknown_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let err = DuplicateCheckStore::open_existing(&dirs, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DedupError::StoreNotFound(_)));
    }
}
