//! Per-rule store directory layout and the reconciliation sweep.
//!
//! Every rule gets a physically separate directory named by its UUID, so
//! deleting one rule's store can never touch another rule's keys. The sweep
//! deletes directories whose identity no longer corresponds to a known rule;
//! it is maintenance, runs off the hot path, and skips (but logs) any
//! directory it cannot handle.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DedupError;

#[derive(Debug, Clone)]
pub struct DuplicateCheckDirs {
    root: PathBuf,
}

impl DuplicateCheckDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the store for one rule.
    pub fn dir_for(&self, rule_uuid: &Uuid) -> PathBuf {
        self.root.join(rule_uuid.to_string())
    }

    /// Identities of all stores currently on disk.
    ///
    /// Directories whose names do not parse as UUIDs are skipped with a
    /// warning; they were not created by us.
    pub fn list(&self) -> Result<Vec<Uuid>, DedupError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut uuids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(|s| Uuid::parse_str(s).ok()) {
                Some(uuid) => uuids.push(uuid),
                None => warn!(
                    dir = %entry.path().display(),
                    "skipping non-store directory in duplicate-check root"
                ),
            }
        }
        uuids.sort();
        Ok(uuids)
    }

    /// Delete one rule's store directory. Missing directories are fine.
    pub fn delete(&self, rule_uuid: &Uuid) -> Result<(), DedupError> {
        let dir = self.dir_for(rule_uuid);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(rule_uuid = %rule_uuid, dir = %dir.display(), "deleted duplicate-check store");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete store directories whose rule no longer exists.
    ///
    /// Returns the number of directories removed. Failures are per-directory:
    /// one bad directory must not abort the sweep.
    pub fn reconcile(&self, known_rules: &HashSet<Uuid>) -> usize {
        let stores = match self.list() {
            Ok(stores) => stores,
            Err(e) => {
                warn!(error = %e, root = %self.root.display(), "duplicate-check sweep failed to list stores");
                return 0;
            }
        };

        let mut deleted = 0;
        for uuid in stores {
            if known_rules.contains(&uuid) {
                debug!(rule_uuid = %uuid, "store still owned by a known rule");
                continue;
            }
            match self.delete(&uuid) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(
                    rule_uuid = %uuid,
                    error = %e,
                    "failed to delete stale duplicate-check store, skipping"
                ),
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_of_missing_root_is_empty() {
        let dirs = DuplicateCheckDirs::new("/nonexistent/dedup-root");
        assert!(dirs.list().unwrap().is_empty());
    }

    #[test]
    fn list_skips_foreign_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let uuid = Uuid::new_v4();
        fs::create_dir(dirs.dir_for(&uuid)).unwrap();
        fs::create_dir(tmp.path().join("not-a-uuid")).unwrap();

        assert_eq!(dirs.list().unwrap(), vec![uuid]);
    }

    #[test]
    fn reconcile_removes_only_unknown_stores() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        let keep = Uuid::new_v4();
        let stale = Uuid::new_v4();
        fs::create_dir(dirs.dir_for(&keep)).unwrap();
        fs::create_dir(dirs.dir_for(&stale)).unwrap();

        let known: HashSet<Uuid> = [keep].into_iter().collect();
        let deleted = dirs.reconcile(&known);

        assert_eq!(deleted, 1);
        assert!(dirs.dir_for(&keep).exists());
        assert!(!dirs.dir_for(&stale).exists());
    }

    #[test]
    fn delete_missing_store_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DuplicateCheckDirs::new(tmp.path());
        dirs.delete(&Uuid::new_v4()).unwrap();
    }
}
