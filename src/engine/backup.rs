// src/engine/backup.rs

//! Crash-recovery file: one uuid per line for every in-flight run.
//!
//! A line is appended when a run is built and removed when it finishes,
//! whatever the outcome. Whatever remains after a crash is reconciled
//! offline.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fs::FileSystem;

#[derive(Debug, Clone)]
pub struct BackupRecovery {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    // Serialises read/filter/rewrite against concurrent appends.
    lock: Arc<Mutex<()>>,
}

impl BackupRecovery {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn add(&self, uuid: Uuid) -> Result<()> {
        let _guard = self.lock.lock();
        debug!(%uuid, path = ?self.path, "adding run to backup-recovery file");
        self.fs
            .append(&self.path, format!("{uuid}\n").as_bytes())
    }

    pub fn remove(&self, uuid: Uuid) -> Result<()> {
        let _guard = self.lock.lock();
        if !self.fs.exists(&self.path) {
            warn!(path = ?self.path, "backup-recovery file missing");
            return Ok(());
        }

        let needle = uuid.to_string();
        let contents = self.fs.read_to_string(&self.path)?;
        let kept: String = contents
            .lines()
            .filter(|line| line.trim() != needle)
            .map(|line| format!("{line}\n"))
            .collect();

        debug!(%uuid, "removing run from backup-recovery file");
        self.fs.write(&self.path, kept.as_bytes())
    }

    /// Uuids currently recorded as in flight.
    pub fn entries(&self) -> Result<Vec<Uuid>> {
        let _guard = self.lock.lock();
        if !self.fs.exists(&self.path) {
            return Ok(Vec::new());
        }
        let contents = self.fs.read_to_string(&self.path)?;
        Ok(contents
            .lines()
            .filter_map(|line| Uuid::parse_str(line.trim()).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn add_then_remove_keeps_other_entries() {
        let fs = MockFileSystem::new();
        let backup = BackupRecovery::new(Arc::new(fs.clone()), "/lab/backup");

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        backup.add(a).unwrap();
        backup.add(b).unwrap();
        assert_eq!(backup.entries().unwrap(), vec![a, b]);

        backup.remove(a).unwrap();
        assert_eq!(fs.lines("/lab/backup"), vec![b.to_string()]);
    }

    #[test]
    fn removing_from_missing_file_is_not_an_error() {
        let backup = BackupRecovery::new(Arc::new(MockFileSystem::new()), "/nope");
        backup.remove(Uuid::new_v4()).unwrap();
        assert!(backup.entries().unwrap().is_empty());
    }
}
