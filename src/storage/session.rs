//! Per-run session directory
//!
//! ```text
//! <root>/
//!   251019_143005/        one directory per run, local start time
//!     muon_log.txt        activity log
//!     anomaly/            created on first anomaly snapshot
//!     all/                created on first save-all snapshot
//! ```

use super::PersistError;
use crate::config::defaults::{SESSION_DIR_FORMAT, SESSION_LOG_FILE};
use crate::types::Classification;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
    dir: PathBuf,
}

impl SessionLayout {
    /// Create a session directory for a run starting now.
    pub fn create(root: &Path) -> Result<Self, PersistError> {
        Self::create_at(root, Local::now())
    }

    /// Create a session directory named after `started_at`.
    ///
    /// The root must already exist. Two runs started within the same second
    /// get distinct directories (`_1`, `_2`, ... suffixes).
    pub fn create_at(root: &Path, started_at: DateTime<Local>) -> Result<Self, PersistError> {
        if !root.is_dir() {
            return Err(PersistError::MissingRoot(root.to_path_buf()));
        }

        let base = started_at.format(SESSION_DIR_FORMAT).to_string();
        let mut dir = root.join(&base);
        let mut suffix = 0u32;
        loop {
            match std::fs::create_dir(&dir) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                    dir = root.join(format!("{base}_{suffix}"));
                }
                Err(e) => return Err(PersistError::io(&dir, e)),
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the session activity log.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(SESSION_LOG_FILE)
    }

    /// Directory for snapshots of the given class (not created).
    pub fn class_dir(&self, classification: Classification) -> PathBuf {
        self.dir.join(classification.dir_name())
    }

    /// Directory for snapshots of the given class, created on demand.
    pub fn ensure_class_dir(&self, classification: Classification) -> Result<PathBuf, PersistError> {
        let dir = self.class_dir(classification);
        std::fs::create_dir_all(&dir).map_err(|e| PersistError::io(&dir, e))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_named_by_local_time() {
        let root = tempfile::tempdir().unwrap();
        let start = Local.with_ymd_and_hms(2025, 10, 19, 14, 30, 5).unwrap();
        let session = SessionLayout::create_at(root.path(), start).unwrap();
        assert_eq!(session.dir(), root.path().join("251019_143005"));
        assert!(session.dir().is_dir());
        assert_eq!(session.log_path(), session.dir().join("muon_log.txt"));
        // class directories appear only on demand
        assert!(!session.class_dir(Classification::Anomaly).exists());
        let anomaly = session.ensure_class_dir(Classification::Anomaly).unwrap();
        assert!(anomaly.ends_with("anomaly"));
        assert!(anomaly.is_dir());
    }

    #[test]
    fn test_same_second_gets_unique_dir() {
        let root = tempfile::tempdir().unwrap();
        let start = Local.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let a = SessionLayout::create_at(root.path(), start).unwrap();
        let b = SessionLayout::create_at(root.path(), start).unwrap();
        assert_ne!(a.dir(), b.dir());
        assert!(b.dir().ends_with("250102_030405_1"));
    }

    #[test]
    fn test_missing_root_is_error() {
        let result = SessionLayout::create(Path::new("/no/such/muon/root"));
        assert!(matches!(result, Err(PersistError::MissingRoot(_))));
    }
}
