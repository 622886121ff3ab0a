//! Retry Queue - files waiting for upload
//!
//! Shared between the persistence worker (enqueue) and the replicator
//! (dequeue / re-queue) behind a mutex. Bounded: when full the oldest entry
//! is evicted. The local file stays, and evicted paths are kept so the
//! replicator can report them as permanently failed at shutdown.
//!
//! Pending paths survive restarts: `save` writes them one per line at
//! shutdown and `load` restores them at the next start.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// A file waiting for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub path: PathBuf,
    /// Failed upload attempts so far
    pub attempts: u32,
}

impl PendingUpload {
    pub fn new(path: PathBuf) -> Self {
        Self { path, attempts: 0 }
    }
}

/// Queue persistence errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue file I/O error ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of restoring a saved queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub restored: usize,
    pub missing: usize,
}

#[derive(Debug)]
pub struct RetryQueue {
    entries: Mutex<VecDeque<PendingUpload>>,
    evicted: Mutex<Vec<PathBuf>>,
    capacity: usize,
    notify: Notify,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            evicted: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingUpload>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add a newly persisted file. Returns the entry dropped to make room, if any.
    pub fn enqueue(&self, path: PathBuf) -> Option<PendingUpload> {
        self.push(PendingUpload::new(path))
    }

    /// Put a failed upload back at the end of the queue.
    pub fn requeue(&self, item: PendingUpload) -> Option<PendingUpload> {
        self.push(item)
    }

    fn push(&self, item: PendingUpload) -> Option<PendingUpload> {
        let dropped = {
            let mut entries = self.lock();
            if entries.iter().any(|e| e.path == item.path) {
                debug!(path = %item.path.display(), "File already queued for upload");
                return None;
            }
            let dropped = if entries.len() >= self.capacity {
                entries.pop_front()
            } else {
                None
            };
            entries.push_back(item);
            dropped
        };

        if let Some(ref d) = dropped {
            warn!(
                path = %d.path.display(),
                capacity = self.capacity,
                "Upload queue full, evicting oldest pending file"
            );
            self.evicted
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(d.path.clone());
        }
        self.notify.notify_one();
        dropped
    }

    /// Take the oldest pending file.
    pub fn pop(&self) -> Option<PendingUpload> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pending paths, oldest first.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().iter().map(|e| e.path.clone()).collect()
    }

    /// Paths evicted for lack of room since the last call, oldest first.
    pub fn take_evicted(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.evicted.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Resolves after the next enqueue (or immediately if one happened unobserved).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Write pending paths to `path`, one per line (temp file + rename).
    ///
    /// An empty queue removes any stale queue file. Returns the number saved.
    pub fn save(&self, path: &Path) -> Result<usize, QueueError> {
        let paths = self.paths();
        if paths.is_empty() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(QueueError::Io { path: path.to_path_buf(), source: e }),
            }
            return Ok(0);
        }

        let mut contents = String::new();
        for p in &paths {
            contents.push_str(&p.to_string_lossy());
            contents.push('\n');
        }

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)
            .and_then(|()| std::fs::rename(&tmp_path, path))
            .map_err(|e| {
                let _ = std::fs::remove_file(&tmp_path);
                QueueError::Io { path: path.to_path_buf(), source: e }
            })?;

        info!(path = %path.display(), pending = paths.len(), "Upload queue saved");
        Ok(paths.len())
    }

    /// Restore entries saved by [`save`](Self::save), then remove the file.
    ///
    /// Entries whose local file no longer exists are skipped.
    pub fn load(&self, path: &Path) -> Result<LoadReport, QueueError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadReport::default()),
            Err(e) => return Err(QueueError::Io { path: path.to_path_buf(), source: e }),
        };

        let mut report = LoadReport::default();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let file = PathBuf::from(line);
            if file.exists() {
                self.enqueue(file);
                report.restored += 1;
            } else {
                info!(path = %file.display(), "Queued file no longer exists, skipping");
                report.missing += 1;
            }
        }

        std::fs::remove_file(path)
            .map_err(|e| QueueError::Io { path: path.to_path_buf(), source: e })?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_capacity() {
        let queue = RetryQueue::new(2);
        assert!(queue.enqueue("a.csv".into()).is_none());
        assert!(queue.enqueue("b.csv".into()).is_none());
        let dropped = queue.enqueue("c.csv".into()).unwrap();
        assert_eq!(dropped.path, PathBuf::from("a.csv"));
        assert_eq!(queue.paths(), vec![PathBuf::from("b.csv"), PathBuf::from("c.csv")]);
        assert_eq!(queue.take_evicted(), vec![PathBuf::from("a.csv")]);
        assert!(queue.take_evicted().is_empty());
    }

    #[test]
    fn test_duplicate_ignored() {
        let queue = RetryQueue::new(4);
        queue.enqueue("a.csv".into());
        queue.enqueue("a.csv".into());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_requeue_keeps_attempts_and_goes_last() {
        let queue = RetryQueue::new(4);
        queue.enqueue("a.csv".into());
        queue.enqueue("b.csv".into());
        let mut item = queue.pop().unwrap();
        item.attempts += 1;
        queue.requeue(item);
        assert_eq!(queue.pop().unwrap().path, PathBuf::from("b.csv"));
        let back = queue.pop().unwrap();
        assert_eq!(back.path, PathBuf::from("a.csv"));
        assert_eq!(back.attempts, 1);
    }

    #[test]
    fn test_save_and_load_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.csv");
        std::fs::write(&kept, "x").unwrap();
        let gone = dir.path().join("gone.csv");
        let queue_file = dir.path().join("upload_queue.txt");

        let queue = RetryQueue::new(10);
        queue.enqueue(kept.clone());
        queue.enqueue(gone);
        assert_eq!(queue.save(&queue_file).unwrap(), 2);

        let restored = RetryQueue::new(10);
        let report = restored.load(&queue_file).unwrap();
        assert_eq!(report, LoadReport { restored: 1, missing: 1 });
        assert_eq!(restored.paths(), vec![kept]);
        assert!(!queue_file.exists());
    }

    #[test]
    fn test_load_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = RetryQueue::new(10);
        let report = queue.load(&dir.path().join("none.txt")).unwrap();
        assert_eq!(report, LoadReport::default());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_save_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue_file = dir.path().join("upload_queue.txt");
        std::fs::write(&queue_file, "old.csv\n").unwrap();
        assert_eq!(RetryQueue::new(4).save(&queue_file).unwrap(), 0);
        assert!(!queue_file.exists());
    }
}
