use async_trait::async_trait;
use ringleaf_types::{Entry, Id};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("snapshot file error: {0}")]
    File(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Source of the entries a snapshot writes out.
#[async_trait]
pub trait Persistable: Send + Sync {
    async fn snapshot(&self) -> Vec<Entry>;
}

/// Write-flag-gated snapshot loop.
///
/// Wakes every `interval`, and only when a mutation has set the flag since
/// the last round writes the full entry set to disk via a temp file and an
/// atomic rename. Snapshot files are rebuildable artifacts: I/O failures
/// are logged and the node keeps running.
#[derive(Debug)]
pub struct Persistence<T> {
    subject: Arc<T>,
    write_flag: Arc<AtomicBool>,
    interval: Duration,
    path: PathBuf,
}

impl<T: Persistable + 'static> Persistence<T> {
    pub fn new(
        subject: Arc<T>,
        write_flag: Arc<AtomicBool>,
        interval_ms: u64,
        path: PathBuf,
    ) -> Self {
        Persistence {
            subject,
            write_flag,
            interval: Duration::from_millis(interval_ms),
            path,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    self.flush_if_dirty().await;
                    break;
                }
                _ = sleep(self.interval) => {
                    self.flush_if_dirty().await;
                }
            }
        }
    }

    async fn flush_if_dirty(&self) {
        if self
            .write_flag
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let entries = self.subject.snapshot().await;
        match write_snapshot(&self.path, &entries) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), entries = entries.len(), "snapshot written")
            }
            Err(e) => tracing::error!(path = %self.path.display(), error = %e, "snapshot failed"),
        }
    }
}

/// Snapshot file for one node: named after its id, under the configured
/// directory.
pub fn snapshot_path(dir: &Path, overlay: &str, id: &Id) -> PathBuf {
    dir.join(format!("{overlay}_{}.json", id.to_hex()))
}

/// Best-effort removal of a snapshot left by a previous incarnation.
pub fn remove_stale(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale snapshot"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove stale snapshot"),
    }
}

fn write_snapshot(path: &Path, entries: &[Entry]) -> Result<(), PersistenceError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&file, entries)?;
    file.persist(path)
        .map_err(|e| PersistenceError::File(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ringleaf_types::Value;
    use tokio::sync::Mutex;

    struct FixedEntries(Mutex<Vec<Entry>>);

    #[async_trait]
    impl Persistable for FixedEntries {
        async fn snapshot(&self) -> Vec<Entry> {
            self.0.lock().await.clone()
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = Id::hash_of("127.0.0.1:4000");
        let path = snapshot_path(dir.path(), "chord", &id);
        let entries = vec![
            Entry::new(Id::hash_of("a"), Value::from("one")),
            Entry::new(Id::hash_of("b"), Value::from(2)),
        ];
        write_snapshot(&path, &entries).unwrap();
        let raw = std::fs::read(&path).unwrap();
        let back: Vec<Entry> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, entries);
    }

    #[tokio::test]
    async fn flush_runs_only_when_flag_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let id = Id::hash_of("127.0.0.1:4001");
        let path = snapshot_path(dir.path(), "pastry", &id);
        let subject = Arc::new(FixedEntries(Mutex::new(vec![Entry::new(
            Id::hash_of("k"),
            Value::from(true),
        )])));
        let flag = Arc::new(AtomicBool::new(false));
        let persistence = Persistence::new(subject, flag.clone(), 10, path.clone());

        persistence.flush_if_dirty().await;
        assert!(!path.exists());

        flag.store(true, Ordering::SeqCst);
        persistence.flush_if_dirty().await;
        assert!(path.exists());
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn stale_removal_is_quiet_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "chord", &Id::hash_of("gone"));
        remove_stale(&path);
        std::fs::write(&path, b"[]").unwrap();
        remove_stale(&path);
        assert!(!path.exists());
    }
}
