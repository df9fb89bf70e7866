use std::future::Future;
use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::Result;
use crate::writer::LogWriter;

/// Process-wide mapping from stream id (`ChangeFeedID`) to the live
/// `LogWriter` instance serving it: a `hashbrown::HashMap` behind a
/// single `parking_lot::RwLock`, since no `.await` ever happens while
/// the lock is held. `construct_lock` is a *separate* async mutex that
/// serializes the check-then-construct-then-insert sequence in
/// `get_or_construct`, so two concurrent `new_log_writer` calls for the
/// same id can't both observe a miss and each build their own instance.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<LogWriter>>>,
    construct_lock: AsyncMutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached instance for `change_feed_id`, if one is
    /// registered and its `dir` matches. A mismatched `dir` is treated
    /// as a cache miss by the caller (`new_log_writer`), which then
    /// constructs and `insert`s a replacement.
    pub fn get_matching(&self, change_feed_id: &str, dir: &std::path::Path) -> Option<Arc<LogWriter>> {
        let entries = self.entries.read();
        entries.get(change_feed_id).and_then(|writer| {
            if writer.config().dir == dir {
                Some(writer.clone())
            } else {
                None
            }
        })
    }

    /// Looks up `change_feed_id`/`dir` and, on a miss, builds and
    /// registers a new instance — the check, the (async) construction,
    /// and the insert all happen under `construct_lock`, so this is the
    /// single critical section §4.7 describes, not a check-then-act race.
    /// A lookup hit short-circuits before `construct` ever runs.
    pub async fn get_or_construct<F, Fut>(
        &self,
        change_feed_id: &str,
        dir: &std::path::Path,
        construct: F,
    ) -> Result<Arc<LogWriter>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<LogWriter>>>,
    {
        let _guard = self.construct_lock.lock().await;
        if let Some(cached) = self.get_matching(change_feed_id, dir) {
            return Ok(cached);
        }
        let writer = construct().await?;
        self.insert(change_feed_id.to_string(), writer.clone());
        Ok(writer)
    }

    /// Inserts or replaces the entry for `change_feed_id`. Replacing
    /// does not close the writer it displaces — any
    /// caller still holding that `Arc` keeps a live instance; it is just
    /// no longer reachable through the registry.
    pub fn insert(&self, change_feed_id: String, writer: Arc<LogWriter>) {
        self.entries.write().insert(change_feed_id, writer);
    }

    /// Removes the entry for `change_feed_id`, if it is still the one
    /// pointed at by `writer` (so a concurrent replacement isn't
    /// accidentally evicted by a late `delete_all_logs` on the old
    /// instance).
    pub fn remove_if_current(&self, change_feed_id: &str, writer: &Arc<LogWriter>) {
        let mut entries = self.entries.write();
        if let Some(current) = entries.get(change_feed_id) {
            if Arc::ptr_eq(current, writer) {
                entries.remove(change_feed_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears every entry. Exposed so tests don't leak state into each
    /// other through the process-wide global registry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// The process-wide registry singleton used by `new_log_writer`.
pub static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::LogWriterConfig;
    use crate::writer::LogWriter;

    async fn writer_with_dir(dir: &std::path::Path, id: &str) -> Arc<LogWriter> {
        let cfg = LogWriterConfig {
            dir: dir.to_path_buf(),
            change_feed_id: id.into(),
            capture_id: "cp".into(),
            ..Default::default()
        };
        Arc::new(LogWriter::open(cfg, None).await.unwrap())
    }

    #[tokio::test]
    async fn get_matching_requires_same_dir() {
        let registry = Registry::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let w = writer_with_dir(dir_a.path(), "cf").await;
        registry.insert("cf".into(), w.clone());

        assert!(registry.get_matching("cf", dir_a.path()).is_some());
        assert!(registry.get_matching("cf", dir_b.path()).is_none());
    }

    #[tokio::test]
    async fn insert_replaces_without_closing_old_instance() {
        let registry = Registry::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let old = writer_with_dir(dir_a.path(), "cf").await;
        registry.insert("cf".into(), old.clone());

        let new = writer_with_dir(dir_b.path(), "cf").await;
        registry.insert("cf".into(), new.clone());

        assert!(!old.is_stopped());
        assert!(Arc::ptr_eq(&registry.get_matching("cf", dir_b.path()).unwrap(), &new));
        assert!(registry.get_matching("cf", dir_a.path()).is_none());
    }

    #[tokio::test]
    async fn get_or_construct_serializes_concurrent_same_config_calls() {
        let registry = Arc::new(Registry::new());
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Arc::new(dir.path().to_path_buf());
        let build_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let dir_path = dir_path.clone();
            let build_count = build_count.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_or_construct("cf", &dir_path, || async {
                        build_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(writer_with_dir(&dir_path, "cf").await)
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        // Exactly one caller should have actually constructed an
        // instance; every other call must have observed the cached hit
        // under the same construct-lock critical section.
        assert_eq!(build_count.load(std::sync::atomic::Ordering::SeqCst), 1);
        for w in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], w));
        }
    }
}
