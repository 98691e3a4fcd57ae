//! Coalescing persistence queue.
//!
//! `add` schedules an object for writing; scheduling the same object again
//! before the next flush is a no-op. `flush_immediate` bypasses the queue for
//! callers that need the record on disk before they continue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::lock;

pub trait Commitable: Send + Sync {
    fn descriptive_name(&self) -> String;

    /// Identity used for coalescing. Two handles to the same underlying
    /// object must return the same key.
    fn commit_key(&self) -> usize;

    fn write_to_disk(&self) -> Result<()>;
}

#[derive(Default)]
pub struct CommitManager {
    pending: Mutex<HashMap<usize, Arc<dyn Commitable>>>,
}

impl CommitManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, item: Arc<dyn Commitable>) {
        let mut pending = lock(&self.pending);
        pending.entry(item.commit_key()).or_insert(item);
    }

    pub fn remove(&self, key: usize) -> bool {
        lock(&self.pending).remove(&key).is_some()
    }

    pub fn is_pending(&self, key: usize) -> bool {
        lock(&self.pending).contains_key(&key)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Writes `item` now and drops any queued write for it.
    pub fn flush_immediate(&self, item: &dyn Commitable) -> Result<()> {
        self.remove(item.commit_key());
        item.write_to_disk()
    }

    /// Writes everything queued so far. Failures are logged; the object is
    /// written again on its next commit.
    pub fn flush_pending(&self) -> usize {
        let drained: Vec<Arc<dyn Commitable>> = {
            let mut pending = lock(&self.pending);
            pending.drain().map(|(_, v)| v).collect()
        };
        let mut written = 0;
        for item in drained {
            match item.write_to_disk() {
                Ok(()) => written += 1,
                Err(e) => error!("failed to write {}: {e}", item.descriptive_name()),
            }
        }
        if written > 0 {
            debug!("commit manager wrote {written} records");
        }
        written
    }

    /// Periodically flushes the queue until `shutdown` fires, then flushes
    /// one last time.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let m = Arc::clone(&manager);
                if let Err(e) = tokio::task::spawn_blocking(move || m.flush_pending()).await {
                    error!("commit flush task failed: {e}");
                }
            }
            let written = manager.flush_pending();
            info!("commit manager stopped, final flush wrote {written} records");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        id: usize,
        writes: AtomicUsize,
    }

    impl Commitable for Counter {
        fn descriptive_name(&self) -> String {
            format!("counter-{}", self.id)
        }

        fn commit_key(&self) -> usize {
            self.id
        }

        fn write_to_disk(&self) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter(id: usize) -> Arc<Counter> {
        Arc::new(Counter {
            id,
            writes: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_commits_coalesce() {
        let cm = CommitManager::new();
        let a = counter(1);
        let b = counter(2);
        cm.add(a.clone());
        cm.add(a.clone());
        cm.add(b.clone());
        assert_eq!(cm.pending_len(), 2);
        assert_eq!(cm.flush_pending(), 2);
        assert_eq!(a.writes.load(Ordering::SeqCst), 1);
        assert_eq!(cm.pending_len(), 0);
    }

    #[test]
    fn test_flush_immediate_dequeues() {
        let cm = CommitManager::new();
        let a = counter(1);
        cm.add(a.clone());
        cm.flush_immediate(a.as_ref()).unwrap();
        assert!(!cm.is_pending(1));
        assert_eq!(cm.flush_pending(), 0);
        assert_eq!(a.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flusher_writes_on_shutdown() {
        let cm = Arc::new(CommitManager::new());
        let token = CancellationToken::new();
        let handle = cm.spawn_flusher(Duration::from_secs(3600), token.clone());
        let a = counter(7);
        cm.add(a.clone());
        token.cancel();
        handle.await.unwrap();
        assert_eq!(a.writes.load(Ordering::SeqCst), 1);
    }
}
