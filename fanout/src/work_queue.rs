//! Deduplicating work queue for level-triggered reconciliation.
//!
//! - A key waiting in the queue is stored once, however often it is added.
//! - A key is handed to at most one worker at a time. Adding it while it is
//!   being processed marks it dirty; it is queued again when `done` is called.
//! - Failed keys are re-added after a per-key exponential backoff that resets
//!   on `forget`.

use crate::metrics_defs::QUEUE_DEPTH;
use indexmap::IndexSet;
use parking_lot::Mutex;
use shared::gauge;
use shared::retry::Backoff;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState<K> {
    pending: IndexSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: Backoff,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        WorkQueue {
            state: Mutex::new(QueueState {
                pending: IndexSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.pending.insert(key) {
            gauge!(QUEUE_DEPTH).set(state.pending.len() as f64);
            self.notify.notify_one();
        }
    }

    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-adds `key` after its backoff delay and returns that delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = {
            let mut state = self.state.lock();
            let attempts = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*attempts);
            *attempts = attempts.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
        delay
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.pending.shift_remove_index(0) {
                    state.processing.insert(key.clone());
                    gauge!(QUEUE_DEPTH).set(state.pending.len() as f64);
                    if !state.pending.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as no longer being processed.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.pending.insert(key.clone()) {
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<&'static str>> {
        Arc::new(WorkQueue::new(Backoff::new(
            Duration::from_millis(500),
            Duration::from_secs(4),
        )))
    }

    #[tokio::test]
    async fn test_dedup_and_order() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_deferred() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();

        q.add("a");
        assert!(q.is_empty(), "key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(500));
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(1));
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(2));
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(4));
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(4));
        assert_eq!(q.failures(&"a"), 5);

        q.forget(&"a");
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(500));

        // The delayed add lands once the timer fires
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_workers_each_get_a_key() {
        let q = queue();
        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..3 {
            let q = q.clone();
            workers.spawn(async move { q.get().await });
        }
        tokio::task::yield_now().await;

        q.add("a");
        q.add("b");
        q.add("c");

        let mut keys = Vec::new();
        while let Some(result) = workers.join_next().await {
            keys.push(result.unwrap().unwrap());
        }
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
