// De-duplicating work queue for reconciliation keys
//
// A key is held by at most one worker at a time. Adding a key that is already
// queued is a no-op; adding a key that is being processed marks it dirty and
// it is queued again when the worker calls `done`.

use crate::retry::ExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, queued or not
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Consecutive failures per key
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

/// Work queue with per-key exponential requeue backoff
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Queue a key for processing
    pub fn add(&self, key: K) {
        let mut state = self.lock_state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(key = ?key, "Key in flight, marked dirty");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue a key once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue a key after its backoff delay and count the failure
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let attempt = {
            let mut state = self.lock_state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        self.add_after(key, self.backoff.next_delay(attempt));
    }

    /// Clear the failure count of a key
    pub fn forget(&self, key: &K) {
        self.lock_state().failures.remove(key);
    }

    /// Number of consecutive failures recorded for a key
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock_state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key, `None` once the queue shuts down
    ///
    /// The caller owns the key until it calls `done`.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent add or shutdown is not missed
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key handed out by `get`, requeueing it if it was re-added
    pub fn done(&self, key: K) {
        let mut state = self.lock_state();
        state.processing.remove(&key);
        if state.dirty.contains(&key) && !state.shutting_down {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.lock_state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_state().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(ExponentialBackoff::with_config(
            Duration::from_millis(10),
            Duration::from_millis(100),
            0.0,
        )))
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_collapsed() {
        let queue = queue();
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_flight_is_not_handed_out_twice() {
        let queue = queue();
        queue.add("a".to_string());
        let key = queue.get().await.unwrap();

        // Re-added while processing: held back until done
        queue.add("a".to_string());
        assert!(queue.is_empty());

        queue.done(key);
        assert_eq!(queue.len(), 1);
        let again = queue.get().await.unwrap();
        assert_eq!(again, "a");
        queue.done(again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add("late".to_string());

        let key = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_all_waiters() {
        let queue = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();
        assert!(queue.is_shutting_down());

        for waiter in waiters {
            let key = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(key, None);
        }

        queue.add("ignored".to_string());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_after_delays_key() {
        let queue = queue();
        queue.add_after("later".to_string(), Duration::from_millis(50));
        assert!(queue.is_empty());

        let key = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("later"));
    }

    #[tokio::test]
    async fn test_rate_limited_counts_failures_until_forgotten() {
        let queue = queue();
        let key = "flaky".to_string();

        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);

        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(got.as_ref(), Some(&key));

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }
}
