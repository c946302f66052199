//! Deduplicating, rate-limited work queue
//!
//! Keys move through these states:
//!
//! - **queued**: waiting in `queue` (and present in `dirty`)
//! - **processing**: handed out by [`WorkQueue::next`], not yet [`WorkQueue::done`]
//! - **dirty while processing**: re-added during processing; replayed once on `done`
//! - **retry scheduled**: a timer will re-add the key after its backoff delay
//!
//! A key is never handed to two workers at once, and any number of adds while
//! a key is queued or processing collapse into a single pending pass.

mod rate_limiter;

pub use rate_limiter::{
    BackoffConfig, ItemExponentialBackoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY,
};

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    limiter: Mutex<ItemExponentialBackoff<K>>,
    notify: Notify,
}

/// Work queue of reconciliation keys
///
/// Cloning is cheap and every clone refers to the same queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a named queue with the default backoff (200ms doubling to 1000s)
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, BackoffConfig::default())
    }

    /// Create a named queue with custom backoff settings
    pub fn with_backoff(name: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                limiter: Mutex::new(ItemExponentialBackoff::new(backoff)),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Mark `key` as needing processing
    ///
    /// No-op if the key is already pending. If the key is being processed it
    /// is remembered and handed out again after [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            trace!(queue = %self.shared.name, ?key, "Key already pending");
            return;
        }
        if state.processing.contains(&key) {
            trace!(queue = %self.shared.name, ?key, "Key in flight, deferring");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down. Every `Some(key)` must be
    /// paired with exactly one call to [`WorkQueue::done`].
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before inspecting state so a wakeup between
            // the check and the await is not lost.
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
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

    /// Release `key` after processing
    ///
    /// If the key was added again while it was processing, it goes back on
    /// the queue exactly once.
    pub fn done(&self, key: &K) {
        let mut state = self.shared.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Re-add `key` after its backoff delay
    ///
    /// Consecutive calls for the same key grow the delay until [`WorkQueue::forget`].
    /// Returns the delay that was scheduled.
    pub fn retry_later(&self, key: K) -> Duration {
        let delay = self.shared.limiter.lock().when(&key);
        self.add_after(key, delay);
        delay
    }

    /// Re-add `key` once `delay` has elapsed
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        debug!(queue = %self.shared.name, ?key, delay_ms = delay.as_millis() as u64, "Scheduling retry");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clear the failure history for `key`
    pub fn forget(&self, key: &K) {
        self.shared.limiter.lock().forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.limiter.lock().num_requeues(key)
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// True if no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker
    ///
    /// Keys already being processed may still call [`WorkQueue::done`].
    pub fn shut_down(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new("test")
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.next().await.as_deref(), Some("a"));
        assert_eq!(q.next().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_replays_once() {
        let q = queue();
        q.add("a".to_string());
        let key = q.next().await.unwrap();

        // Two adds while in flight coalesce into one follow-up pass
        q.add("a".to_string());
        q.add("a".to_string());
        assert!(q.is_empty(), "in-flight key must not be handed out again");

        q.done(&key);
        assert_eq!(q.len(), 1);
        let again = q.next().await.unwrap();
        assert_eq!(again, "a");
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let q = queue();
        q.add("a".to_string());
        let key = q.next().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_next_waits_for_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;
        q.add("late".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.next().await })
            })
            .collect();
        tokio::task::yield_now().await;

        q.shut_down();
        for w in waiters {
            assert_eq!(w.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_handing_out_pending_keys() {
        let q = queue();
        q.add("a".to_string());
        q.shut_down();
        assert_eq!(q.next().await, None);

        q.add("b".to_string());
        assert_eq!(q.len(), 1, "adds after shutdown are dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_later_redelivers_after_backoff() {
        let q = queue();
        q.add("a".to_string());
        let key = q.next().await.unwrap();

        let delay = q.retry_later(key.clone());
        assert_eq!(delay, DEFAULT_BASE_DELAY);
        q.done(&key);
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(199)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_forget_resets() {
        let q = queue();
        let k = "a".to_string();

        let d1 = q.retry_later(k.clone());
        let d2 = q.retry_later(k.clone());
        let d3 = q.retry_later(k.clone());
        assert!(d1 <= d2 && d2 <= d3);
        assert_eq!(d3, Duration::from_millis(800));
        assert_eq!(q.num_requeues(&k), 3);

        q.forget(&k);
        assert_eq!(q.num_requeues(&k), 0);
        assert_eq!(q.retry_later(k), DEFAULT_BASE_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_during_processing_coalesces() {
        let q = queue();
        q.add("a".to_string());
        let key = q.next().await.unwrap();

        q.add_after(key.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.is_empty(), "timer fired while in flight, must wait for done");

        q.done(&key);
        assert_eq!(q.len(), 1);
    }
}
