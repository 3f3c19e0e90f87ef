//! # Work Queue
//!
//! Deduplicating, rate-limited work queue coordinating at-most-one-in-flight
//! processing per key.
//!
//! The queue guarantees:
//!
//! - A key is never pending more than once, no matter how often it is added.
//! - A key being processed is not handed to a second worker; re-adds while
//!   in-flight are deferred and redelivered once the current processing
//!   finishes ([`RateLimitingQueue::done`]).
//! - Failed keys come back after an exponentially increasing, capped delay
//!   ([`RateLimitingQueue::add_rate_limited`]); a success resets the delay
//!   ([`RateLimitingQueue::forget`]).
//! - [`RateLimitingQueue::shut_down`] drains pending keys and then promptly
//!   releases every blocked [`RateLimitingQueue::get`] caller.
//!
//! All bookkeeping (pending deque, in-flight set, dirty set, failure
//! counters) lives behind a single mutex; none of it is exposed. Consumers
//! block on a [`Notify`] rather than polling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::observability::metrics;

/// Cap on the backoff exponent so the delay multiplication cannot overflow
const MAX_BACKOFF_SHIFT: u32 = 20;

#[derive(Debug)]
struct QueueState<T> {
    /// Keys waiting to be handed to a worker, in arrival order
    pending: VecDeque<T>,
    /// Membership set for `pending`
    queued: HashSet<T>,
    /// Keys currently held by a worker
    in_flight: HashSet<T>,
    /// Keys re-added while in-flight; redelivered on `done`
    dirty: HashSet<T>,
    /// Consecutive failure count per key, reset by `forget`
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited queue of opaque keys.
///
/// Cheap to share: wrap it in an [`Arc`] and hand clones to the event source
/// and every worker.
#[derive(Debug)]
pub struct RateLimitingQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a queue whose retry delay starts at `base_delay` and doubles
    /// per consecutive failure up to `max_delay`.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                dirty: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Insert `key` unless it is already pending.
    ///
    /// If `key` is currently in-flight it is marked dirty instead and comes
    /// back automatically after the in-flight processing completes. Adds are
    /// ignored once the queue is shutting down.
    pub fn add(&self, key: T) {
        {
            let mut state = self.state.lock().expect("queue mutex poisoned");
            if state.shutting_down || state.queued.contains(&key) {
                return;
            }
            if state.in_flight.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            state.queued.insert(key.clone());
            state.pending.push_back(key);
            metrics::set_queue_depth(state.pending.len());
        }
        self.notify.notify_one();
    }

    /// Blocking dequeue. Returns `None` once the queue has shut down and no
    /// pending keys remain; the returned key is marked in-flight and must be
    /// released with [`RateLimitingQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock().expect("queue mutex poisoned");
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    metrics::set_queue_depth(state.pending.len());
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        // Chain the wakeup so sibling workers see the rest.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    drop(state);
                    // Wake the next blocked worker so shutdown propagates.
                    self.notify.notify_one();
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark `key` as no longer in-flight. If it went dirty while being
    /// processed, it is re-queued immediately.
    pub fn done(&self, key: &T) {
        let readd = {
            let mut state = self.state.lock().expect("queue mutex poisoned");
            state.in_flight.remove(key);
            if state.dirty.remove(key) && !state.shutting_down {
                state.queued.insert(key.clone());
                state.pending.push_back(key.clone());
                metrics::set_queue_depth(state.pending.len());
                true
            } else {
                false
            }
        };
        if readd {
            self.notify.notify_one();
        }
    }

    /// Clear the failure counter for `key`. Call after a successful
    /// processing round so the next failure starts from the base delay.
    pub fn forget(&self, key: &T) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.failures.remove(key);
    }

    /// Re-add `key` after an exponentially increasing delay derived from its
    /// consecutive failure count. Call after a failed processing round.
    pub fn add_rate_limited(self: &Arc<Self>, key: T) {
        let delay = {
            let mut state = self.state.lock().expect("queue mutex poisoned");
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            self.backoff_for(*failures)
        };
        metrics::increment_queue_retries();
        debug!(key = ?key, delay_ms = delay.as_millis(), "requeueing after failure");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Stop accepting new keys and release all blocked
    /// [`RateLimitingQueue::get`] callers once the pending keys have drained.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock().expect("queue mutex poisoned");
            state.shutting_down = true;
        }
        self.notify.notify_waiters();
        // A worker between its state check and its wait registration misses
        // notify_waiters; the stored permit covers it.
        self.notify.notify_one();
    }

    /// Number of keys waiting to be dequeued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let delay = self.base_delay.saturating_mul(1_u32 << shift);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration as TokioDuration, Instant};

    fn queue() -> Arc<RateLimitingQueue<String>> {
        Arc::new(RateLimitingQueue::new(
            Duration::from_secs(1),
            Duration::from_secs(300),
        ))
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending_keys() {
        let q = queue();
        q.add("default/a".to_string());
        q.add("default/a".to_string());
        q.add("default/a".to_string());

        assert_eq!(q.len(), 1);
        let key = q.get().await.expect("queue should not be shut down");
        assert_eq!(key, "default/a");
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn test_add_while_in_flight_defers_until_done() {
        let q = queue();
        q.add("default/a".to_string());
        let key = q.get().await.expect("first get");

        // Key is in-flight; a re-add must not create a second pending copy.
        q.add("default/a".to_string());
        assert_eq!(q.len(), 0);

        q.done(&key);
        // The deferred add is redelivered immediately after done.
        assert_eq!(q.len(), 1);
        let again = q.get().await.expect("redelivery");
        assert_eq!(again, "default/a");
    }

    #[tokio::test]
    async fn test_done_without_dirty_does_not_requeue() {
        let q = queue();
        q.add("default/a".to_string());
        let key = q.get().await.expect("get");
        q.done(&key);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_yield_single_delivery() {
        let q = queue();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                q.add("default/a".to_string());
            }));
        }
        for handle in handles {
            handle.await.expect("add task");
        }

        assert_eq!(q.len(), 1);
        let key = q.get().await.expect("get");
        q.done(&key);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_doubles_then_resets() {
        let q = queue();

        // First failure: base delay.
        let start = Instant::now();
        q.add_rate_limited("default/a".to_string());
        let key = q.get().await.expect("first retry");
        assert_eq!(start.elapsed(), TokioDuration::from_secs(1));
        q.done(&key);

        // Second consecutive failure: doubled.
        let start = Instant::now();
        q.add_rate_limited("default/a".to_string());
        let key = q.get().await.expect("second retry");
        assert_eq!(start.elapsed(), TokioDuration::from_secs(2));
        q.done(&key);

        // Third: doubled again.
        let start = Instant::now();
        q.add_rate_limited("default/a".to_string());
        let key = q.get().await.expect("third retry");
        assert_eq!(start.elapsed(), TokioDuration::from_secs(4));
        q.done(&key);

        // Success resets the counter back to the base delay.
        q.forget(&key);
        let start = Instant::now();
        q.add_rate_limited("default/a".to_string());
        let key = q.get().await.expect("post-reset retry");
        assert_eq!(start.elapsed(), TokioDuration::from_secs(1));
        q.done(&key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_caps_at_max_delay() {
        let q = queue();
        // Walk the key up the backoff curve: 1s, 2s, 4s, ... capped at 300s.
        let mut last = TokioDuration::ZERO;
        for round in 0..10 {
            let start = Instant::now();
            q.add_rate_limited("default/a".to_string());
            let key = q.get().await.expect("retry");
            let elapsed = start.elapsed();
            q.done(&key);
            if round > 0 && last < TokioDuration::from_secs(300) {
                assert!(elapsed > last, "backoff must increase until the cap");
            }
            assert!(elapsed <= TokioDuration::from_secs(300));
            last = elapsed;
        }
        assert_eq!(last, TokioDuration::from_secs(300));
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_getters() {
        let q = queue();
        let mut getters = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            getters.push(tokio::spawn(async move { q.get().await }));
        }
        // Give the getters a chance to block.
        tokio::task::yield_now().await;
        q.shut_down();

        for getter in getters {
            let result = timeout(TokioDuration::from_secs(5), getter)
                .await
                .expect("getter must unblock promptly")
                .expect("getter task");
            assert!(result.is_none());
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_before_signalling() {
        let q = queue();
        q.add("default/a".to_string());
        q.add("default/b".to_string());
        q.shut_down();

        assert_eq!(q.get().await, Some("default/a".to_string()));
        assert_eq!(q.get().await, Some("default/b".to_string()));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_adds_after_shutdown_are_ignored() {
        let q = queue();
        q.shut_down();
        q.add("default/a".to_string());
        assert_eq!(q.len(), 0);
        assert_eq!(q.get().await, None);
    }
}
