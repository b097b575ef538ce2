//! Deduplicating work queue with rate-limited requeue
//!
//! Semantics:
//! - An item is in at most one of "waiting" or "processing" at a time. Adding
//!   an item that is already waiting is a no-op; adding an item that is being
//!   processed marks it dirty and it is queued again when [`done`] is called.
//! - [`get`] hands out items in FIFO order and resolves to `None` once the
//!   queue is shut down and drained.
//!
//! [`done`]: RateLimitingQueue::done
//! [`get`]: RateLimitingQueue::get

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::rate_limiter::RateLimiter;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

/// A work queue of keys with per-key backoff.
///
/// Cloning is cheap; all clones share the same queue.
pub struct RateLimitingQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create a named queue using the given rate limiter
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Queue name, for logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add an item unless it is already waiting
    pub fn add(&self, item: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = %self.inner.name, ?item, "item in flight, marked dirty");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add an item once `delay` has elapsed
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add an item after the delay chosen by the rate limiter
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.inner.limiter.when(&item);
        trace!(queue = %self.inner.name, ?item, delay_ms = delay.as_millis(), "rate limited add");
        self.add_after(item, delay);
    }

    /// Reset the rate limiter history of an item
    pub fn forget(&self, item: &K) {
        self.inner.limiter.forget(item);
    }

    /// Number of times the item has been requeued since it was last forgotten
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shut down and no items are left. The
    /// caller owns the returned item until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent add or shutdown is not missed
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so sibling workers see the rest
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark processing of an item finished.
    ///
    /// If the item was added again while it was processed, it is queued now.
    pub fn done(&self, item: &K) {
        let mut state = self.inner.state.lock();
        if !state.processing.remove(item) {
            return;
        }
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting items and wake every waiting [`get`](Self::get)
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no items are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
