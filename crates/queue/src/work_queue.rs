//! `WorkQueue`: a de-duplicating, rate-limited queue of keys.
//!
//! Guarantees:
//! 1. A key sits in the queue at most once; re-adding a queued key is a no-op.
//! 2. A key handed out by [`WorkQueue::get`] is never handed to a second
//!    consumer until [`WorkQueue::done`] is called for it. Adds that arrive
//!    in the meantime are remembered and the key is re-queued on `done`.
//! 3. After [`WorkQueue::shut_down`], `get` returns `None` and adds are ignored.
//!
//! Ordering across distinct keys is FIFO in practice but not part of the
//! contract.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight).
    dirty: HashSet<K>,
    /// Keys currently held by a consumer.
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

/// Cheaply cloneable handle to a shared work queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Queue with the default controller rate limiter.
    pub fn new() -> Self {
        Self::with_rate_limiter(Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter,
            }),
        }
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            trace!(?key, "key already pending");
            return;
        }
        if state.processing.contains(&key) {
            // Re-queued by `done` once the current holder finishes.
            trace!(?key, "key in flight, deferring");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after the delay its rate limiter prescribes.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        debug!(?key, ?delay, "re-queueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the rate limiter's memory of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before the state check so an add racing with us
            // cannot slip between the check and the wait.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
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

    /// Release `key` after processing; re-queues it if it was re-added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys; wakes every waiting consumer.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
