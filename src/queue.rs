//! A deduplicating work queue of reconcile keys with per-key retry backoff.
//!
//! A key is either *dirty* (waiting to be handed out) or *processing* (handed out by [`WorkQueue::get`]
//! and not yet marked [`WorkQueue::done`]), or both. Adding a key that is processing only marks it dirty,
//! it is queued again once the current attempt is done. So a key is never handed out twice at the
//! same time, no matter how many consumers call `get`.

use crate::rate_limiter::{
    BackoffConfig,
    RateLimiter,
};
use parking_lot::Mutex;
use std::{
    collections::{
        HashSet,
        VecDeque,
    },
    sync::Arc,
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The key was appended to the queue.
    Queued,
    /// The key is being processed, it will be queued again when the attempt is done.
    Deferred,
    /// The key was already waiting.
    Coalesced,
    /// The queue is at capacity, nothing changed.
    Full,
    /// The queue is shutting down, nothing changed.
    ShuttingDown,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    capacity: Option<usize>,
    state: Mutex<State>,
    limiter: Mutex<RateLimiter>,
    item_ready: Notify,
    space_ready: Notify,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    capacity_suspended: bool,
    shutting_down: bool,
}

impl WorkQueue {
    /// `capacity` bounds the number of waiting keys, `None` means unbounded.
    pub fn new(name: impl Into<String>, backoff: &BackoffConfig, capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                capacity: capacity.map(|c| c.max(1)),
                state: Mutex::new(State::default()),
                limiter: Mutex::new(RateLimiter::new(backoff)),
                item_ready: Notify::new(),
                space_ready: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Adds `key`, waiting for a free slot if the queue is at capacity. Returns immediately if the key
    /// is already waiting or the queue shuts down.
    pub async fn add(&self, key: impl Into<String>) -> AddOutcome {
        let key = key.into();
        loop {
            let space = self.inner.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_add(&key) {
                AddOutcome::Full => {
                    trace!(queue = %self.inner.name, %key, "queue is full, waiting for a free slot");
                    space.await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Adds `key` without waiting. Returns [`AddOutcome::Full`] if there is no room for it.
    pub fn try_add(&self, key: &str) -> AddOutcome {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return AddOutcome::ShuttingDown;
        }
        if state.dirty.contains(key) {
            return AddOutcome::Coalesced;
        }
        let bounded = !state.capacity_suspended;
        if bounded && self.inner.capacity.is_some_and(|capacity| state.dirty.len() >= capacity) {
            return AddOutcome::Full;
        }

        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return AddOutcome::Deferred;
        }
        state.queue.push_back(key.to_string());
        drop(state);

        self.inner.item_ready.notify_one();
        AddOutcome::Queued
    }

    /// Waits for the next key. Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let ready = self.inner.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    drop(state);

                    self.inner.space_ready.notify_waiters();
                    return Some(key);
                }
            }

            ready.await;
        }
    }

    /// Marks the current attempt for `key` as finished. If the key was added in the meantime it
    /// becomes available again.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.item_ready.notify_one();
        }
    }

    /// Adds `key` again after `delay`. The pending add is dropped if the queue shuts down first.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() && self.try_add(&key) != AddOutcome::Full {
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.add(key).await;
                }
            }
        });
    }

    /// Adds `key` again after its backoff delay, which grows with every consecutive call until
    /// [`WorkQueue::forget`] is called for the key.
    pub fn add_with_backoff(&self, key: &str) -> Duration {
        let delay = self.inner.limiter.lock().when(key);
        self.add_after(key, delay);
        delay
    }

    /// Resets the failure count of `key`.
    pub fn forget(&self, key: &str) {
        self.inner.limiter.lock().forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.limiter.lock().num_requeues(key)
    }

    /// Lifts the capacity bound until [`WorkQueue::resume_capacity`] is called. While nothing takes keys
    /// out of the queue a bound would only block producers forever.
    pub fn suspend_capacity(&self) {
        self.inner.state.lock().capacity_suspended = true;
        self.inner.space_ready.notify_waiters();
    }

    pub fn resume_capacity(&self) {
        self.inner.state.lock().capacity_suspended = false;
    }

    /// Number of keys handed out by `get` and not yet marked done.
    pub fn processing(&self) -> usize {
        self.inner.state.lock().processing.len()
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Stops the queue: blocked and future `get` calls return `None`, blocked `add` calls return, and
    /// delayed adds are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!(queue = %self.inner.name, "shutting down work queue");
        self.inner.shutdown.cancel();
        self.inner.item_ready.notify_waiters();
        self.inner.space_ready.notify_waiters();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}
