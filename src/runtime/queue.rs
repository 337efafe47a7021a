//! Rate-limited work queue with per-key serialization
//!
//! The queue guarantees that a key handed to one worker is never handed to
//! another until the first worker calls [`WorkQueue::done`]. An add that
//! arrives while the key is being processed marks it dirty, and `done`
//! moves it back onto the ready list, so every event observed during a
//! sync results in at least one more sync.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::Key;

/// First retry delay for a failing key
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound on the per-key retry delay
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Work queue feeding a controller's workers
///
/// Keys move through Idle -> Queued -> Running -> (Idle | Queued).
/// Adding an already-queued key is a no-op; adding a running key re-queues
/// it once the current run completes.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    ready: VecDeque<Key>,
    dirty: HashSet<Key>,
    processing: HashSet<Key>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    failures: HashMap<Key, u32>,
    shut_down: bool,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct DelayedEntry {
    due: Instant,
    key: Key,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: BinaryHeap::new(),
                failures: HashMap::new(),
                shut_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Schedule a key for processing as soon as a worker is free
    pub fn add(&self, key: Key) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        Self::add_locked(&mut inner, key);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn add_locked(inner: &mut Inner, key: Key) {
        if inner.shut_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if !inner.processing.contains(&key) {
            inner.ready.push_back(key);
        }
    }

    /// Schedule a key for processing after the given delay
    pub fn add_after(&self, key: Key, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        if inner.shut_down {
            return;
        }
        inner.delayed.push(Reverse(DelayedEntry {
            due: Instant::now() + delay,
            key,
        }));
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Schedule a key with exponential backoff based on its failure count
    ///
    /// Each call counts as one more failure; [`WorkQueue::forget`] resets
    /// the count.
    pub fn add_rate_limited(&self, key: Key) {
        let delay = {
            let mut inner = self.inner.lock().expect("work queue lock poisoned");
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let delay = backoff_for(*failures);
            *failures += 1;
            delay
        };
        self.add_after(key, delay);
    }

    /// Number of times the key has been re-queued with backoff since it was
    /// last forgotten
    pub fn failures(&self, key: &Key) -> u32 {
        let inner = self.inner.lock().expect("work queue lock poisoned");
        inner.failures.get(key).copied().unwrap_or(0)
    }

    /// Reset the failure count for a key
    pub fn forget(&self, key: &Key) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        inner.failures.remove(key);
    }

    /// Mark a key as no longer being processed
    ///
    /// If events arrived for the key while it was running, it is moved back
    /// onto the ready list.
    pub fn done(&self, key: &Key) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.ready.push_back(key.clone());
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Stop handing out keys; blocked [`WorkQueue::get`] calls return `None`
    pub fn shut_down(&self) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        inner.shut_down = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Wait for the next key that is ready to be processed
    ///
    /// Returns `None` once the queue has been shut down. The returned key
    /// is marked as processing; the caller must call [`WorkQueue::done`]
    /// when finished with it.
    pub async fn get(&self) -> Option<Key> {
        loop {
            // Register for wakeups before inspecting the queue, so an add
            // racing with the check below cannot be lost.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let next_deadline = {
                let mut inner = self.inner.lock().expect("work queue lock poisoned");

                let now = Instant::now();
                while inner
                    .delayed
                    .peek()
                    .is_some_and(|Reverse(entry)| entry.due <= now)
                {
                    let entry = inner.delayed.pop().expect("peeked entry exists").0;
                    Self::add_locked(&mut inner, entry.key);
                }

                if let Some(key) = inner.ready.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }

                if inner.shut_down {
                    return None;
                }

                inner.delayed.peek().map(|Reverse(entry)| entry.due)
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Exponential backoff for the nth consecutive failure of a key
fn backoff_for(failures: u32) -> Duration {
    let shifted = BASE_DELAY
        .as_nanos()
        .saturating_mul(1u128 << failures.min(48));
    let capped = shifted.min(MAX_DELAY.as_nanos());
    Duration::from_nanos(capped as u64)
}
