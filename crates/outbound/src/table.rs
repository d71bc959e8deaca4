//! Destination queue table.
//!
//! Maps each destination key to its own FIFO plus the rate-limiter counters
//! for that destination. Emptied queues are parked in a bounded reuse pool so
//! repeated traffic to a small set of chats does not keep reallocating.
//!
//! Only the scheduler thread touches the table; nothing here is synchronized.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use courier_core::DestinationKey;

use crate::deque::Deque;

/// Per-destination FIFO and limiter state.
#[derive(Debug)]
pub struct DestinationQueue<T> {
    jobs: Deque<T>,
    /// Approved sends whose cleanup rule has not expired yet.
    sent: u32,
    last_activity: Instant,
    /// When this queue was last handed out for its current key.
    created_at: Instant,
    /// Position in the table's scan order.
    slot: usize,
}

impl<T> DestinationQueue<T> {
    fn new(capacity: usize, now: Instant) -> Self {
        Self {
            jobs: Deque::with_capacity(capacity),
            sent: 0,
            last_activity: now,
            created_at: now,
            slot: 0,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.jobs.clear();
        self.sent = 0;
        self.last_activity = now;
        self.created_at = now;
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn push_back(&mut self, job: T) {
        self.jobs.push_back(job);
    }

    /// Retried jobs go back to the front so they precede newer jobs.
    pub fn push_front(&mut self, job: T) {
        self.jobs.push_front(job);
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.jobs.pop_front()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub(crate) fn increment_sent(&mut self) {
        self.sent = self.sent.saturating_add(1);
    }

    pub(crate) fn decrement_sent(&mut self) {
        self.sent = self.sent.saturating_sub(1);
    }
}

/// All destination queues known to the scheduler.
#[derive(Debug)]
pub struct QueueTable<T> {
    queues: HashMap<DestinationKey, DestinationQueue<T>>,
    /// Scan order; `queues[k].slot` is the index of `k` here.
    order: Vec<DestinationKey>,
    cursor: usize,
    pool: Vec<DestinationQueue<T>>,
    pool_capacity: usize,
    queue_capacity: usize,
    lifetime: Duration,
}

impl<T> QueueTable<T> {
    pub fn new(lifetime: Duration, pool_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            order: Vec::new(),
            cursor: 0,
            pool: Vec::with_capacity(pool_capacity),
            pool_capacity,
            queue_capacity,
            lifetime,
        }
    }

    /// Apply new sizing to an existing table. Registered queues and their
    /// counters stay; the pool is trimmed to the new bound.
    pub fn reconfigure(&mut self, lifetime: Duration, pool_capacity: usize, queue_capacity: usize) {
        self.lifetime = lifetime;
        self.pool_capacity = pool_capacity;
        self.queue_capacity = queue_capacity;
        self.pool.truncate(pool_capacity);
    }

    /// Number of registered destinations.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queues parked for reuse.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// True when at least one destination still holds a job.
    pub fn has_pending(&self) -> bool {
        self.queues.values().any(|q| !q.is_empty())
    }

    pub fn pending_jobs(&self) -> usize {
        self.queues.values().map(DestinationQueue::len).sum()
    }

    pub fn get(&self, key: DestinationKey) -> Option<&DestinationQueue<T>> {
        self.queues.get(&key)
    }

    pub fn get_mut(&mut self, key: DestinationKey) -> Option<&mut DestinationQueue<T>> {
        self.queues.get_mut(&key)
    }

    /// Existing queue for `key`, else a pooled one (cleared first), else a
    /// fresh allocation.
    pub fn get_or_create(&mut self, key: DestinationKey, now: Instant) -> &mut DestinationQueue<T> {
        match self.queues.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut queue = match self.pool.pop() {
                    Some(mut pooled) => {
                        pooled.reset(now);
                        pooled
                    }
                    None => DestinationQueue::new(self.queue_capacity, now),
                };
                queue.slot = self.order.len();
                self.order.push(key);
                entry.insert(queue)
            }
        }
    }

    /// Remove `key` when forced, or when it has been idle longer than the
    /// queue lifetime plus `decay`. Returns whether the queue was removed.
    pub fn delete(&mut self, key: DestinationKey, now: Instant, force: bool, decay: Duration) -> bool {
        let Some(queue) = self.queues.get(&key) else {
            return false;
        };

        let idle = now.saturating_duration_since(queue.last_activity);
        if !force && idle <= self.lifetime + decay {
            return false;
        }

        let Some(mut queue) = self.queues.remove(&key) else {
            return false;
        };

        let slot = queue.slot;
        self.order.swap_remove(slot);
        if let Some(moved) = self.order.get(slot).copied() {
            if let Some(moved_queue) = self.queues.get_mut(&moved) {
                moved_queue.slot = slot;
            }
        }

        queue.reset(now);
        if self.pool.len() < self.pool_capacity {
            self.pool.push(queue);
        }
        true
    }

    /// Find the next destination that has a job and passes `allowed`,
    /// releasing expired empty queues on the way.
    ///
    /// The scan resumes after the previously selected destination, so a busy
    /// destination does not permanently shadow the ones behind it. Each
    /// destination is looked at most once per call.
    pub fn next_ready<A, D>(&mut self, now: Instant, allowed: A, decay: D) -> Option<DestinationKey>
    where
        A: Fn(DestinationKey, &DestinationQueue<T>) -> bool,
        D: Fn(DestinationKey) -> Duration,
    {
        let total = self.order.len();
        for _ in 0..total {
            if self.order.is_empty() {
                break;
            }
            let idx = self.cursor % self.order.len();
            let key = self.order[idx];
            let Some(queue) = self.queues.get(&key) else {
                self.cursor = idx + 1;
                continue;
            };

            if queue.is_empty() {
                // On removal the last key moves into `idx`; look there next.
                if !self.delete(key, now, false, decay(key)) {
                    self.cursor = idx + 1;
                }
                continue;
            }

            self.cursor = idx + 1;
            if allowed(key, queue) {
                return Some(key);
            }
        }
        None
    }
}
