//! Per-destination send budgets with delayed decrements.
//!
//! Every approved send bumps the destination's `sent` counter and leaves a
//! cleanup rule behind that expires one decay window later. A periodic sweep
//! walks the rules once, decrementing the counters of expired ones and
//! re-queueing the rest. The result is an approximate sliding-window counter
//! with O(1) amortized work per send, without a sorted timer structure.
//!
//! Runs on the single-threaded scheduler; nothing here is synchronized.

use std::time::{Duration, Instant};

use courier_core::{DestinationKey, DestinationType};

use crate::config::{LimiterConfig, TypeLimit};
use crate::deque::Deque;
use crate::table::{DestinationQueue, QueueTable};

/// Pending decrement for one approved send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupRule {
    pub key: DestinationKey,
    pub approved_at: Instant,
    pub expires_at: Instant,
}

/// Enforces `sent(key) < budget(type(key))`.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    limits: [TypeLimit; DestinationType::COUNT],
    rules: Deque<CleanupRule>,
}

impl RateLimiter {
    pub fn new(config: &LimiterConfig, rule_capacity: usize) -> Self {
        Self {
            enabled: config.enabled,
            limits: config.limits,
            rules: Deque::with_capacity(rule_capacity),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Swap in new limits, keeping the counters and rules already in flight.
    ///
    /// Outstanding rules keep the expiry they were issued with. Disabling
    /// stops new bookkeeping; sweeps keep retiring the existing rules.
    pub fn reconfigure(&mut self, config: &LimiterConfig) {
        self.enabled = config.enabled;
        self.limits = config.limits;
    }

    /// Decay window of a destination type.
    pub fn window(&self, kind: DestinationType) -> Duration {
        self.limits[kind.index()].window
    }

    pub fn budget(&self, kind: DestinationType) -> u32 {
        self.limits[kind.index()].budget
    }

    /// Outstanding cleanup rules.
    pub fn pending_rules(&self) -> usize {
        self.rules.len()
    }

    /// Whether `key` may send now.
    pub fn allowed<T>(&self, key: DestinationKey, queue: &DestinationQueue<T>) -> bool {
        !self.enabled || queue.sent() < self.budget(key.kind())
    }

    /// Account for one send to `key` made at `now`.
    pub fn approve<T>(&mut self, key: DestinationKey, queue: &mut DestinationQueue<T>, now: Instant) {
        if !self.enabled {
            return;
        }
        queue.increment_sent();
        queue.touch(now);
        self.rules.push_back(CleanupRule {
            key,
            approved_at: now,
            expires_at: now + self.window(key.kind()),
        });
    }

    /// Release the budget held by expired rules. Returns how many were freed.
    ///
    /// Only the rules present when the sweep starts are examined; unexpired
    /// ones go back to the end of the queue unchanged.
    pub fn sweep<T>(&mut self, table: &mut QueueTable<T>, now: Instant) -> usize {
        let mut freed = 0;
        for _ in 0..self.rules.len() {
            let Some(rule) = self.rules.pop_front() else {
                break;
            };
            if rule.expires_at <= now {
                // The queue may be gone, or released and created again since
                // the approval; neither holds this send any more.
                if let Some(queue) = table.get_mut(rule.key) {
                    if queue.created_at() <= rule.approved_at {
                        queue.decrement_sent();
                    }
                }
                freed += 1;
            } else {
                self.rules.push_back(rule);
            }
        }
        freed
    }
}
