//! Single-threaded scheduler.
//!
//! Owns the destination queue table and the rate limiter. Each tick it moves
//! the intake buffer into the table, picks one eligible destination, sends
//! the job at its head, routes the outcome, and sweeps expired limiter rules.

use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use courier_core::DestinationKey;

use crate::backend::{Backend, SendFailure};
use crate::config::PipelineConfig;
use crate::deque::Deque;
use crate::job::{DeliveryJob, RetryBudget};
use crate::limiter::RateLimiter;
use crate::shared::{PipelineStats, PipelineStatus, Shared};
use crate::table::QueueTable;

/// Why the scheduler loop returned.
#[derive(Debug)]
pub(crate) enum SchedulerExit {
    Stop,
    Restart(PipelineConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Stop,
    Restart,
}

pub(crate) struct Scheduler<B: Backend> {
    config: PipelineConfig,
    shared: Arc<Shared<B>>,
    backend: Arc<B>,
    table: QueueTable<DeliveryJob<B>>,
    limiter: RateLimiter,
    /// Swapped with the shared intake buffer so the lock is held for O(1).
    inbox: Deque<DeliveryJob<B>>,
    stats: PipelineStats,
}

impl<B: Backend> Scheduler<B> {
    pub fn new(config: PipelineConfig, shared: Arc<Shared<B>>, backend: Arc<B>) -> Self {
        let table = QueueTable::new(
            config.queue_lifetime,
            config.reuse_pool_size,
            config.destination_queue_capacity,
        );
        let limiter = RateLimiter::new(&config.limiter, config.cleanup_capacity);
        let inbox = Deque::with_capacity(config.intake_capacity);

        Self {
            config,
            shared,
            backend,
            table,
            limiter,
            inbox,
            stats: PipelineStats::default(),
        }
    }

    /// Carry the table and limiter into the next generation under `config`.
    ///
    /// Send counters and cleanup rules survive, so a destination that used up
    /// its budget right before a restart still waits out its window.
    pub fn reconfigure(&mut self, config: PipelineConfig) {
        self.table.reconfigure(
            config.queue_lifetime,
            config.reuse_pool_size,
            config.destination_queue_capacity,
        );
        self.limiter.reconfigure(&config.limiter);
        debug!(
            pipeline = %config.name,
            destinations = self.table.len(),
            pending_rules = self.limiter.pending_rules(),
            "scheduler state carried over"
        );
        self.config = config;
    }

    /// Run until a stop or restart request has been fully drained.
    pub fn run(&mut self) -> SchedulerExit {
        info!(
            pipeline = %self.config.name,
            pacing_ms = self.config.pacing_interval.as_millis() as u64,
            limiter = self.limiter.is_enabled(),
            "scheduler started"
        );

        let exit = loop {
            let tick = Instant::now();

            if let Some(exit) = self.take_intake(tick) {
                break exit;
            }

            let dispatched = self.dispatch(tick);

            let freed = self.limiter.sweep(&mut self.table, Instant::now());
            if freed > 0 {
                trace!(freed, pending_rules = self.limiter.pending_rules(), "limiter sweep");
            }

            self.pace(tick, dispatched);
        };

        self.shared.lock().stats.absorb(&mut self.stats);
        info!(pipeline = %self.config.name, exit = ?exit, "scheduler stopped");
        exit
    }

    /// Check the control flags and move the intake buffer into the table.
    ///
    /// While a restart is pending the intake is left untouched for the next
    /// generation; a stop keeps draining because new submissions are already
    /// refused.
    fn take_intake(&mut self, now: Instant) -> Option<SchedulerExit> {
        let (control, completions_pending, abandoned) = {
            let mut state = self.shared.lock();
            state.stats.absorb(&mut self.stats);

            let control = if state.status == PipelineStatus::Stopping {
                Control::Stop
            } else if state.restart.is_some() {
                Control::Restart
            } else {
                Control::Run
            };
            if control != Control::Restart {
                mem::swap(&mut state.intake, &mut self.inbox);
            }
            // Only reachable when every worker failed to spawn.
            let abandoned = if control != Control::Run
                && state.live_workers == 0
                && !state.completions.is_empty()
            {
                Some(mem::take(&mut state.completions))
            } else {
                None
            };
            (control, !state.completions.is_empty(), abandoned)
        };

        if let Some(abandoned) = abandoned {
            error!(
                pipeline = %self.config.name,
                dropped = abandoned.len(),
                "no completion workers running; dropping finished jobs"
            );
        }

        let (retries, guard) = (self.config.default_retries, self.config.guard_callbacks);
        let mut drained = 0usize;
        while let Some(mut job) = self.inbox.pop_front() {
            job.apply_defaults(retries, guard);
            self.table.get_or_create(job.destination, now).push_back(job);
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, destinations = self.table.len(), "intake drained");
        }

        // Only the scheduler adds completions, so an empty queue observed
        // under the lock stays empty.
        if control == Control::Run || self.table.has_pending() || completions_pending {
            return None;
        }

        match control {
            Control::Stop => Some(SchedulerExit::Stop),
            Control::Restart => self.shared.lock().restart.take().map(SchedulerExit::Restart),
            Control::Run => None,
        }
    }

    /// Send the head job of one eligible destination. Returns whether a send
    /// was attempted.
    fn dispatch(&mut self, now: Instant) -> bool {
        let limiter = &self.limiter;
        let Some(key) = self.table.next_ready(
            now,
            |key, queue| limiter.allowed(key, queue),
            |key| limiter.window(key.kind()),
        ) else {
            return false;
        };

        let Some(mut job) = self.table.get_mut(key).and_then(|queue| {
            queue.touch(now);
            queue.pop_front()
        }) else {
            return false;
        };

        let attempt = job.begin_attempt();
        self.stats.attempts += 1;
        debug!(job_id = %job.id, destination = %key, attempt, "sending");

        match self.backend.send(&job.payload) {
            Ok(output) => self.delivered(key, job, output),
            Err(failure) => self.failed(key, job, failure, now),
        }
        true
    }

    fn delivered(&mut self, key: DestinationKey, mut job: DeliveryJob<B>, output: B::Output) {
        let sent_at = Instant::now();
        if let Some(queue) = self.table.get_mut(key) {
            self.limiter.approve(key, queue, sent_at);
        }

        self.backend.notify_send_ok(&job.context, &output);
        job.mark_delivered(output);
        self.stats.delivered += 1;
        debug!(job_id = %job.id, destination = %key, attempts = job.attempts(), "delivered");

        self.finish(job);
    }

    fn failed(
        &mut self,
        key: DestinationKey,
        mut job: DeliveryJob<B>,
        failure: SendFailure<B::Error>,
        now: Instant,
    ) {
        let is_final = failure.is_final();
        let error = failure.into_inner();

        if is_final || job.retries().is_exhausted() {
            warn!(
                job_id = %job.id,
                destination = %key,
                attempts = job.attempts(),
                is_final,
                error = %error,
                "delivery failed"
            );
            self.backend.notify_send_err(&job.context, &error);
            job.mark_failed(error);
            self.stats.failed += 1;
            self.finish(job);
            return;
        }

        if job.retries() == RetryBudget::Unlimited
            && job.attempts() == self.config.unlimited_retry_warn_threshold
        {
            warn!(
                job_id = %job.id,
                destination = %key,
                attempts = job.attempts(),
                error = %error,
                "unlimited retries crossed the overflow threshold"
            );
            self.stats.retry_overflows += 1;
        }

        debug!(
            job_id = %job.id,
            destination = %key,
            attempts = job.attempts(),
            retries = ?job.retries(),
            error = %error,
            "transient send failure; retrying"
        );
        job.record_retry(error);
        self.stats.retried += 1;
        self.table.get_or_create(key, now).push_front(job);
    }

    /// Hand a job with a terminal outcome to the completion workers, or drop
    /// it when there is nothing left to run.
    fn finish(&mut self, job: DeliveryJob<B>) {
        if !job.needs_completion() {
            trace!(job_id = %job.id, "no completion work");
            return;
        }

        self.shared.lock().completions.push_back(job);
        self.shared.notify_one_worker();
    }

    fn pace(&self, tick: Instant, dispatched: bool) {
        if !self.config.pacing_interval.is_zero() {
            if let Some(rest) = self.config.pacing_interval.checked_sub(tick.elapsed()) {
                thread::sleep(rest);
            }
        } else if !dispatched && !self.config.idle_wait.is_zero() {
            thread::sleep(self.config.idle_wait);
        }
    }
}
