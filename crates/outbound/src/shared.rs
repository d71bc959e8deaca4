//! State shared between producers, the scheduler and the completion workers.
//!
//! One mutex guards the intake buffer, the completion queue, the control
//! flags and the statistics. It is held only for short bulk moves, never
//! across a backend call or a user callback.

use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::backend::Backend;
use crate::config::PipelineConfig;
use crate::deque::Deque;
use crate::job::DeliveryJob;

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    /// Shutdown requested; draining before exit.
    Stopping,
    Stopped,
}

/// Pipeline counters.
///
/// The scheduler and the workers fold their local counts in whenever they
/// take the shared lock, so a snapshot can trail the real numbers by one
/// tick or one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub dropped: u64,
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    /// Unlimited-retry jobs that crossed the overflow threshold.
    pub retry_overflows: u64,
    pub callback_failures: u64,
    pub transaction_failures: u64,
    pub restarts: u64,
}

impl PipelineStats {
    pub(crate) fn absorb(&mut self, delta: &mut PipelineStats) {
        let delta = mem::take(delta);
        self.submitted += delta.submitted;
        self.dropped += delta.dropped;
        self.attempts += delta.attempts;
        self.delivered += delta.delivered;
        self.failed += delta.failed;
        self.retried += delta.retried;
        self.retry_overflows += delta.retry_overflows;
        self.callback_failures += delta.callback_failures;
        self.transaction_failures += delta.transaction_failures;
        self.restarts += delta.restarts;
    }
}

pub(crate) struct SharedState<B: Backend> {
    pub intake: Deque<DeliveryJob<B>>,
    pub completions: Deque<DeliveryJob<B>>,
    pub status: PipelineStatus,
    /// Configuration waiting to be applied by a restart.
    pub restart: Option<PipelineConfig>,
    /// Tells the current worker generation to exit once completions are empty.
    pub workers_exit: bool,
    pub live_workers: usize,
    pub stats: PipelineStats,
}

pub(crate) struct Shared<B: Backend> {
    state: Mutex<SharedState<B>>,
    completions_ready: Condvar,
}

impl<B: Backend> Shared<B> {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            state: Mutex::new(SharedState {
                intake: Deque::with_capacity(config.intake_capacity),
                completions: Deque::with_capacity(config.completion_capacity),
                status: PipelineStatus::Running,
                restart: None,
                workers_exit: false,
                live_workers: 0,
                stats: PipelineStats::default(),
            }),
            completions_ready: Condvar::new(),
        }
    }

    /// Lock the shared state.
    ///
    /// A panic while holding the lock cannot leave the queues half-moved, so a
    /// poisoned lock is simply taken over.
    pub fn lock(&self) -> MutexGuard<'_, SharedState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a completion worker until work arrives or `timeout` elapses.
    pub fn wait_for_completions<'a>(
        &self,
        guard: MutexGuard<'a, SharedState<B>>,
        timeout: Duration,
    ) -> MutexGuard<'a, SharedState<B>> {
        match self.completions_ready.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub fn notify_one_worker(&self) {
        self.completions_ready.notify_one();
    }

    pub fn notify_all_workers(&self) {
        self.completions_ready.notify_all();
    }

    /// Append jobs to the intake buffer, or drop them when not running.
    ///
    /// Refused jobs are dropped after the lock is released.
    pub fn submit(&self, jobs: Vec<DeliveryJob<B>>) {
        let mut state = self.lock();
        if state.status == PipelineStatus::Running {
            state.stats.submitted += jobs.len() as u64;
            state.intake.extend(jobs);
            return;
        }

        state.stats.dropped += jobs.len() as u64;
        let status = state.status;
        drop(state);
        debug!(count = jobs.len(), ?status, "pipeline not running; submission dropped");
    }

    pub fn stats(&self) -> PipelineStats {
        self.lock().stats.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.lock().status
    }
}
