//! Delivery jobs: one queued send with its callbacks and retry state.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::DestinationKey;

use crate::backend::Backend;

/// Unique delivery job identifier (for log correlation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How many more transient failures a job may absorb.
///
/// The integer form used in configuration maps negative values to
/// `Unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum RetryBudget {
    Limited(u32),
    Unlimited,
}

impl RetryBudget {
    pub fn is_exhausted(self) -> bool {
        matches!(self, RetryBudget::Limited(0))
    }

    /// Budget after one failed attempt. `Unlimited` stays unlimited.
    pub fn consume(self) -> Self {
        match self {
            RetryBudget::Limited(n) => RetryBudget::Limited(n.saturating_sub(1)),
            RetryBudget::Unlimited => RetryBudget::Unlimited,
        }
    }
}

impl From<i64> for RetryBudget {
    fn from(value: i64) -> Self {
        if value < 0 {
            RetryBudget::Unlimited
        } else {
            RetryBudget::Limited(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }
}

impl From<RetryBudget> for i64 {
    fn from(value: RetryBudget) -> Self {
        match value {
            RetryBudget::Limited(n) => n as i64,
            RetryBudget::Unlimited => -1,
        }
    }
}

/// Callback run after a successful send.
pub type SuccessCallback<B> = Box<
    dyn Fn(&<B as Backend>::Context, &<B as Backend>::Output) -> anyhow::Result<()> + Send + Sync,
>;

/// Callback run after a job failed for good.
pub type ErrorCallback<B> = Box<
    dyn Fn(&<B as Backend>::Context, &<B as Backend>::Error) -> anyhow::Result<()> + Send + Sync,
>;

/// Terminal result of a job, set exactly once by the scheduler.
#[derive(Debug)]
pub enum Outcome<R, E> {
    Pending,
    Delivered(R),
    Failed(E),
}

impl<R, E> Outcome<R, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// One queued delivery.
///
/// Built by producers, owned by whichever queue currently holds it, and
/// dropped after its callbacks ran.
pub struct DeliveryJob<B: Backend> {
    pub id: JobId,
    pub destination: DestinationKey,
    pub payload: B::Payload,
    /// Origin context, passed through unchanged to callbacks and backend hooks.
    pub context: Arc<B::Context>,
    pub created_at: DateTime<Utc>,
    on_success: Vec<SuccessCallback<B>>,
    on_error: Vec<ErrorCallback<B>>,
    /// `None` until intake resolves it against the pipeline default.
    retries: Option<RetryBudget>,
    guard_panics: Option<bool>,
    transactional: bool,
    attempts: u32,
    outcome: Outcome<B::Output, B::Error>,
    /// Error of the most recent transient failure.
    last_error: Option<B::Error>,
}

impl<B: Backend> DeliveryJob<B> {
    pub fn new(destination: DestinationKey, payload: B::Payload, context: Arc<B::Context>) -> Self {
        Self {
            id: JobId::new(),
            destination,
            payload,
            context,
            created_at: Utc::now(),
            on_success: Vec::new(),
            on_error: Vec::new(),
            retries: None,
            guard_panics: None,
            transactional: false,
            attempts: 0,
            outcome: Outcome::Pending,
            last_error: None,
        }
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&B::Context, &B::Output) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_success.push(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&B::Context, &B::Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_error.push(Box::new(callback));
        self
    }

    pub fn with_retries(mut self, retries: RetryBudget) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Catch panics raised by this job's callbacks.
    pub fn guarded(mut self, guard: bool) -> Self {
        self.guard_panics = Some(guard);
        self
    }

    /// Close the session and destination scopes once the outcome is known.
    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn retries(&self) -> RetryBudget {
        self.retries.unwrap_or(RetryBudget::Limited(0))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn guards_panics(&self) -> bool {
        self.guard_panics.unwrap_or(true)
    }

    pub fn outcome(&self) -> &Outcome<B::Output, B::Error> {
        &self.outcome
    }

    pub fn last_error(&self) -> Option<&B::Error> {
        self.last_error.as_ref()
    }

    /// Fill unset options from pipeline defaults.
    pub(crate) fn apply_defaults(&mut self, retries: RetryBudget, guard_panics: bool) {
        self.retries.get_or_insert(retries);
        self.guard_panics.get_or_insert(guard_panics);
    }

    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn mark_delivered(&mut self, output: B::Output) {
        debug_assert!(self.outcome.is_pending(), "outcome set twice");
        self.outcome = Outcome::Delivered(output);
    }

    pub(crate) fn mark_failed(&mut self, error: B::Error) {
        debug_assert!(self.outcome.is_pending(), "outcome set twice");
        self.last_error = None;
        self.outcome = Outcome::Failed(error);
    }

    /// Record a transient failure and spend one retry.
    pub(crate) fn record_retry(&mut self, error: B::Error) {
        self.last_error = Some(error);
        self.retries = Some(self.retries().consume());
    }

    /// Whether the completion workers have anything to do for this job.
    pub(crate) fn needs_completion(&self) -> bool {
        match self.outcome {
            Outcome::Delivered(_) => self.transactional || !self.on_success.is_empty(),
            Outcome::Failed(_) => self.transactional || !self.on_error.is_empty(),
            Outcome::Pending => false,
        }
    }

    pub(crate) fn success_callbacks(&self) -> &[SuccessCallback<B>] {
        &self.on_success
    }

    pub(crate) fn error_callbacks(&self) -> &[ErrorCallback<B>] {
        &self.on_error
    }
}

impl<B: Backend> fmt::Debug for DeliveryJob<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryJob")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("attempts", &self.attempts)
            .field("retries", &self.retries)
            .field("transactional", &self.transactional)
            .field("on_success", &self.on_success.len())
            .field("on_error", &self.on_error.len())
            .finish_non_exhaustive()
    }
}
