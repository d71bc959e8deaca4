//! Outbound delivery pipeline: per-destination queues, a rate-limited
//! single-threaded scheduler, and completion workers for user callbacks.

pub mod backend;
pub mod config;
pub mod deque;
pub mod error;
pub mod job;
pub mod limiter;
pub mod table;

mod completion;
mod pipeline;
mod scheduler;
mod shared;

mod integration_tests;

pub use backend::{Backend, ContextFormat, SendFailure, TransactionScope};
pub use config::{LimiterConfig, PipelineConfig, TypeLimit};
pub use error::{PipelineError, PipelineResult};
pub use job::{DeliveryJob, JobId, Outcome, RetryBudget};
pub use pipeline::{Pipeline, Submitter};
pub use shared::{PipelineStats, PipelineStatus};

pub use courier_core::{DestinationKey, DestinationType};
