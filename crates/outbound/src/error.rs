//! Pipeline error types.

use thiserror::Error;

/// Errors reported by the producer-facing pipeline surface.
///
/// Delivery failures never show up here: they reach the job's own error
/// callbacks instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pipeline is not running")]
    NotRunning,

    #[error("a restart is already pending")]
    RestartPending,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("scheduler thread panicked")]
    SchedulerPanicked,
}

impl PipelineError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Result type alias using PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;
