//! Messaging backend abstraction consumed by the scheduler and the
//! completion workers.
//!
//! The pipeline never talks to the network itself. A `Backend` implementation
//! wraps the third-party wire API and classifies each failure as transient
//! (worth retrying) or final.

use std::fmt;

/// Why a send did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure<E> {
    /// Worth retrying (timeouts, throttling, 5xx).
    Transient(E),
    /// Retrying cannot help (blocked by user, malformed payload).
    Final(E),
}

impl<E> SendFailure<E> {
    pub fn is_final(&self) -> bool {
        matches!(self, SendFailure::Final(_))
    }

    pub fn into_inner(self) -> E {
        match self {
            SendFailure::Transient(e) | SendFailure::Final(e) => e,
        }
    }
}

impl<E: fmt::Display> fmt::Display for SendFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailure::Transient(e) => write!(f, "transient: {e}"),
            SendFailure::Final(e) => write!(f, "final: {e}"),
        }
    }
}

/// The two transactional scopes closed after a delivery outcome is known,
/// always in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionScope {
    Session,
    Destination,
}

impl fmt::Display for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionScope::Session => f.write_str("session"),
            TransactionScope::Destination => f.write_str("destination"),
        }
    }
}

/// Rendering requested from [`Backend::describe_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFormat {
    Text,
    Json,
}

/// Third-party messaging backend.
///
/// `send` runs on the scheduler thread; the remaining hooks run on the
/// scheduler (notify) or on completion workers (close, describe). No lock is
/// held while any of them runs.
pub trait Backend: Send + Sync + 'static {
    /// Backend-specific message payload.
    type Payload: Send + 'static;
    /// What a successful send returns (e.g. the sent message).
    type Output: Send + 'static;
    type Error: fmt::Display + Send + 'static;
    /// Origin context of the request that produced the job.
    type Context: Send + Sync + 'static;

    /// Perform the network call.
    fn send(&self, payload: &Self::Payload) -> Result<Self::Output, SendFailure<Self::Error>>;

    /// Fire-and-forget hook after a successful delivery.
    fn notify_send_ok(&self, _ctx: &Self::Context, _output: &Self::Output) {}

    /// Fire-and-forget hook after a terminal failure.
    fn notify_send_err(&self, _ctx: &Self::Context, _error: &Self::Error) {}

    /// Close one transactional scope of the origin context.
    fn close_transaction(
        &self,
        _ctx: &Self::Context,
        _scope: TransactionScope,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Diagnostic rendering of a context, for logs only.
    fn describe_context(&self, _ctx: &Self::Context, _verbose: bool, format: ContextFormat) -> String {
        match format {
            ContextFormat::Text => "<context>".to_string(),
            ContextFormat::Json => serde_json::json!({ "context": null }).to_string(),
        }
    }
}
