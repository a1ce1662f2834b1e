//! Error types for the task bridge.

use thiserror::Error;

use super::protocol::RequestId;

/// Errors surfaced by [`TaskBridge`](super::TaskBridge) operations.
///
/// The type is `Clone` so that a single initialization outcome can be
/// delivered to every caller awaiting the same handshake.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The worker could not be started or the handshake failed.
    ///
    /// Fatal to that `initialize()` attempt only; calling `initialize()`
    /// again retries with a fresh channel.
    #[error("Bridge initialization failed: {0}")]
    InitializationFailure(String),

    /// No terminal response arrived before the request deadline.
    #[error("Request {id} timed out after {timeout_ms}ms")]
    Timeout { id: RequestId, timeout_ms: u64 },

    /// The caller cancelled the request.
    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),

    /// The worker reported a failure for the request.
    #[error("Remote execution failed: {0}")]
    RemoteExecutionFailure(String),

    /// The task name does not match any known task kind.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// The payload does not match the task's expected shape.
    #[error("Invalid payload for task '{task}': {reason}")]
    InvalidPayload { task: String, reason: String },

    /// The bridge was disposed and has not been re-initialized.
    #[error("Bridge is not initialized")]
    NotInitialized,

    /// The request was still pending when the bridge was disposed.
    #[error("Bridge was disposed while the request was pending")]
    Disposed,

    /// The worker channel closed before a terminal response arrived.
    #[error("Worker channel closed")]
    ChannelClosed,
}

impl BridgeError {
    /// Returns true if a bounded retry policy may re-submit after this error.
    ///
    /// Only outcomes produced by the remote side or its silence qualify;
    /// cancellation, disposal and caller mistakes never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RemoteExecutionFailure(_)
        )
    }
}
