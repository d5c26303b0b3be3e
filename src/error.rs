//! Error taxonomy for the command pipeline.
//!
//! Every public entry point returns `Result<_, BridgeError>`. Terminal
//! command outcomes (timeout, cancellation, debugger failure) are *not*
//! represented here -- those are recorded in [`crate::types::CommandResult`]
//! and never unwind past the processor. `BridgeError` is reserved for
//! failures of the surrounding machinery: bad arguments, unknown ids,
//! disposed sessions.

use thiserror::Error;

/// Error kinds surfaced by the core pipeline.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Operation invoked after the session (or token registry) was disposed.
    #[error("session is disposed")]
    Disposed,

    /// Null/empty id or command text.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown command/session/token id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Cooperative cancellation reached the caller as an error rather than
    /// a terminal `Cancelled` state (e.g. a wait on `completion` itself was
    /// cancelled).
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A deadline was exceeded outside the per-command timeout machinery
    /// (e.g. the extension-callback request deadline).
    #[error("timed out: {0}")]
    Timeout(String),

    /// No debugger binary found, start failed, or the session is inactive.
    #[error("debugger unavailable: {0}")]
    DebuggerUnavailable(String),

    /// A stream read/write error that recovery may be able to paper over.
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// Anything else. Logged with its inner chain; the processor always
    /// continues past this.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Whether the recovery manager should classify this as "session lost"
    /// and consider a restart.
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            BridgeError::DebuggerUnavailable(_) | BridgeError::Transient(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
