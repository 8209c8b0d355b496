//! Timer error types

use thiserror::Error;

/// Errors surfaced by the timer facade and the builder.
///
/// User-task failures are never converted into a `TimerError`; the driver
/// swallows them and reports through the failure hook.
#[derive(Debug, Error)]
pub enum TimerError {
    /// Admission denied: the pending-timeout ceiling has been reached.
    ///
    /// Recoverable: retry later, widen the ceiling, or cancel an existing
    /// timeout.
    #[error("timeout rejected: {pending} pending timeouts, limit is {limit}")]
    Rejected { pending: u64, limit: u64 },

    /// Operation on a timer that is already shut down, or a start attempt
    /// after shutdown.
    #[error("invalid timer state: {0}")]
    InvalidState(String),

    /// Rejected by the builder before a timer is constructed. Never
    /// surfaced at runtime.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Convenience result alias for timer operations.
pub type Result<T> = std::result::Result<T, TimerError>;
