//! Top-level error types for candle-clock.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the public API.
///
/// Worker-internal failures (claim races, reschedule errors, handler faults)
/// are logged and never propagate here; the worker keeps looping.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cron expression failed to parse.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// A create call was missing required fields or mixed conflicting ones.
    #[error("invalid timer spec: {0}")]
    InvalidSpec(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
