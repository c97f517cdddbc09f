//! Crate-wide error type.
//!
//! Every failure mode named in the controller's error-handling design maps to
//! exactly one variant here. The control loop never lets one of these escape
//! as a panic: telemetry and persistence failures are absorbed locally and
//! logged, `InvalidRecommendation` is replaced with the fallback-safety
//! decision, and `IllegalArgument` is coerced rather than propagated.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Error, Debug, Clone)]
pub enum ControllerError {
    /// The telemetry source could not produce a full sample. Recovered
    /// locally — callers never see this; it is recorded for observability.
    #[error("telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    /// The persistence backend could not be opened or a write failed.
    /// Recovered locally by reverting to the in-memory fallback.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// The decision engine produced a non-finite or sub-1 recommendation.
    /// Replaced with `{recommended: 1, reason: "fallback_safety"}`.
    #[error("invalid recommendation: {0}")]
    InvalidRecommendation(String),

    /// A submitted request's `timeout_ms` elapsed before it completed.
    #[error("request timed out after {0}ms")]
    RequestTimeout(u64),

    /// A submitted request's cancellation token fired before it completed.
    #[error("request canceled")]
    RequestCanceled,

    /// The operation itself returned an error; the original message is
    /// passed through unchanged.
    #[error("operation failed: {0}")]
    OperationFailure(String),

    /// A caller-supplied argument (e.g. to `update_limit`) was invalid.
    /// Coerced to a safe default at the call site; this variant exists for
    /// the warning log, not for propagation.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// `ControllerOptions` failed validation at construction time, or
    /// carried an unrecognized field.
    #[error("configuration error: {0}")]
    Configuration(String),
}
