//! Error taxonomy for the execution kernel.
//!
//! Every fallible operation in this crate returns [`GxoError`]. The variants
//! mirror the error kinds enumerated in the design: config/validation, a
//! missing module type, fatal task-execution failures, the skip sentinel,
//! channel policy violations, context cancellation/deadline, and stall
//! detection. Record-processing errors are not part of this enum — they are
//! non-fatal by construction and travel over the module error channel
//! (see [`crate::module`]).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GxoError>;

/// The error taxonomy driving the engine's outcome resolution (spec §7).
#[derive(Debug, Error, Clone)]
pub enum GxoError {
    /// Malformed playbook, bad durations/identifiers, dangling references,
    /// cycles, or an unrecognized overflow policy.
    #[error("configuration error: {0}")]
    Config(String),

    /// A task's `type` does not match any registered module factory.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// A module's `perform` call failed in a way that is fatal to the task
    /// instance (subject to retry and `ignore_errors`).
    #[error("task execution failed: {0}")]
    TaskExecution(String),

    /// Sentinel used to carry skip semantics through the same return path as
    /// other errors. Treated as terminal success for dependency propagation.
    #[error("skipped: {0}")]
    Skipped(String),

    /// A channel overflow policy refused or evicted a record.
    #[error("channel policy violation: {0}")]
    PolicyViolation(String),

    /// The run context was cancelled by its caller.
    #[error("cancelled")]
    Cancelled,

    /// The run context's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// No forward progress was observed for `stall_tolerance` consecutive
    /// stall-detector ticks.
    #[error("playbook execution stalled")]
    Stalled,

    /// A key was not present in the state store.
    #[error("key not found: {0}")]
    KeyNotFound(String),
}

impl GxoError {
    /// True for the two context-originated kinds that short-circuit retry
    /// and are returned as-is by `run_playbook` rather than wrapped.
    pub fn is_cancellation_or_deadline(&self) -> bool {
        matches!(self, GxoError::Cancelled | GxoError::DeadlineExceeded)
    }

    /// True for cancellation, deadline, and stall — the three kinds that
    /// `determine_final_outcome` returns unwrapped (spec §4.7).
    pub fn is_context_terminal(&self) -> bool {
        self.is_cancellation_or_deadline() || matches!(self, GxoError::Stalled)
    }

    /// True for the skip sentinel.
    pub fn is_skipped(&self) -> bool {
        matches!(self, GxoError::Skipped(_))
    }
}
