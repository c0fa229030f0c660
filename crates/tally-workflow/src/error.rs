//! Failure types returned by workflow steps and runs

use serde::Serialize;
use tally_core::{DebugSession, FailureKind, PollOutcome, Stage, TallyError};
use thiserror::Error;

/// Why one workflow step could not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {reason}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "request deadline exceeded")
    }

    /// Attribute a lower-level error to `kind`; cancellation keeps its own kind
    pub fn from_error(kind: FailureKind, context: &str, err: TallyError) -> Self {
        match err {
            TallyError::Cancelled => Self::cancelled(),
            other => Self::new(kind, format!("{}: {}", context, other)),
        }
    }
}

/// Shorthand for step results
pub type StepResult<T> = std::result::Result<T, StepFailure>;

/// Map a finished poll onto a step result
pub(crate) fn settle<T>(
    outcome: PollOutcome<T>,
    kind: FailureKind,
    timeout_reason: impl FnOnce() -> String,
) -> StepResult<T> {
    match outcome {
        PollOutcome::Ready(value) => Ok(value),
        PollOutcome::TimedOut => Err(StepFailure::new(kind, timeout_reason())),
        PollOutcome::Cancelled => Err(StepFailure::cancelled()),
    }
}

/// Terminal failure of one run. Always carries the debug capture taken for it.
#[derive(Debug, Clone, Serialize, Error)]
#[error("run {run_id} failed while {stage}: {kind}: {reason} (debug_id: {})", debug.debug_id)]
pub struct RunFailure {
    pub run_id: String,
    pub stage: Stage,
    pub kind: FailureKind,
    pub reason: String,
    pub debug: DebugSession,
}

impl RunFailure {
    pub fn debug_id(&self) -> &str {
        &self.debug.debug_id
    }
}

/// Why a download token did not resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("download token not found")]
    NotFound,
    #[error("download token expired")]
    Expired,
}
