// Error taxonomy of the lifecycle engine
//
// Every fallible core operation returns one of these variants so callers
// can distinguish "fix your input" from "not permitted" from "illegal in
// this state" without string matching.

use thiserror::Error;

use crate::validation::Violation;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Input violates a business rule; recoverable, caller fixes the input
    /// and retries.
    #[error("validation failed: {}", format_violations(.0))]
    Validation(Vec<Violation>),

    /// Actor lacks permission. Deliberately generic so it never leaks which
    /// records exist.
    #[error("not permitted")]
    Authorization,

    /// Operation is illegal in the subject's current lifecycle state.
    #[error("invalid state '{state}': {detail}")]
    InvalidState { state: String, detail: String },

    /// Concurrent modification or uniqueness violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Referenced id does not exist, or is not visible to the actor's scope.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// The batch source file could not be opened or parsed at all. This is
    /// a pipeline-level abort, distinct from row-level errors.
    #[error("batch source unreadable: {0}")]
    BatchSource(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: i64) -> CoreError {
        CoreError::NotFound { kind, id }
    }

    pub fn invalid_state(state: &str, detail: &str) -> CoreError {
        CoreError::InvalidState {
            state: state.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Violations behind a Validation error, if any.
    pub fn violations(&self) -> &[Violation] {
        match self {
            CoreError::Validation(v) => v,
            _ => &[],
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.code.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
