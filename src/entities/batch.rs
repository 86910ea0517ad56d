// Batch - one file-ingestion run and its per-row outcome ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate state of a batch. A batch with some failed rows is still
/// `Completed` (with a non-zero failed count); `Failed` is reserved for a
/// pipeline-level abort, e.g. the source file could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    InProgress,
    Completed,
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::InProgress => "in_progress",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<BatchState> {
        match s {
            "in_progress" => Some(BatchState::InProgress),
            "completed" => Some(BatchState::Completed),
            "failed" => Some(BatchState::Failed),
            _ => None,
        }
    }
}

/// Outcome of one input row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOutcome {
    Ok,
    Error,
    Warning,
}

impl RowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Ok => "ok",
            RowOutcome::Error => "error",
            RowOutcome::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<RowOutcome> {
        match s {
            "ok" => Some(RowOutcome::Ok),
            "error" => Some(RowOutcome::Error),
            "warning" => Some(RowOutcome::Warning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    /// Stable reference to the already-stored source file
    pub file_ref: String,
    /// SHA-256 content fingerprint of the source file
    pub fingerprint: String,
    pub state: BatchState,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub summary: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-input-row ledger entry. Row numbers are 1-based and unique within
/// the batch; the raw payload is kept verbatim for re-display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRow {
    pub id: i64,
    pub batch_id: i64,
    pub row_number: i64,
    pub payload: String,
    pub outcome: RowOutcome,
    /// Structured error detail (JSON violation list) or free text
    pub detail: Option<String>,
    /// The rating this row created, null if the row failed
    pub rating_id: Option<i64>,
}

/// Aggregate result returned to the caller of a batch submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: i64,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [BatchState::InProgress, BatchState::Completed, BatchState::Failed] {
            assert_eq!(BatchState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_outcome_roundtrip() {
        for outcome in [RowOutcome::Ok, RowOutcome::Error, RowOutcome::Warning] {
            assert_eq!(RowOutcome::parse(outcome.as_str()), Some(outcome));
        }
    }
}
