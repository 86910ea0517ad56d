// Approval - supervisory sign-off gating a rating's authoritative status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<ApprovalState> {
        match s {
            "pending" => Some(ApprovalState::Pending),
            "approved" => Some(ApprovalState::Approved),
            "rejected" => Some(ApprovalState::Rejected),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

/// Reviewer's verdict when resolving a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
}

/// One sign-off request against a rating. At most one approval per rating
/// may be Pending at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: i64,
    pub rating_id: i64,
    pub state: ApprovalState,
    /// Set only on resolution
    pub reviewer_id: Option<i64>,
    /// Required iff state is Rejected
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ApprovalState::Pending,
            ApprovalState::Approved,
            ApprovalState::Rejected,
        ] {
            assert_eq!(ApprovalState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_resolved() {
        assert!(!ApprovalState::Pending.is_resolved());
        assert!(ApprovalState::Approved.is_resolved());
        assert!(ApprovalState::Rejected.is_resolved());
    }
}
