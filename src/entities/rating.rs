// Rating - the certified tax-rating record, the central versioned entity

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// LIFECYCLE STATE
// ============================================================================

/// Record state of a rating. Exactly one `Current` rating may exist per
/// (party, instrument, fiscal year); superseding first retires the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatingState {
    /// Authoritative record
    Current,
    /// Persisted but waiting for supervisor sign-off
    PendingApproval,
    /// Retired in favor of a newer current record
    Superseded,
    /// Soft-deleted; restorable
    Voided,
    /// Rejected during approval; rejection_reason is mandatory
    Rejected,
}

impl RatingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatingState::Current => "current",
            RatingState::PendingApproval => "pending_approval",
            RatingState::Superseded => "superseded",
            RatingState::Voided => "voided",
            RatingState::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<RatingState> {
        match s {
            "current" => Some(RatingState::Current),
            "pending_approval" => Some(RatingState::PendingApproval),
            "superseded" => Some(RatingState::Superseded),
            "voided" => Some(RatingState::Voided),
            "rejected" => Some(RatingState::Rejected),
            _ => None,
        }
    }

    /// Terminal states admit no further transition except Voided -> Current
    /// via restore.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RatingState::Superseded | RatingState::Voided | RatingState::Rejected
        )
    }

    /// Legal transitions of the lifecycle state machine.
    pub fn can_become(&self, next: RatingState) -> bool {
        matches!(
            (self, next),
            (RatingState::Current, RatingState::Superseded)
                | (RatingState::Current, RatingState::Voided)
                | (RatingState::PendingApproval, RatingState::Current)
                | (RatingState::PendingApproval, RatingState::Rejected)
                | (RatingState::Voided, RatingState::Current)
        )
    }
}

// ============================================================================
// SOURCE
// ============================================================================

/// How the rating entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatingSource {
    Manual,
    BatchImport,
    Api,
}

impl RatingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatingSource::Manual => "manual",
            RatingSource::BatchImport => "batch_import",
            RatingSource::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Option<RatingSource> {
        match s {
            "manual" => Some(RatingSource::Manual),
            "batch_import" => Some(RatingSource::BatchImport),
            "api" => Some(RatingSource::Api),
            _ => None,
        }
    }
}

// ============================================================================
// RATING
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub id: i64,
    pub party_id: i64,
    pub instrument_id: Option<i64>,
    pub fiscal_year: i32,
    /// Monetary amount, 2 fractional digits
    pub amount: Decimal,
    /// Derived factor, 6 fractional digits; computed from the amount unless
    /// explicitly overridden at submission
    pub factor: Decimal,
    pub rating_label: Option<String>,
    pub state: RatingState,
    pub source: RatingSource,
    /// Required iff state is Rejected
    pub rejection_reason: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub modified_by: Option<i64>,
    pub modified_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token; bumped on every write
    pub version: i64,
    /// Back-reference to the batch that imported this rating, if any
    pub batch_id: Option<i64>,
}

impl Rating {
    /// Key for the one-current-per-key uniqueness rule.
    pub fn natural_key(&self) -> (i64, Option<i64>, i32) {
        (self.party_id, self.instrument_id, self.fiscal_year)
    }
}

/// Input shape for creating a rating, shared by manual submission and the
/// batch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingDraft {
    pub party_id: i64,
    pub instrument_id: Option<i64>,
    pub fiscal_year: i32,
    pub amount: Decimal,
    /// Explicit factor override; None means derive from the amount
    pub factor: Option<Decimal>,
    pub rating_label: Option<String>,
}

/// Partial update for an existing rating. `expected_version` carries the
/// version the caller read; a mismatch at write time is a conflict.
#[derive(Debug, Clone, Default)]
pub struct RatingChanges {
    pub expected_version: i64,
    pub party_id: Option<i64>,
    pub instrument_id: Option<Option<i64>>,
    pub fiscal_year: Option<i32>,
    pub amount: Option<Decimal>,
    pub factor: Option<Decimal>,
    pub rating_label: Option<Option<String>>,
}
