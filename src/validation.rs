// Validation & Factor Engine
//
// Pure functions: business-rule checks return a list of violations (never
// an early error) so callers decide whether to surface one or many, and the
// derived factor is computed from the amount and a configurable
// coefficient.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::{Instrument, Rating, RatingState};

// ============================================================================
// VIOLATIONS
// ============================================================================

pub mod codes {
    pub const INVALID_AMOUNT: &str = "invalid_amount";
    pub const INVALID_FACTOR: &str = "invalid_factor";
    pub const INVALID_YEAR: &str = "invalid_year";
    pub const INSTRUMENT_PARTY_MISMATCH: &str = "instrument_party_mismatch";
    pub const MISSING_REJECTION_REASON: &str = "missing_rejection_reason";
    pub const DUPLICATE_CURRENT_RATING: &str = "duplicate_current_rating";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(code: &str, field: &str, message: &str) -> Self {
        Violation {
            code: code.to_string(),
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.field, self.message)
    }
}

/// Fiscal-year bounds in effect for one validation pass. The upper bound
/// comes from the injected clock, the lower bound from the parameter store.
#[derive(Debug, Clone, Copy)]
pub struct YearBounds {
    pub min: i32,
    pub max: i32,
}

// ============================================================================
// VALIDATE
// ============================================================================

/// Business-rule validation for a single rating. `instrument` is the stored
/// instrument the rating references, already looked up by the caller; None
/// when the rating has no instrument.
pub fn validate(
    rating: &Rating,
    instrument: Option<&Instrument>,
    years: YearBounds,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    if rating.amount <= Decimal::ZERO {
        violations.push(Violation::new(
            codes::INVALID_AMOUNT,
            "amount",
            "amount must be greater than zero",
        ));
    }

    if rating.factor <= Decimal::ZERO {
        violations.push(Violation::new(
            codes::INVALID_FACTOR,
            "factor",
            "factor must be greater than zero",
        ));
    }

    if rating.fiscal_year < years.min {
        violations.push(Violation::new(
            codes::INVALID_YEAR,
            "fiscal_year",
            &format!("fiscal year {} is below minimum {}", rating.fiscal_year, years.min),
        ));
    } else if rating.fiscal_year > years.max {
        violations.push(Violation::new(
            codes::INVALID_YEAR,
            "fiscal_year",
            &format!("fiscal year {} is above maximum {}", rating.fiscal_year, years.max),
        ));
    }

    if let Some(instrument) = instrument {
        if instrument.party_id != rating.party_id {
            violations.push(Violation::new(
                codes::INSTRUMENT_PARTY_MISMATCH,
                "instrument_id",
                &format!(
                    "instrument {} belongs to party {}, not party {}",
                    instrument.id, instrument.party_id, rating.party_id
                ),
            ));
        }
    }

    if rating.state == RatingState::Rejected
        && rating
            .rejection_reason
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
    {
        violations.push(Violation::new(
            codes::MISSING_REJECTION_REASON,
            "rejection_reason",
            "a rejected rating requires a rejection reason",
        ));
    }

    violations
}

// ============================================================================
// FACTOR
// ============================================================================

/// Derived factor: amount x coefficient, 6 fractional digits. The
/// coefficient defaults to 0.05 and may be overridden through the
/// parameter store (`params::BASE_FACTOR_COEFFICIENT`).
pub fn compute_factor(amount: Decimal, coefficient: Decimal) -> Decimal {
    (amount * coefficient).round_dp(6)
}
