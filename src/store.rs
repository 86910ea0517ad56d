// Rating Record Store
//
// The authoritative entity store. All state transitions of a rating funnel
// through here; no other component writes the state field. Every mutating
// operation runs inside one transaction spanning the store write and the
// audit write, so a failed audit write rolls the whole operation back.

use rusqlite::Connection;
use tracing::info;

use crate::audit::{self, AuditAction, SubjectType};
use crate::clock::Clock;
use crate::db;
use crate::entities::{Rating, RatingChanges, RatingDraft, RatingSource, RatingState};
use crate::error::{CoreError, CoreResult};
use crate::params;
use crate::validation::{self, codes, Violation, YearBounds};

// ============================================================================
// CREATE
// ============================================================================

/// Validate and persist a new rating. Initial state is `current`, or
/// `pending_approval` when the approval-required policy parameter is on,
/// in which case the pending approval is opened in the same transaction.
pub fn create(
    conn: &mut Connection,
    clock: &dyn Clock,
    draft: &RatingDraft,
    source: RatingSource,
    actor_id: Option<i64>,
) -> CoreResult<Rating> {
    let tx = conn.transaction()?;
    let rating = create_in_tx(&tx, clock, draft, source, actor_id, None)?;
    tx.commit()?;
    info!(rating_id = rating.id, state = rating.state.as_str(), "rating created");
    Ok(rating)
}

/// Transaction-scoped create, shared with the ingestion pipeline (which
/// opens one transaction per row and passes the batch back-reference).
pub(crate) fn create_in_tx(
    tx: &Connection,
    clock: &dyn Clock,
    draft: &RatingDraft,
    source: RatingSource,
    actor_id: Option<i64>,
    batch_id: Option<i64>,
) -> CoreResult<Rating> {
    if db::get_party(tx, draft.party_id)?.is_none() {
        return Err(CoreError::not_found("party", draft.party_id));
    }
    let instrument = match draft.instrument_id {
        Some(id) => Some(db::get_instrument(tx, id)?.ok_or_else(|| CoreError::not_found("instrument", id))?),
        None => None,
    };

    // Policy and computation inputs are read fresh on every call
    let approval_required = params::bool_or(tx, params::APPROVAL_REQUIRED, false)?;
    let coefficient = params::decimal_or(
        tx,
        params::BASE_FACTOR_COEFFICIENT,
        params::DEFAULT_FACTOR_COEFFICIENT,
    )?;
    let bounds = year_bounds(tx, clock)?;

    let now = clock.now();
    let state = if approval_required {
        RatingState::PendingApproval
    } else {
        RatingState::Current
    };
    let amount = draft.amount.round_dp(2);
    let factor = match draft.factor {
        Some(f) => f.round_dp(6),
        None => validation::compute_factor(amount, coefficient),
    };

    let candidate = Rating {
        id: 0,
        party_id: draft.party_id,
        instrument_id: draft.instrument_id,
        fiscal_year: draft.fiscal_year,
        amount,
        factor,
        rating_label: draft.rating_label.clone(),
        state,
        source,
        rejection_reason: None,
        created_by: actor_id,
        created_at: now,
        modified_by: None,
        modified_at: None,
        version: 1,
        batch_id,
    };

    let violations = validation::validate(&candidate, instrument.as_ref(), bounds);
    if !violations.is_empty() {
        return Err(CoreError::Validation(violations));
    }

    if let Some(existing) =
        db::find_current(tx, candidate.party_id, candidate.instrument_id, candidate.fiscal_year)?
    {
        return Err(CoreError::Conflict(format!(
            "rating {} is already current for party {}, year {}",
            existing.id, candidate.party_id, candidate.fiscal_year
        )));
    }

    let rating = db::insert_rating(tx, &candidate)?;
    if approval_required {
        db::insert_approval(tx, rating.id, now)?;
    }
    audit::record(
        tx,
        SubjectType::Rating,
        rating.id,
        actor_id,
        AuditAction::Create,
        Some(&format!("source={}", source.as_str())),
        now,
    )?;

    Ok(rating)
}

// ============================================================================
// UPDATE
// ============================================================================

/// Re-validate the merged record and persist it under an optimistic version
/// guard. Moving the record onto a natural key that already has a current
/// rating is refused; retire the existing record first.
pub fn update(
    conn: &mut Connection,
    clock: &dyn Clock,
    id: i64,
    changes: &RatingChanges,
    actor_id: Option<i64>,
) -> CoreResult<Rating> {
    let tx = conn.transaction()?;

    let existing = db::get_rating(&tx, id)?.ok_or_else(|| CoreError::not_found("rating", id))?;
    if existing.state.is_terminal() {
        return Err(CoreError::invalid_state(
            existing.state.as_str(),
            "only current or pending ratings can be modified",
        ));
    }
    if existing.version != changes.expected_version {
        return Err(CoreError::Conflict(format!(
            "rating {} was modified concurrently (version {} != expected {})",
            id, existing.version, changes.expected_version
        )));
    }

    let mut merged = existing.clone();
    if let Some(party_id) = changes.party_id {
        merged.party_id = party_id;
    }
    if let Some(instrument_id) = changes.instrument_id {
        merged.instrument_id = instrument_id;
    }
    if let Some(fiscal_year) = changes.fiscal_year {
        merged.fiscal_year = fiscal_year;
    }
    if let Some(amount) = changes.amount {
        merged.amount = amount.round_dp(2);
    }
    if let Some(label) = &changes.rating_label {
        merged.rating_label = label.clone();
    }

    // Factor follows the amount unless explicitly overridden
    merged.factor = match changes.factor {
        Some(f) => f.round_dp(6),
        None => {
            let coefficient = params::decimal_or(
                &tx,
                params::BASE_FACTOR_COEFFICIENT,
                params::DEFAULT_FACTOR_COEFFICIENT,
            )?;
            validation::compute_factor(merged.amount, coefficient)
        }
    };

    if merged.party_id != existing.party_id && db::get_party(&tx, merged.party_id)?.is_none() {
        return Err(CoreError::not_found("party", merged.party_id));
    }
    let instrument = match merged.instrument_id {
        Some(iid) => {
            Some(db::get_instrument(&tx, iid)?.ok_or_else(|| CoreError::not_found("instrument", iid))?)
        }
        None => None,
    };

    let bounds = year_bounds(&tx, clock)?;
    let violations = validation::validate(&merged, instrument.as_ref(), bounds);
    if !violations.is_empty() {
        return Err(CoreError::Validation(violations));
    }

    // Key change must not collide with another current record
    if merged.natural_key() != existing.natural_key() && merged.state == RatingState::Current {
        if let Some(other) =
            db::find_current(&tx, merged.party_id, merged.instrument_id, merged.fiscal_year)?
        {
            if other.id != id {
                return Err(CoreError::Validation(vec![Violation::new(
                    codes::DUPLICATE_CURRENT_RATING,
                    "fiscal_year",
                    &format!("rating {} is already current for that key; retire it first", other.id),
                )]));
            }
        }
    }

    let now = clock.now();
    merged.modified_by = actor_id;
    merged.modified_at = Some(now);

    if !db::update_rating_checked(&tx, &merged, changes.expected_version)? {
        return Err(CoreError::Conflict(format!(
            "rating {id} was modified concurrently"
        )));
    }
    audit::record(
        &tx,
        SubjectType::Rating,
        id,
        actor_id,
        AuditAction::Modify,
        None,
        now,
    )?;

    tx.commit()?;
    merged.version = changes.expected_version + 1;
    info!(rating_id = id, "rating updated");
    Ok(merged)
}

// ============================================================================
// VOID / RESTORE
// ============================================================================

/// Soft delete: current -> voided. Never a physical delete. Voiding an
/// already-voided rating is an error, not a no-op.
pub fn void(
    conn: &mut Connection,
    clock: &dyn Clock,
    id: i64,
    actor_id: Option<i64>,
) -> CoreResult<Rating> {
    transition(
        conn,
        clock,
        id,
        actor_id,
        RatingState::Voided,
        AuditAction::Void,
        "only a current rating can be voided",
    )
}

/// Restore a voided rating back to current. Legal only from `voided`.
pub fn restore(
    conn: &mut Connection,
    clock: &dyn Clock,
    id: i64,
    actor_id: Option<i64>,
) -> CoreResult<Rating> {
    transition(
        conn,
        clock,
        id,
        actor_id,
        RatingState::Current,
        AuditAction::Restore,
        "only a voided rating can be restored",
    )
}

fn transition(
    conn: &mut Connection,
    clock: &dyn Clock,
    id: i64,
    actor_id: Option<i64>,
    target: RatingState,
    action: AuditAction,
    detail: &str,
) -> CoreResult<Rating> {
    let tx = conn.transaction()?;

    let mut rating = db::get_rating(&tx, id)?.ok_or_else(|| CoreError::not_found("rating", id))?;
    if !rating.state.can_become(target) {
        return Err(CoreError::invalid_state(rating.state.as_str(), detail));
    }

    // A restore re-enters the current set and must respect uniqueness
    if target == RatingState::Current {
        if let Some(other) =
            db::find_current(&tx, rating.party_id, rating.instrument_id, rating.fiscal_year)?
        {
            return Err(CoreError::Conflict(format!(
                "rating {} is already current for that key",
                other.id
            )));
        }
    }

    let now = clock.now();
    let expected = rating.version;
    rating.state = target;
    rating.modified_by = actor_id;
    rating.modified_at = Some(now);

    if !db::update_rating_checked(&tx, &rating, expected)? {
        return Err(CoreError::Conflict(format!(
            "rating {id} was modified concurrently"
        )));
    }
    audit::record(&tx, SubjectType::Rating, id, actor_id, action, None, now)?;

    tx.commit()?;
    rating.version = expected + 1;
    info!(rating_id = id, state = rating.state.as_str(), "rating transitioned");
    Ok(rating)
}

/// Retire a current rating in favor of a replacement, inside the caller's
/// transaction. Used by the ingestion pipeline's supersede path.
pub(crate) fn retire_in_tx(
    tx: &Connection,
    clock: &dyn Clock,
    rating: &Rating,
    actor_id: Option<i64>,
) -> CoreResult<()> {
    let now = clock.now();
    let mut retired = rating.clone();
    retired.state = RatingState::Superseded;
    retired.modified_by = actor_id;
    retired.modified_at = Some(now);

    if !db::update_rating_checked(tx, &retired, rating.version)? {
        return Err(CoreError::Conflict(format!(
            "rating {} was modified concurrently",
            rating.id
        )));
    }
    audit::record(
        tx,
        SubjectType::Rating,
        rating.id,
        actor_id,
        AuditAction::Modify,
        Some("superseded by replacement"),
        now,
    )?;
    Ok(())
}

fn year_bounds(conn: &Connection, clock: &dyn Clock) -> CoreResult<YearBounds> {
    Ok(YearBounds {
        min: params::i32_or(conn, params::MIN_FISCAL_YEAR, params::DEFAULT_MIN_FISCAL_YEAR)?,
        max: clock.current_year(),
    })
}
