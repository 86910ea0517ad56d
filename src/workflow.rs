// Approval Workflow
//
// A secondary state machine layered on top of a rating: pending -> approved
// or pending -> rejected, single-shot. Resolution transitions the rating
// and writes the approve/reject audit entry in the same transaction.

use rusqlite::Connection;
use tracing::info;

use crate::audit::{self, AuditAction, SubjectType};
use crate::clock::Clock;
use crate::db;
use crate::entities::{Approval, ApprovalOutcome, ApprovalState, RatingState};
use crate::error::{CoreError, CoreResult};
use crate::validation::{codes, Violation};

/// Open a pending approval for a rating. At most one approval per rating
/// may be open; a second request is a conflict.
pub fn open(conn: &mut Connection, clock: &dyn Clock, rating_id: i64) -> CoreResult<Approval> {
    let tx = conn.transaction()?;

    let rating =
        db::get_rating(&tx, rating_id)?.ok_or_else(|| CoreError::not_found("rating", rating_id))?;
    if rating.state.is_terminal() {
        return Err(CoreError::invalid_state(
            rating.state.as_str(),
            "cannot request approval for a retired rating",
        ));
    }
    if let Some(existing) = db::find_open_approval(&tx, rating_id)? {
        return Err(CoreError::Conflict(format!(
            "approval {} is already pending for rating {rating_id}",
            existing.id
        )));
    }

    let approval = db::insert_approval(&tx, rating_id, clock.now())?;
    tx.commit()?;
    Ok(approval)
}

/// Resolve a pending approval. Rejection requires a non-empty reason;
/// resolving an already-resolved approval fails.
pub fn resolve(
    conn: &mut Connection,
    clock: &dyn Clock,
    approval_id: i64,
    outcome: ApprovalOutcome,
    reason: Option<&str>,
    reviewer_id: i64,
) -> CoreResult<Approval> {
    if outcome == ApprovalOutcome::Rejected && reason.map(str::trim).unwrap_or("").is_empty() {
        return Err(CoreError::Validation(vec![Violation::new(
            codes::MISSING_REJECTION_REASON,
            "reason",
            "rejecting an approval requires a reason",
        )]));
    }

    let tx = conn.transaction()?;

    let mut approval = db::get_approval(&tx, approval_id)?
        .ok_or_else(|| CoreError::not_found("approval", approval_id))?;
    if approval.state.is_resolved() {
        return Err(CoreError::invalid_state(
            approval.state.as_str(),
            "approval is already resolved",
        ));
    }

    let rating = db::get_rating(&tx, approval.rating_id)?
        .ok_or_else(|| CoreError::not_found("rating", approval.rating_id))?;

    let now = clock.now();
    approval.reviewer_id = Some(reviewer_id);
    approval.resolved_at = Some(now);

    match outcome {
        ApprovalOutcome::Approved => {
            approval.state = ApprovalState::Approved;

            // Promote the rating if it was gated on this approval
            if rating.state == RatingState::PendingApproval {
                if let Some(other) = db::find_current(
                    &tx,
                    rating.party_id,
                    rating.instrument_id,
                    rating.fiscal_year,
                )? {
                    return Err(CoreError::Conflict(format!(
                        "rating {} is already current for that key",
                        other.id
                    )));
                }
                let mut promoted = rating.clone();
                promoted.state = RatingState::Current;
                promoted.modified_by = Some(reviewer_id);
                promoted.modified_at = Some(now);
                if !db::update_rating_checked(&tx, &promoted, rating.version)? {
                    return Err(CoreError::Conflict(format!(
                        "rating {} was modified concurrently",
                        rating.id
                    )));
                }
            }
            db::resolve_approval_row(&tx, &approval)?;
            audit::record(
                &tx,
                SubjectType::Rating,
                rating.id,
                Some(reviewer_id),
                AuditAction::Approve,
                None,
                now,
            )?;
        }
        ApprovalOutcome::Rejected => {
            approval.state = ApprovalState::Rejected;
            approval.reason = reason.map(|s| s.to_string());

            if rating.state == RatingState::PendingApproval {
                let mut rejected = rating.clone();
                rejected.state = RatingState::Rejected;
                rejected.rejection_reason = reason.map(|s| s.to_string());
                rejected.modified_by = Some(reviewer_id);
                rejected.modified_at = Some(now);
                if !db::update_rating_checked(&tx, &rejected, rating.version)? {
                    return Err(CoreError::Conflict(format!(
                        "rating {} was modified concurrently",
                        rating.id
                    )));
                }
            }
            db::resolve_approval_row(&tx, &approval)?;
            audit::record(
                &tx,
                SubjectType::Rating,
                rating.id,
                Some(reviewer_id),
                AuditAction::Reject,
                reason,
                now,
            )?;
        }
    }

    tx.commit()?;
    info!(
        approval_id,
        rating_id = rating.id,
        state = approval.state.as_str(),
        "approval resolved"
    );
    Ok(approval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::setup_database;
    use crate::entities::{RatingDraft, RatingSource};
    use crate::{params, store};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn fixed_clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2025, 3, 15, 10, 0, 0).unwrap())
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    /// Create a pending rating with its open approval, policy-driven.
    fn pending_rating(conn: &mut Connection) -> (i64, Approval) {
        let party = db::insert_party(conn, "Acme", "11.111.111-1", None, Utc::now()).unwrap();
        params::set(conn, params::APPROVAL_REQUIRED, "true", "bool", None).unwrap();

        let draft = RatingDraft {
            party_id: party.id,
            instrument_id: None,
            fiscal_year: 2024,
            amount: dec!(1000.00),
            factor: None,
            rating_label: None,
        };
        let rating =
            store::create(conn, &fixed_clock(), &draft, RatingSource::Manual, Some(1)).unwrap();
        let approval = db::find_open_approval(conn, rating.id).unwrap().unwrap();
        (rating.id, approval)
    }

    #[test]
    fn test_approve_promotes_rating() {
        let mut conn = test_conn();
        let (rating_id, approval) = pending_rating(&mut conn);

        let resolved = resolve(
            &mut conn,
            &fixed_clock(),
            approval.id,
            ApprovalOutcome::Approved,
            None,
            9,
        )
        .unwrap();

        assert_eq!(resolved.state, ApprovalState::Approved);
        assert_eq!(resolved.reviewer_id, Some(9));
        assert!(resolved.resolved_at.is_some());

        let rating = db::get_rating(&conn, rating_id).unwrap().unwrap();
        assert_eq!(rating.state, RatingState::Current);

        let trail = audit::trail(&conn, SubjectType::Rating, rating_id).unwrap();
        assert_eq!(trail.last().unwrap().action, AuditAction::Approve);
    }

    #[test]
    fn test_reject_requires_reason() {
        let mut conn = test_conn();
        let (_, approval) = pending_rating(&mut conn);

        let err = resolve(
            &mut conn,
            &fixed_clock(),
            approval.id,
            ApprovalOutcome::Rejected,
            Some("  "),
            9,
        )
        .unwrap_err();
        assert_eq!(err.violations()[0].code, codes::MISSING_REJECTION_REASON);
    }

    #[test]
    fn test_reject_transitions_rating_with_reason() {
        let mut conn = test_conn();
        let (rating_id, approval) = pending_rating(&mut conn);

        resolve(
            &mut conn,
            &fixed_clock(),
            approval.id,
            ApprovalOutcome::Rejected,
            Some("amount inconsistent with filings"),
            9,
        )
        .unwrap();

        let rating = db::get_rating(&conn, rating_id).unwrap().unwrap();
        assert_eq!(rating.state, RatingState::Rejected);
        assert_eq!(
            rating.rejection_reason.as_deref(),
            Some("amount inconsistent with filings")
        );

        let trail = audit::trail(&conn, SubjectType::Rating, rating_id).unwrap();
        assert_eq!(trail.last().unwrap().action, AuditAction::Reject);
    }

    #[test]
    fn test_resolution_is_single_shot() {
        let mut conn = test_conn();
        let (rating_id, approval) = pending_rating(&mut conn);
        let clock = fixed_clock();

        resolve(&mut conn, &clock, approval.id, ApprovalOutcome::Approved, None, 9).unwrap();

        let err = resolve(
            &mut conn,
            &clock,
            approval.id,
            ApprovalOutcome::Rejected,
            Some("changed my mind"),
            9,
        );
        assert!(matches!(err, Err(CoreError::InvalidState { .. })));

        // Second call must not have touched the rating
        let rating = db::get_rating(&conn, rating_id).unwrap().unwrap();
        assert_eq!(rating.state, RatingState::Current);
    }

    #[test]
    fn test_only_one_open_approval_per_rating() {
        let mut conn = test_conn();
        let (rating_id, _approval) = pending_rating(&mut conn);

        let err = open(&mut conn, &fixed_clock(), rating_id);
        assert!(matches!(err, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn test_resolve_missing_approval() {
        let mut conn = test_conn();
        let err = resolve(
            &mut conn,
            &fixed_clock(),
            404,
            ApprovalOutcome::Approved,
            None,
            9,
        );
        assert!(matches!(err, Err(CoreError::NotFound { .. })));
    }
}
