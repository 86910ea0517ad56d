// SQLite schema and row-level persistence
//
// All writes that belong to one logical operation run inside a single
// rusqlite transaction opened by the caller (store, approval workflow,
// ingestion pipeline); functions here take &Connection and work equally
// under a transaction or in autocommit.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::entities::{
    Approval, ApprovalState, Batch, BatchRow, BatchState, Instrument, InstrumentKind, Party,
    PartyStatus, Rating, RatingSource, RatingState, RowOutcome,
};
use crate::error::{CoreError, CoreResult};

pub fn setup_database(conn: &Connection) -> CoreResult<()> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS parties (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            legal_name TEXT NOT NULL,
            tax_id TEXT NOT NULL UNIQUE,
            contact_email TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS instruments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            party_id INTEGER NOT NULL REFERENCES parties(id),
            kind TEXT NOT NULL,
            name TEXT,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_ref TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'in_progress',
            total INTEGER NOT NULL DEFAULT 0,
            succeeded INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            summary TEXT,
            created_by INTEGER,
            created_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS ratings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            party_id INTEGER NOT NULL REFERENCES parties(id),
            instrument_id INTEGER REFERENCES instruments(id),
            fiscal_year INTEGER NOT NULL,
            amount TEXT NOT NULL,
            factor TEXT NOT NULL,
            rating_label TEXT,
            state TEXT NOT NULL,
            source TEXT NOT NULL,
            rejection_reason TEXT,
            created_by INTEGER,
            created_at TEXT NOT NULL,
            modified_by INTEGER,
            modified_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            batch_id INTEGER REFERENCES batches(id)
        );

        -- At most one current rating per (party, instrument, year)
        CREATE UNIQUE INDEX IF NOT EXISTS idx_ratings_current_key
            ON ratings(party_id, IFNULL(instrument_id, 0), fiscal_year)
            WHERE state = 'current';

        CREATE INDEX IF NOT EXISTS idx_ratings_state ON ratings(state);
        CREATE INDEX IF NOT EXISTS idx_ratings_party_year ON ratings(party_id, fiscal_year);

        CREATE TABLE IF NOT EXISTS approvals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rating_id INTEGER NOT NULL REFERENCES ratings(id),
            state TEXT NOT NULL DEFAULT 'pending',
            reviewer_id INTEGER,
            reason TEXT,
            created_at TEXT NOT NULL,
            resolved_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_approvals_rating ON approvals(rating_id);
        CREATE INDEX IF NOT EXISTS idx_approvals_state ON approvals(state);

        CREATE TABLE IF NOT EXISTS batch_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
            row_number INTEGER NOT NULL,
            payload TEXT NOT NULL,
            outcome TEXT NOT NULL,
            detail TEXT,
            rating_id INTEGER REFERENCES ratings(id),
            UNIQUE(batch_id, row_number)
        );

        CREATE TABLE IF NOT EXISTS audit_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT NOT NULL UNIQUE,
            subject_type TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            actor_id INTEGER,
            action TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_subject
            ON audit_entries(subject_type, subject_id);

        CREATE TABLE IF NOT EXISTS parameters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'str',
            description TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            UNIQUE(key, version)
        );",
    )?;

    Ok(())
}

// ============================================================================
// COLUMN CODECS
// ============================================================================

pub(crate) fn parse_datetime(s: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_decimal(s: &str, idx: usize) -> rusqlite::Result<Decimal> {
    Decimal::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bad_enum(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown enum value '{value}'").into(),
    )
}

// ============================================================================
// PARTIES & INSTRUMENTS
// ============================================================================

fn party_from_row(row: &Row<'_>) -> rusqlite::Result<Party> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Party {
        id: row.get(0)?,
        legal_name: row.get(1)?,
        tax_id: row.get(2)?,
        contact_email: row.get(3)?,
        status: PartyStatus::parse(&status).ok_or_else(|| bad_enum(4, &status))?,
        created_at: parse_datetime(&created_at, 5)?,
    })
}

pub fn insert_party(
    conn: &Connection,
    legal_name: &str,
    tax_id: &str,
    contact_email: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<Party> {
    let result = conn.execute(
        "INSERT INTO parties (legal_name, tax_id, contact_email, status, created_at)
         VALUES (?1, ?2, ?3, 'active', ?4)",
        params![legal_name, tax_id, contact_email, now.to_rfc3339()],
    );

    match result {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            get_party(conn, id)?.ok_or_else(|| CoreError::not_found("party", id))
        }
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(CoreError::Conflict(format!(
                "a party with tax id '{tax_id}' already exists"
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_party(conn: &Connection, id: i64) -> CoreResult<Option<Party>> {
    let party = conn
        .query_row(
            "SELECT id, legal_name, tax_id, contact_email, status, created_at
             FROM parties WHERE id = ?1",
            params![id],
            party_from_row,
        )
        .optional()?;
    Ok(party)
}

pub fn insert_instrument(
    conn: &Connection,
    party_id: i64,
    kind: InstrumentKind,
    name: Option<&str>,
    description: Option<&str>,
) -> CoreResult<Instrument> {
    conn.execute(
        "INSERT INTO instruments (party_id, kind, name, description)
         VALUES (?1, ?2, ?3, ?4)",
        params![party_id, kind.as_str(), name, description],
    )?;
    let id = conn.last_insert_rowid();
    get_instrument(conn, id)?.ok_or_else(|| CoreError::not_found("instrument", id))
}

pub fn get_instrument(conn: &Connection, id: i64) -> CoreResult<Option<Instrument>> {
    let instrument = conn
        .query_row(
            "SELECT id, party_id, kind, name, description FROM instruments WHERE id = ?1",
            params![id],
            |row| {
                let kind: String = row.get(2)?;
                Ok(Instrument {
                    id: row.get(0)?,
                    party_id: row.get(1)?,
                    kind: InstrumentKind::parse(&kind).ok_or_else(|| bad_enum(2, &kind))?,
                    name: row.get(3)?,
                    description: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(instrument)
}

// ============================================================================
// RATINGS
// ============================================================================

const RATING_COLUMNS: &str = "id, party_id, instrument_id, fiscal_year, amount, factor,
    rating_label, state, source, rejection_reason, created_by, created_at,
    modified_by, modified_at, version, batch_id";

fn rating_from_row(row: &Row<'_>) -> rusqlite::Result<Rating> {
    let amount: String = row.get(4)?;
    let factor: String = row.get(5)?;
    let state: String = row.get(7)?;
    let source: String = row.get(8)?;
    let created_at: String = row.get(11)?;
    let modified_at: Option<String> = row.get(13)?;

    Ok(Rating {
        id: row.get(0)?,
        party_id: row.get(1)?,
        instrument_id: row.get(2)?,
        fiscal_year: row.get(3)?,
        amount: parse_decimal(&amount, 4)?,
        factor: parse_decimal(&factor, 5)?,
        rating_label: row.get(6)?,
        state: RatingState::parse(&state).ok_or_else(|| bad_enum(7, &state))?,
        source: RatingSource::parse(&source).ok_or_else(|| bad_enum(8, &source))?,
        rejection_reason: row.get(9)?,
        created_by: row.get(10)?,
        created_at: parse_datetime(&created_at, 11)?,
        modified_by: row.get(12)?,
        modified_at: modified_at
            .as_deref()
            .map(|s| parse_datetime(s, 13))
            .transpose()?,
        version: row.get(14)?,
        batch_id: row.get(15)?,
    })
}

/// Insert a fully built rating; returns it with the assigned id.
pub fn insert_rating(conn: &Connection, rating: &Rating) -> CoreResult<Rating> {
    conn.execute(
        "INSERT INTO ratings (party_id, instrument_id, fiscal_year, amount, factor,
            rating_label, state, source, rejection_reason, created_by, created_at,
            modified_by, modified_at, version, batch_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            rating.party_id,
            rating.instrument_id,
            rating.fiscal_year,
            rating.amount.to_string(),
            rating.factor.to_string(),
            rating.rating_label,
            rating.state.as_str(),
            rating.source.as_str(),
            rating.rejection_reason,
            rating.created_by,
            rating.created_at.to_rfc3339(),
            rating.modified_by,
            rating.modified_at.map(|dt| dt.to_rfc3339()),
            rating.version,
            rating.batch_id,
        ],
    )?;

    let mut created = rating.clone();
    created.id = conn.last_insert_rowid();
    Ok(created)
}

pub fn get_rating(conn: &Connection, id: i64) -> CoreResult<Option<Rating>> {
    let sql = format!("SELECT {RATING_COLUMNS} FROM ratings WHERE id = ?1");
    let rating = conn
        .query_row(&sql, params![id], rating_from_row)
        .optional()?;
    Ok(rating)
}

/// The current rating for a natural key, if one exists.
pub fn find_current(
    conn: &Connection,
    party_id: i64,
    instrument_id: Option<i64>,
    fiscal_year: i32,
) -> CoreResult<Option<Rating>> {
    let sql = format!(
        "SELECT {RATING_COLUMNS} FROM ratings
         WHERE party_id = ?1
           AND IFNULL(instrument_id, 0) = IFNULL(?2, 0)
           AND fiscal_year = ?3
           AND state = 'current'"
    );
    let rating = conn
        .query_row(
            &sql,
            params![party_id, instrument_id, fiscal_year],
            rating_from_row,
        )
        .optional()?;
    Ok(rating)
}

/// Persist every mutable field of a rating, guarded by the version the
/// caller read. Returns false when the guard missed (stale version or row
/// gone), in which case nothing was written.
pub fn update_rating_checked(
    conn: &Connection,
    rating: &Rating,
    expected_version: i64,
) -> CoreResult<bool> {
    let changed = conn.execute(
        "UPDATE ratings SET
            party_id = ?1, instrument_id = ?2, fiscal_year = ?3, amount = ?4,
            factor = ?5, rating_label = ?6, state = ?7, rejection_reason = ?8,
            modified_by = ?9, modified_at = ?10, version = version + 1
         WHERE id = ?11 AND version = ?12",
        params![
            rating.party_id,
            rating.instrument_id,
            rating.fiscal_year,
            rating.amount.to_string(),
            rating.factor.to_string(),
            rating.rating_label,
            rating.state.as_str(),
            rating.rejection_reason,
            rating.modified_by,
            rating.modified_at.map(|dt| dt.to_rfc3339()),
            rating.id,
            expected_version,
        ],
    )?;
    Ok(changed == 1)
}

pub fn list_ratings(conn: &Connection) -> CoreResult<Vec<Rating>> {
    let sql = format!("SELECT {RATING_COLUMNS} FROM ratings ORDER BY created_at DESC, id DESC");
    let mut stmt = conn.prepare(&sql)?;
    let ratings = stmt
        .query_map([], rating_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ratings)
}

// ============================================================================
// APPROVALS
// ============================================================================

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<Approval> {
    let state: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    let resolved_at: Option<String> = row.get(6)?;
    Ok(Approval {
        id: row.get(0)?,
        rating_id: row.get(1)?,
        state: ApprovalState::parse(&state).ok_or_else(|| bad_enum(2, &state))?,
        reviewer_id: row.get(3)?,
        reason: row.get(4)?,
        created_at: parse_datetime(&created_at, 5)?,
        resolved_at: resolved_at
            .as_deref()
            .map(|s| parse_datetime(s, 6))
            .transpose()?,
    })
}

pub fn insert_approval(
    conn: &Connection,
    rating_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<Approval> {
    conn.execute(
        "INSERT INTO approvals (rating_id, state, created_at) VALUES (?1, 'pending', ?2)",
        params![rating_id, now.to_rfc3339()],
    )?;
    let id = conn.last_insert_rowid();
    get_approval(conn, id)?.ok_or_else(|| CoreError::not_found("approval", id))
}

pub fn get_approval(conn: &Connection, id: i64) -> CoreResult<Option<Approval>> {
    let approval = conn
        .query_row(
            "SELECT id, rating_id, state, reviewer_id, reason, created_at, resolved_at
             FROM approvals WHERE id = ?1",
            params![id],
            approval_from_row,
        )
        .optional()?;
    Ok(approval)
}

pub fn find_open_approval(conn: &Connection, rating_id: i64) -> CoreResult<Option<Approval>> {
    let approval = conn
        .query_row(
            "SELECT id, rating_id, state, reviewer_id, reason, created_at, resolved_at
             FROM approvals WHERE rating_id = ?1 AND state = 'pending'",
            params![rating_id],
            approval_from_row,
        )
        .optional()?;
    Ok(approval)
}

pub fn resolve_approval_row(conn: &Connection, approval: &Approval) -> CoreResult<()> {
    conn.execute(
        "UPDATE approvals SET state = ?1, reviewer_id = ?2, reason = ?3, resolved_at = ?4
         WHERE id = ?5",
        params![
            approval.state.as_str(),
            approval.reviewer_id,
            approval.reason,
            approval.resolved_at.map(|dt| dt.to_rfc3339()),
            approval.id,
        ],
    )?;
    Ok(())
}

// ============================================================================
// BATCHES
// ============================================================================

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<Batch> {
    let state: String = row.get(3)?;
    let created_at: String = row.get(9)?;
    let finished_at: Option<String> = row.get(10)?;
    Ok(Batch {
        id: row.get(0)?,
        file_ref: row.get(1)?,
        fingerprint: row.get(2)?,
        state: BatchState::parse(&state).ok_or_else(|| bad_enum(3, &state))?,
        total: row.get(4)?,
        succeeded: row.get(5)?,
        failed: row.get(6)?,
        summary: row.get(7)?,
        created_by: row.get(8)?,
        created_at: parse_datetime(&created_at, 9)?,
        finished_at: finished_at
            .as_deref()
            .map(|s| parse_datetime(s, 10))
            .transpose()?,
    })
}

pub fn insert_batch(
    conn: &Connection,
    file_ref: &str,
    fingerprint: &str,
    state: BatchState,
    created_by: Option<i64>,
    now: DateTime<Utc>,
) -> CoreResult<Batch> {
    conn.execute(
        "INSERT INTO batches (file_ref, fingerprint, state, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            file_ref,
            fingerprint,
            state.as_str(),
            created_by,
            now.to_rfc3339()
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_batch(conn, id)?.ok_or_else(|| CoreError::not_found("batch", id))
}

pub fn get_batch(conn: &Connection, id: i64) -> CoreResult<Option<Batch>> {
    let batch = conn
        .query_row(
            "SELECT id, file_ref, fingerprint, state, total, succeeded, failed,
                    summary, created_by, created_at, finished_at
             FROM batches WHERE id = ?1",
            params![id],
            batch_from_row,
        )
        .optional()?;
    Ok(batch)
}

pub fn finalize_batch(
    conn: &Connection,
    id: i64,
    state: BatchState,
    total: i64,
    succeeded: i64,
    failed: i64,
    summary: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE batches SET state = ?1, total = ?2, succeeded = ?3, failed = ?4,
            summary = ?5, finished_at = ?6
         WHERE id = ?7",
        params![
            state.as_str(),
            total,
            succeeded,
            failed,
            summary,
            now.to_rfc3339(),
            id
        ],
    )?;
    Ok(())
}

pub fn insert_batch_row(
    conn: &Connection,
    batch_id: i64,
    row_number: i64,
    payload: &str,
    outcome: RowOutcome,
    detail: Option<&str>,
    rating_id: Option<i64>,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO batch_rows (batch_id, row_number, payload, outcome, detail, rating_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            batch_id,
            row_number,
            payload,
            outcome.as_str(),
            detail,
            rating_id
        ],
    )?;
    Ok(())
}

/// Rows of a batch in ascending row-number order.
pub fn list_batch_rows(conn: &Connection, batch_id: i64) -> CoreResult<Vec<BatchRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, batch_id, row_number, payload, outcome, detail, rating_id
         FROM batch_rows WHERE batch_id = ?1 ORDER BY row_number ASC",
    )?;
    let rows = stmt
        .query_map(params![batch_id], |row| {
            let outcome: String = row.get(4)?;
            Ok(BatchRow {
                id: row.get(0)?,
                batch_id: row.get(1)?,
                row_number: row.get(2)?,
                payload: row.get(3)?,
                outcome: RowOutcome::parse(&outcome).ok_or_else(|| bad_enum(4, &outcome))?,
                detail: row.get(5)?,
                rating_id: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn seeded_rating(conn: &Connection, party_id: i64, year: i32) -> Rating {
        let rating = Rating {
            id: 0,
            party_id,
            instrument_id: None,
            fiscal_year: year,
            amount: dec!(1000.00),
            factor: dec!(50.00),
            rating_label: Some("AAA".to_string()),
            state: RatingState::Current,
            source: RatingSource::Manual,
            rejection_reason: None,
            created_by: Some(1),
            created_at: Utc::now(),
            modified_by: None,
            modified_at: None,
            version: 1,
            batch_id: None,
        };
        insert_rating(conn, &rating).unwrap()
    }

    #[test]
    fn test_party_tax_id_is_unique() {
        let conn = test_conn();
        insert_party(&conn, "Acme Holdings", "76.543.210-K", None, Utc::now()).unwrap();

        let dup = insert_party(&conn, "Other Name", "76.543.210-K", None, Utc::now());
        assert!(matches!(dup, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn test_rating_roundtrip_preserves_decimals() {
        let conn = test_conn();
        let party = insert_party(&conn, "Acme", "11.111.111-1", None, Utc::now()).unwrap();
        let created = seeded_rating(&conn, party.id, 2024);

        let loaded = get_rating(&conn, created.id).unwrap().unwrap();
        assert_eq!(loaded.amount, dec!(1000.00));
        assert_eq!(loaded.factor, dec!(50.00));
        assert_eq!(loaded.state, RatingState::Current);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_current_key_index_rejects_duplicate() {
        let conn = test_conn();
        let party = insert_party(&conn, "Acme", "11.111.111-1", None, Utc::now()).unwrap();
        let first = seeded_rating(&conn, party.id, 2024);

        let mut dup = first.clone();
        dup.id = 0;
        let err = insert_rating(&conn, &dup);
        assert!(err.is_err());
    }

    #[test]
    fn test_find_current_distinguishes_instruments() {
        let conn = test_conn();
        let party = insert_party(&conn, "Acme", "11.111.111-1", None, Utc::now()).unwrap();
        let instrument =
            insert_instrument(&conn, party.id, InstrumentKind::Bond, Some("Series B"), None)
                .unwrap();
        seeded_rating(&conn, party.id, 2024);

        assert!(find_current(&conn, party.id, None, 2024).unwrap().is_some());
        assert!(find_current(&conn, party.id, Some(instrument.id), 2024)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_version_guard_detects_stale_write() {
        let conn = test_conn();
        let party = insert_party(&conn, "Acme", "11.111.111-1", None, Utc::now()).unwrap();
        let mut rating = seeded_rating(&conn, party.id, 2024);

        rating.rating_label = Some("AA".to_string());
        assert!(update_rating_checked(&conn, &rating, 1).unwrap());
        // Stale: version moved to 2 by the first write
        assert!(!update_rating_checked(&conn, &rating, 1).unwrap());

        let loaded = get_rating(&conn, rating.id).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
    }

    #[test]
    fn test_batch_rows_ordered_and_unique() {
        let conn = test_conn();
        let batch = insert_batch(
            &conn,
            "ratings.csv",
            "abc123",
            BatchState::InProgress,
            Some(1),
            Utc::now(),
        )
        .unwrap();

        insert_batch_row(&conn, batch.id, 2, "b", RowOutcome::Error, Some("x"), None).unwrap();
        insert_batch_row(&conn, batch.id, 1, "a", RowOutcome::Ok, None, None).unwrap();

        let rows = list_batch_rows(&conn, batch.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_number, 1);
        assert_eq!(rows[1].row_number, 2);

        let dup = insert_batch_row(&conn, batch.id, 1, "c", RowOutcome::Ok, None, None);
        assert!(dup.is_err());
    }
}
