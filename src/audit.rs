// Audit Trail Recorder
//
// Append-only log of actions against a subject (rating, batch, party).
// Entries are written inside the caller's transaction: if the audit write
// fails the whole operation rolls back. Nothing in the engine ever mutates
// or deletes an entry; the trail is read back only for display.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::parse_datetime;
use crate::error::CoreResult;

// ============================================================================
// ACTIONS & SUBJECTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Create,
    Modify,
    Delete,
    Void,
    Restore,
    Approve,
    Reject,
    Export,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Modify => "modify",
            AuditAction::Delete => "delete",
            AuditAction::Void => "void",
            AuditAction::Restore => "restore",
            AuditAction::Approve => "approve",
            AuditAction::Reject => "reject",
            AuditAction::Export => "export",
        }
    }

    pub fn parse(s: &str) -> Option<AuditAction> {
        match s {
            "create" => Some(AuditAction::Create),
            "modify" => Some(AuditAction::Modify),
            "delete" => Some(AuditAction::Delete),
            "void" => Some(AuditAction::Void),
            "restore" => Some(AuditAction::Restore),
            "approve" => Some(AuditAction::Approve),
            "reject" => Some(AuditAction::Reject),
            "export" => Some(AuditAction::Export),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectType {
    Rating,
    Batch,
    Party,
    Instrument,
    /// Engine-level events with no single record as subject
    System,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Rating => "rating",
            SubjectType::Batch => "batch",
            SubjectType::Party => "party",
            SubjectType::Instrument => "instrument",
            SubjectType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<SubjectType> {
        match s {
            "rating" => Some(SubjectType::Rating),
            "batch" => Some(SubjectType::Batch),
            "party" => Some(SubjectType::Party),
            "instrument" => Some(SubjectType::Instrument),
            "system" => Some(SubjectType::System),
            _ => None,
        }
    }
}

// ============================================================================
// ENTRIES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    /// Stable external identifier of the entry
    pub entry_id: String,
    pub subject_type: String,
    pub subject_id: String,
    /// None for system actions
    pub actor_id: Option<i64>,
    pub action: AuditAction,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Write one audit entry. Call under the transaction of the operation that
/// caused it.
pub fn record(
    conn: &Connection,
    subject_type: SubjectType,
    subject_id: i64,
    actor_id: Option<i64>,
    action: AuditAction,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO audit_entries (entry_id, subject_type, subject_id, actor_id, action, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            uuid::Uuid::new_v4().to_string(),
            subject_type.as_str(),
            subject_id.to_string(),
            actor_id,
            action.as_str(),
            detail,
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Entries for one subject in chronological order.
pub fn trail(
    conn: &Connection,
    subject_type: SubjectType,
    subject_id: i64,
) -> CoreResult<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, entry_id, subject_type, subject_id, actor_id, action, detail, created_at
         FROM audit_entries
         WHERE subject_type = ?1 AND subject_id = ?2
         ORDER BY created_at ASC, id ASC",
    )?;

    let entries = stmt
        .query_map(params![subject_type.as_str(), subject_id.to_string()], |row| {
            let action: String = row.get(5)?;
            let created_at: String = row.get(7)?;
            Ok(AuditEntry {
                id: row.get(0)?,
                entry_id: row.get(1)?,
                subject_type: row.get(2)?,
                subject_id: row.get(3)?,
                actor_id: row.get(4)?,
                action: AuditAction::parse(&action).ok_or(rusqlite::Error::InvalidQuery)?,
                detail: row.get(6)?,
                created_at: parse_datetime(&created_at, 7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_record_and_trail_order() {
        let conn = test_conn();

        record(&conn, SubjectType::Rating, 7, Some(1), AuditAction::Create, None, Utc::now())
            .unwrap();
        record(
            &conn,
            SubjectType::Rating,
            7,
            Some(2),
            AuditAction::Void,
            Some("voided by supervisor"),
            Utc::now(),
        )
        .unwrap();
        // Different subject, must not show up
        record(&conn, SubjectType::Batch, 7, None, AuditAction::Create, None, Utc::now()).unwrap();

        let entries = trail(&conn, SubjectType::Rating, 7).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::Create);
        assert_eq!(entries[1].action, AuditAction::Void);
        assert_eq!(entries[1].detail.as_deref(), Some("voided by supervisor"));
    }

    #[test]
    fn test_system_actions_have_no_actor() {
        let conn = test_conn();
        record(&conn, SubjectType::Batch, 1, None, AuditAction::Create, None, Utc::now()).unwrap();

        let entries = trail(&conn, SubjectType::Batch, 1).unwrap();
        assert_eq!(entries[0].actor_id, None);
    }

    #[test]
    fn test_action_roundtrip() {
        let actions = [
            AuditAction::Create,
            AuditAction::Modify,
            AuditAction::Delete,
            AuditAction::Void,
            AuditAction::Restore,
            AuditAction::Approve,
            AuditAction::Reject,
            AuditAction::Export,
        ];
        for action in actions {
            assert_eq!(AuditAction::parse(action.as_str()), Some(action));
        }
    }
}
