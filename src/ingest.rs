// Ingestion Pipeline
//
// Imports rating rows from one uploaded CSV file. The file is fully read
// and parsed before processing begins; rows are then processed in file
// order, each under its own transaction, so one row's failure never aborts
// or rolls back another row. Row-level errors are downgraded to ledger
// outcomes; only a pipeline-level failure (unreadable source) marks the
// batch failed.

use rust_decimal::Decimal;
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditAction, SubjectType};
use crate::authz::{authorize_party, Actor, ScopeLookup};
use crate::clock::Clock;
use crate::db;
use crate::entities::{BatchResult, BatchState, RatingDraft, RatingSource, RowOutcome};
use crate::error::{CoreError, CoreResult};
use crate::store;

// ============================================================================
// FILE STORAGE
// ============================================================================

/// Opens an already-stored source file by its stable reference. Storage
/// location, retention and deletion are someone else's problem.
pub trait FileStore: Send + Sync {
    fn open(&self, file_ref: &str) -> CoreResult<Box<dyn Read>>;
}

/// File storage rooted at a local directory; the file reference is a path
/// relative to the root.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFileStore { root: root.into() }
    }
}

impl FileStore for LocalFileStore {
    fn open(&self, file_ref: &str) -> CoreResult<Box<dyn Read>> {
        let path = self.root.join(file_ref);
        let file = File::open(&path)
            .map_err(|e| CoreError::BatchSource(format!("{}: {e}", path.display())))?;
        Ok(Box::new(file))
    }
}

// ============================================================================
// ROW PARSING
// ============================================================================

/// One parsed input row: the candidate rating plus the supersede marker.
#[derive(Debug, Clone)]
struct ParsedRow {
    draft: RatingDraft,
    supersede: bool,
}

/// Column layout of the batch file. `party_id`, `fiscal_year` and `amount`
/// are required; the rest are optional.
struct Columns {
    party_id: usize,
    fiscal_year: usize,
    amount: usize,
    instrument_id: Option<usize>,
    factor: Option<usize>,
    rating_label: Option<usize>,
    supersede: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> CoreResult<Columns> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        let require = |name: &'static str| {
            find(name).ok_or_else(|| CoreError::BatchSource(format!("missing column '{name}'")))
        };
        Ok(Columns {
            party_id: require("party_id")?,
            fiscal_year: require("fiscal_year")?,
            amount: require("amount")?,
            instrument_id: find("instrument_id"),
            factor: find("factor"),
            rating_label: find("rating_label"),
            supersede: find("supersede"),
        })
    }

    fn parse(&self, record: &csv::StringRecord) -> Result<ParsedRow, String> {
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();
        let optional = |idx: Option<usize>| idx.map(field).filter(|s| !s.is_empty());

        let party_id = field(self.party_id)
            .parse::<i64>()
            .map_err(|_| format!("party_id '{}' is not an integer", field(self.party_id)))?;
        let fiscal_year = field(self.fiscal_year)
            .parse::<i32>()
            .map_err(|_| format!("fiscal_year '{}' is not an integer", field(self.fiscal_year)))?;
        let amount = Decimal::from_str(field(self.amount))
            .map_err(|_| format!("amount '{}' is not a decimal", field(self.amount)))?;
        let instrument_id = optional(self.instrument_id)
            .map(|s| s.parse::<i64>().map_err(|_| format!("instrument_id '{s}' is not an integer")))
            .transpose()?;
        let factor = optional(self.factor)
            .map(|s| Decimal::from_str(s).map_err(|_| format!("factor '{s}' is not a decimal")))
            .transpose()?;
        let rating_label = optional(self.rating_label).map(|s| s.to_string());
        let supersede = matches!(
            optional(self.supersede).unwrap_or(""),
            "true" | "1" | "yes"
        );

        Ok(ParsedRow {
            draft: RatingDraft {
                party_id,
                instrument_id,
                fiscal_year,
                amount,
                factor,
                rating_label,
            },
            supersede,
        })
    }
}

fn record_payload(record: &csv::StringRecord) -> String {
    record.iter().collect::<Vec<_>>().join(",")
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Run a batch import. Returns the aggregate result; the per-row ledger is
/// readable through the batch detail query. Party scoping applies per row:
/// a row naming a party outside the submitter's assignment fails with an
/// error outcome, exactly as the direct create would be denied.
pub fn run(
    conn: &mut Connection,
    clock: &dyn Clock,
    files: &dyn FileStore,
    file_ref: &str,
    actor: &Actor,
    scope: Option<&dyn ScopeLookup>,
) -> CoreResult<BatchResult> {
    let actor_id = Some(actor.id);
    // Read and parse the whole file up front; a failure here is a
    // pipeline-level abort recorded as a failed batch.
    let records = match read_source(files, file_ref) {
        Ok(parsed) => parsed,
        Err(e) => {
            record_failed_batch(conn, clock, file_ref, actor_id, &e)?;
            return Err(e);
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(&records.bytes);
    let fingerprint = format!("{:x}", hasher.finalize());

    let batch = {
        let tx = conn.transaction()?;
        let batch = db::insert_batch(
            &tx,
            file_ref,
            &fingerprint,
            BatchState::InProgress,
            actor_id,
            clock.now(),
        )?;
        // One audit entry for the whole batch; per-row detail lives in the
        // ledger, not in the audit trail.
        audit::record(
            &tx,
            SubjectType::Batch,
            batch.id,
            actor_id,
            AuditAction::Create,
            Some(&format!("file={file_ref}")),
            clock.now(),
        )?;
        tx.commit()?;
        batch
    };

    let mut succeeded: i64 = 0;
    let mut failed: i64 = 0;

    for (index, record) in records.rows.iter().enumerate() {
        let row_number = index as i64 + 1;
        match process_row(conn, clock, &records.columns, record, row_number, batch.id, actor, scope) {
            Ok(rating_id) => {
                succeeded += 1;
                debug!(batch_id = batch.id, row_number, rating_id, "row imported");
            }
            Err(detail) => {
                failed += 1;
                warn!(batch_id = batch.id, row_number, "row failed");
                db::insert_batch_row(
                    conn,
                    batch.id,
                    row_number,
                    &record_payload(record),
                    RowOutcome::Error,
                    Some(&detail),
                    None,
                )?;
            }
        }
    }

    let total = records.rows.len() as i64;
    let summary = format!("{total} rows processed, {succeeded} ok, {failed} with errors");
    db::finalize_batch(
        conn,
        batch.id,
        BatchState::Completed,
        total,
        succeeded,
        failed,
        Some(&summary),
        clock.now(),
    )?;

    info!(batch_id = batch.id, total, succeeded, failed, "batch completed");
    Ok(BatchResult {
        batch_id: batch.id,
        total,
        succeeded,
        failed,
    })
}

struct SourceRecords {
    bytes: Vec<u8>,
    columns: Columns,
    rows: Vec<csv::StringRecord>,
}

fn read_source(files: &dyn FileStore, file_ref: &str) -> CoreResult<SourceRecords> {
    let mut reader = files.open(file_ref)?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| CoreError::BatchSource(e.to_string()))?;

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes.as_slice());
    let columns = Columns::from_headers(
        rdr.headers()
            .map_err(|e| CoreError::BatchSource(e.to_string()))?,
    )?;

    let mut rows = Vec::new();
    for record in rdr.records() {
        rows.push(record.map_err(|e| CoreError::BatchSource(e.to_string()))?);
    }

    Ok(SourceRecords { bytes, columns, rows })
}

/// Process one row in its own transaction. An error outcome carries the
/// serialized detail for the ledger; the transaction is rolled back and no
/// rating survives.
fn process_row(
    conn: &mut Connection,
    clock: &dyn Clock,
    columns: &Columns,
    record: &csv::StringRecord,
    row_number: i64,
    batch_id: i64,
    actor: &Actor,
    scope: Option<&dyn ScopeLookup>,
) -> Result<i64, String> {
    let parsed = match columns.parse(record) {
        Ok(parsed) => parsed,
        Err(message) => {
            return Err(detail_json("unparseable_row", &message));
        }
    };

    // Same party gate as a direct create; a denied row fails, the batch
    // continues.
    if authorize_party(actor, parsed.draft.party_id, scope).is_err() {
        return Err(detail_json(
            "party_not_assigned",
            &format!(
                "party {} is not assigned to the submitter",
                parsed.draft.party_id
            ),
        ));
    }
    let actor_id = Some(actor.id);

    let result: CoreResult<i64> = (|| {
        let tx = conn.transaction()?;

        if parsed.supersede {
            if let Some(existing) = db::find_current(
                &tx,
                parsed.draft.party_id,
                parsed.draft.instrument_id,
                parsed.draft.fiscal_year,
            )? {
                store::retire_in_tx(&tx, clock, &existing, actor_id)?;
            }
        }

        let rating = store::create_in_tx(
            &tx,
            clock,
            &parsed.draft,
            RatingSource::BatchImport,
            actor_id,
            Some(batch_id),
        )?;
        db::insert_batch_row(
            &tx,
            batch_id,
            row_number,
            &record_payload(record),
            RowOutcome::Ok,
            None,
            Some(rating.id),
        )?;
        tx.commit()?;
        Ok(rating.id)
    })();

    result.map_err(|e| match e {
        CoreError::Validation(violations) => {
            serde_json::to_string(&violations).unwrap_or_else(|_| joined_codes(&violations))
        }
        other => detail_json("row_failed", &other.to_string()),
    })
}

fn detail_json(code: &str, message: &str) -> String {
    json!([{ "code": code, "field": "", "message": message }]).to_string()
}

fn joined_codes(violations: &[crate::validation::Violation]) -> String {
    violations
        .iter()
        .map(|v| v.code.clone())
        .collect::<Vec<_>>()
        .join(",")
}

fn record_failed_batch(
    conn: &mut Connection,
    clock: &dyn Clock,
    file_ref: &str,
    actor_id: Option<i64>,
    error: &CoreError,
) -> CoreResult<()> {
    let tx = conn.transaction()?;
    let batch = db::insert_batch(
        &tx,
        file_ref,
        "",
        BatchState::Failed,
        actor_id,
        clock.now(),
    )?;
    db::finalize_batch(
        &tx,
        batch.id,
        BatchState::Failed,
        0,
        0,
        0,
        Some(&error.to_string()),
        clock.now(),
    )?;
    audit::record(
        &tx,
        SubjectType::Batch,
        batch.id,
        actor_id,
        AuditAction::Create,
        Some(&format!("file={file_ref} (unreadable)")),
        clock.now(),
    )?;
    tx.commit()?;
    Ok(())
}

/// Administrative close of an abandoned batch. Only an in-progress batch
/// may be marked failed.
pub fn mark_failed(
    conn: &mut Connection,
    clock: &dyn Clock,
    batch_id: i64,
    actor_id: Option<i64>,
    reason: &str,
) -> CoreResult<()> {
    let tx = conn.transaction()?;
    let batch =
        db::get_batch(&tx, batch_id)?.ok_or_else(|| CoreError::not_found("batch", batch_id))?;
    if batch.state != BatchState::InProgress {
        return Err(CoreError::invalid_state(
            batch.state.as_str(),
            "only an in-progress batch can be marked failed",
        ));
    }
    db::finalize_batch(
        &tx,
        batch_id,
        BatchState::Failed,
        batch.total,
        batch.succeeded,
        batch.failed,
        Some(reason),
        clock.now(),
    )?;
    audit::record(
        &tx,
        SubjectType::Batch,
        batch_id,
        actor_id,
        AuditAction::Modify,
        Some(reason),
        clock.now(),
    )?;
    tx.commit()?;
    Ok(())
}
