// Rating Engine Facade
//
// Single entry point tying the components together: every operation runs
// the role check first, then the party scope check where one applies, and
// only then touches the store. A scoping failure on an existing record is
// reported as not-found so the caller learns nothing about records outside
// its scope; a scoping failure on a create is a plain denial.

use rusqlite::Connection;
use std::path::Path;
use tracing::info;

use crate::audit::{self, AuditAction, AuditEntry, SubjectType};
use crate::authz::{authorize, authorize_party, ActionTag, Actor, ScopeLookup};
use crate::clock::{Clock, SystemClock};
use crate::db;
use crate::entities::{
    Approval, ApprovalOutcome, Batch, BatchResult, BatchRow, Instrument, InstrumentKind, Party,
    Rating, RatingChanges, RatingDraft, RatingSource,
};
use crate::error::{CoreError, CoreResult};
use crate::ingest::{self, FileStore, LocalFileStore};
use crate::params::{self, Parameter};
use crate::store;
use crate::workflow;

pub struct RatingEngine {
    conn: Connection,
    clock: Box<dyn Clock>,
    scope: Option<Box<dyn ScopeLookup>>,
    files: Box<dyn FileStore>,
}

impl RatingEngine {
    /// Open (or create) the engine database at the given path.
    pub fn open(path: &Path) -> CoreResult<RatingEngine> {
        let conn = Connection::open(path)?;
        db::setup_database(&conn)?;
        Ok(RatingEngine::with_connection(conn))
    }

    pub fn in_memory() -> CoreResult<RatingEngine> {
        let conn = Connection::open_in_memory()?;
        db::setup_database(&conn)?;
        Ok(RatingEngine::with_connection(conn))
    }

    pub fn with_connection(conn: Connection) -> RatingEngine {
        RatingEngine {
            conn,
            clock: Box::new(SystemClock),
            scope: None,
            files: Box::new(LocalFileStore::new(".")),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> RatingEngine {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_scope(mut self, scope: impl ScopeLookup + 'static) -> RatingEngine {
        self.scope = Some(Box::new(scope));
        self
    }

    pub fn with_files(mut self, files: impl FileStore + 'static) -> RatingEngine {
        self.files = Box::new(files);
        self
    }

    fn scope_lookup(&self) -> Option<&dyn ScopeLookup> {
        self.scope.as_deref()
    }

    /// Load a rating the actor is allowed to act on. A rating outside the
    /// actor's party scope is indistinguishable from a missing one.
    fn scoped_rating(&self, actor: &Actor, id: i64) -> CoreResult<Rating> {
        let rating =
            db::get_rating(&self.conn, id)?.ok_or_else(|| CoreError::not_found("rating", id))?;
        if authorize_party(actor, rating.party_id, self.scope_lookup()).is_err() {
            return Err(CoreError::not_found("rating", id));
        }
        Ok(rating)
    }

    // ------------------------------------------------------------------
    // Ratings
    // ------------------------------------------------------------------

    pub fn create_rating(&mut self, actor: &Actor, draft: &RatingDraft) -> CoreResult<Rating> {
        authorize(actor, ActionTag::CreateRating)?;
        authorize_party(actor, draft.party_id, self.scope_lookup())?;
        store::create(
            &mut self.conn,
            self.clock.as_ref(),
            draft,
            RatingSource::Manual,
            Some(actor.id),
        )
    }

    pub fn update_rating(
        &mut self,
        actor: &Actor,
        id: i64,
        changes: &RatingChanges,
    ) -> CoreResult<Rating> {
        authorize(actor, ActionTag::UpdateRating)?;
        self.scoped_rating(actor, id)?;
        if let Some(new_party) = changes.party_id {
            authorize_party(actor, new_party, self.scope_lookup())?;
        }
        store::update(&mut self.conn, self.clock.as_ref(), id, changes, Some(actor.id))
    }

    pub fn void_rating(&mut self, actor: &Actor, id: i64) -> CoreResult<Rating> {
        authorize(actor, ActionTag::VoidRating)?;
        self.scoped_rating(actor, id)?;
        store::void(&mut self.conn, self.clock.as_ref(), id, Some(actor.id))
    }

    pub fn restore_rating(&mut self, actor: &Actor, id: i64) -> CoreResult<Rating> {
        authorize(actor, ActionTag::RestoreRating)?;
        self.scoped_rating(actor, id)?;
        store::restore(&mut self.conn, self.clock.as_ref(), id, Some(actor.id))
    }

    pub fn rating(&self, id: i64) -> CoreResult<Option<Rating>> {
        db::get_rating(&self.conn, id)
    }

    pub fn current_rating(
        &self,
        party_id: i64,
        instrument_id: Option<i64>,
        fiscal_year: i32,
    ) -> CoreResult<Option<Rating>> {
        db::find_current(&self.conn, party_id, instrument_id, fiscal_year)
    }

    // ------------------------------------------------------------------
    // Approval workflow
    // ------------------------------------------------------------------

    pub fn request_approval(&mut self, actor: &Actor, rating_id: i64) -> CoreResult<Approval> {
        authorize(actor, ActionTag::RequestApproval)?;
        self.scoped_rating(actor, rating_id)?;
        workflow::open(&mut self.conn, self.clock.as_ref(), rating_id)
    }

    pub fn resolve_approval(
        &mut self,
        actor: &Actor,
        approval_id: i64,
        outcome: ApprovalOutcome,
        reason: Option<&str>,
    ) -> CoreResult<Approval> {
        authorize(actor, ActionTag::ResolveApproval)?;
        workflow::resolve(
            &mut self.conn,
            self.clock.as_ref(),
            approval_id,
            outcome,
            reason,
            actor.id,
        )
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub fn submit_batch(&mut self, actor: &Actor, file_ref: &str) -> CoreResult<BatchResult> {
        authorize(actor, ActionTag::SubmitBatch)?;
        ingest::run(
            &mut self.conn,
            self.clock.as_ref(),
            self.files.as_ref(),
            file_ref,
            actor,
            self.scope.as_deref(),
        )
    }

    pub fn batch_detail(&self, actor: &Actor, batch_id: i64) -> CoreResult<(Batch, Vec<BatchRow>)> {
        authorize(actor, ActionTag::SubmitBatch)?;
        let batch = db::get_batch(&self.conn, batch_id)?
            .ok_or_else(|| CoreError::not_found("batch", batch_id))?;
        let rows = db::list_batch_rows(&self.conn, batch_id)?;
        Ok((batch, rows))
    }

    pub fn mark_batch_failed(
        &mut self,
        actor: &Actor,
        batch_id: i64,
        reason: &str,
    ) -> CoreResult<()> {
        authorize(actor, ActionTag::MarkBatchFailed)?;
        ingest::mark_failed(
            &mut self.conn,
            self.clock.as_ref(),
            batch_id,
            Some(actor.id),
            reason,
        )
    }

    // ------------------------------------------------------------------
    // Audit & export
    // ------------------------------------------------------------------

    pub fn audit_trail(
        &self,
        actor: &Actor,
        subject_type: SubjectType,
        subject_id: i64,
    ) -> CoreResult<Vec<AuditEntry>> {
        authorize(actor, ActionTag::ViewAuditTrail)?;
        audit::trail(&self.conn, subject_type, subject_id)
    }

    /// Read every rating and leave a trace of the export in the audit log.
    pub fn export_ratings(&mut self, actor: &Actor) -> CoreResult<Vec<Rating>> {
        authorize(actor, ActionTag::ExportRatings)?;
        let ratings = db::list_ratings(&self.conn)?;
        audit::record(
            &self.conn,
            SubjectType::System,
            0,
            Some(actor.id),
            AuditAction::Export,
            Some(&format!("exported {} ratings", ratings.len())),
            self.clock.now(),
        )?;
        info!(actor_id = actor.id, count = ratings.len(), "ratings exported");
        Ok(ratings)
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub fn create_party(
        &mut self,
        actor: &Actor,
        legal_name: &str,
        tax_id: &str,
        contact_email: Option<&str>,
    ) -> CoreResult<Party> {
        authorize(actor, ActionTag::ManageParties)?;
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        let party = db::insert_party(&tx, legal_name, tax_id, contact_email, now)?;
        audit::record(
            &tx,
            SubjectType::Party,
            party.id,
            Some(actor.id),
            AuditAction::Create,
            None,
            now,
        )?;
        tx.commit()?;
        Ok(party)
    }

    pub fn create_instrument(
        &mut self,
        actor: &Actor,
        party_id: i64,
        kind: InstrumentKind,
        name: Option<&str>,
        description: Option<&str>,
    ) -> CoreResult<Instrument> {
        authorize(actor, ActionTag::ManageParties)?;
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        if db::get_party(&tx, party_id)?.is_none() {
            return Err(CoreError::not_found("party", party_id));
        }
        let instrument = db::insert_instrument(&tx, party_id, kind, name, description)?;
        audit::record(
            &tx,
            SubjectType::Instrument,
            instrument.id,
            Some(actor.id),
            AuditAction::Create,
            None,
            now,
        )?;
        tx.commit()?;
        Ok(instrument)
    }

    /// Record a new version of a system parameter. Earlier versions stay in
    /// place for traceability.
    pub fn set_parameter(
        &mut self,
        actor: &Actor,
        key: &str,
        value: &str,
        kind: &str,
        description: Option<&str>,
    ) -> CoreResult<Parameter> {
        authorize(actor, ActionTag::ManageParties)?;
        params::set(&self.conn, key, value, kind, description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Role, StaticScope};
    use crate::clock::FixedClock;
    use crate::entities::RatingState;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::io::Read;

    struct MemFiles(HashMap<String, Vec<u8>>);

    impl FileStore for MemFiles {
        fn open(&self, file_ref: &str) -> CoreResult<Box<dyn Read>> {
            match self.0.get(file_ref) {
                Some(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
                None => Err(CoreError::BatchSource(format!("{file_ref} not stored"))),
            }
        }
    }

    fn admin() -> Actor {
        Actor::new(1, [Role::Admin])
    }

    fn accountant(id: i64) -> Actor {
        Actor::new(id, [Role::Accountant])
    }

    fn supervisor() -> Actor {
        Actor::new(3, [Role::Supervisor])
    }

    fn engine() -> RatingEngine {
        RatingEngine::in_memory()
            .unwrap()
            .with_clock(FixedClock(Utc.with_ymd_and_hms(2025, 3, 15, 10, 0, 0).unwrap()))
    }

    fn draft(party_id: i64, year: i32) -> RatingDraft {
        RatingDraft {
            party_id,
            instrument_id: None,
            fiscal_year: year,
            amount: dec!(1000.00),
            factor: None,
            rating_label: None,
        }
    }

    #[test]
    fn test_admin_manages_parties_and_creates_rating() {
        let mut engine = engine();
        let admin = admin();

        let party = engine
            .create_party(&admin, "Acme Holdings", "11.111.111-1", None)
            .unwrap();
        let rating = engine.create_rating(&admin, &draft(party.id, 2024)).unwrap();

        assert_eq!(rating.state, RatingState::Current);
        assert_eq!(rating.factor, dec!(50.00));

        let trail = engine
            .audit_trail(&admin, SubjectType::Rating, rating.id)
            .unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::Create);
    }

    #[test]
    fn test_party_create_rolls_back_when_audit_write_fails() {
        let mut engine = engine();
        engine.conn.execute_batch("DROP TABLE audit_entries").unwrap();

        let err = engine.create_party(&admin(), "Acme", "11.111.111-1", None);
        assert!(matches!(err, Err(CoreError::Storage(_))));

        let parties: i64 = engine
            .conn
            .query_row("SELECT COUNT(*) FROM parties", [], |r| r.get(0))
            .unwrap();
        assert_eq!(parties, 0);
    }

    #[test]
    fn test_investor_cannot_create_rating() {
        let mut engine = engine();
        let admin = admin();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();

        let investor = Actor::new(9, [Role::Investor]);
        let err = engine.create_rating(&investor, &draft(party.id, 2024));
        assert!(matches!(err, Err(CoreError::Authorization)));
    }

    #[test]
    fn test_inactive_actor_is_denied() {
        let mut engine = engine();
        let admin = admin();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();

        let mut actor = accountant(5);
        actor.is_active = false;
        let err = engine.create_rating(&actor, &draft(party.id, 2024));
        assert!(matches!(err, Err(CoreError::Authorization)));
    }

    #[test]
    fn test_unscoped_accountant_leaves_no_trace() {
        let mut engine = engine().with_scope(StaticScope::new().assign(5, 999));
        let admin = admin();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();

        let err = engine.create_rating(&accountant(5), &draft(party.id, 2024));
        assert!(matches!(err, Err(CoreError::Authorization)));

        // Denial happened before the store: no rating, no audit entry
        assert!(engine.current_rating(party.id, None, 2024).unwrap().is_none());
        let trail = engine.audit_trail(&admin, SubjectType::Rating, 1).unwrap();
        assert!(trail.is_empty());
    }

    #[test]
    fn test_scoped_accountant_creates_within_assignment() {
        let admin = admin();
        let mut engine = engine();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();
        let mut engine = engine.with_scope(StaticScope::new().assign(5, party.id));

        let rating = engine
            .create_rating(&accountant(5), &draft(party.id, 2024))
            .unwrap();
        assert_eq!(rating.created_by, Some(5));
    }

    #[test]
    fn test_out_of_scope_rating_reads_as_missing() {
        let admin = admin();
        let mut engine = engine();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();
        let rating = engine.create_rating(&admin, &draft(party.id, 2024)).unwrap();

        let mut engine = engine.with_scope(StaticScope::new().assign(5, 999));
        let changes = RatingChanges {
            expected_version: rating.version,
            amount: Some(dec!(2000.00)),
            ..Default::default()
        };
        let err = engine.update_rating(&accountant(5), rating.id, &changes);
        assert!(matches!(err, Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn test_void_and_restore_through_facade() {
        let mut engine = engine();
        let admin = admin();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();
        let rating = engine.create_rating(&admin, &draft(party.id, 2024)).unwrap();

        // Accountants cannot restore
        engine.void_rating(&admin, rating.id).unwrap();
        let err = engine.restore_rating(&accountant(5), rating.id);
        assert!(matches!(err, Err(CoreError::Authorization)));

        let restored = engine.restore_rating(&supervisor(), rating.id).unwrap();
        assert_eq!(restored.state, RatingState::Current);
    }

    #[test]
    fn test_approval_cycle_through_facade() {
        let mut engine = engine();
        let admin = admin();
        engine
            .set_parameter(&admin, crate::params::APPROVAL_REQUIRED, "true", "bool", None)
            .unwrap();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();

        let rating = engine.create_rating(&admin, &draft(party.id, 2024)).unwrap();
        assert_eq!(rating.state, RatingState::PendingApproval);

        // Accountants cannot resolve
        let err = engine.resolve_approval(&accountant(5), 1, ApprovalOutcome::Approved, None);
        assert!(matches!(err, Err(CoreError::Authorization)));

        engine
            .resolve_approval(&supervisor(), 1, ApprovalOutcome::Approved, None)
            .unwrap();
        let rating = engine.rating(rating.id).unwrap().unwrap();
        assert_eq!(rating.state, RatingState::Current);
    }

    #[test]
    fn test_batch_through_facade() {
        let mut engine = engine();
        let admin = admin();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();

        let csv = format!(
            "party_id,fiscal_year,amount\n{p},2024,100.00\n{p},2023,-1\n",
            p = party.id
        );
        let mut files = HashMap::new();
        files.insert("upload.csv".to_string(), csv.into_bytes());
        let mut engine = engine.with_files(MemFiles(files));

        let result = engine.submit_batch(&accountant(5), "upload.csv").unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);

        let (batch, rows) = engine.batch_detail(&admin, result.batch_id).unwrap();
        assert_eq!(batch.succeeded, 1);
        assert_eq!(rows.len(), 2);

        // Only admins close batches administratively
        let err = engine.mark_batch_failed(&supervisor(), result.batch_id, "stale");
        assert!(matches!(err, Err(CoreError::Authorization)));
    }

    #[test]
    fn test_batch_import_denied_like_direct_create_for_unscoped_party() {
        let admin = admin();
        let mut engine = engine();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();

        let csv = format!("party_id,fiscal_year,amount\n{p},2024,100.00\n", p = party.id);
        let mut files = HashMap::new();
        files.insert("upload.csv".to_string(), csv.into_bytes());
        let mut engine = engine
            .with_scope(StaticScope::new().assign(5, 999))
            .with_files(MemFiles(files));

        // The direct create is denied for this actor and party
        let err = engine.create_rating(&accountant(5), &draft(party.id, 2024));
        assert!(matches!(err, Err(CoreError::Authorization)));

        // The batch path must not admit the same rating
        let result = engine.submit_batch(&accountant(5), "upload.csv").unwrap();
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failed, 1);
        assert!(engine.current_rating(party.id, None, 2024).unwrap().is_none());

        let (_, rows) = engine.batch_detail(&admin, result.batch_id).unwrap();
        assert!(rows[0]
            .detail
            .as_ref()
            .unwrap()
            .contains("party_not_assigned"));
    }

    #[test]
    fn test_export_is_audited() {
        let mut engine = engine();
        let admin = admin();
        let party = engine
            .create_party(&admin, "Acme", "11.111.111-1", None)
            .unwrap();
        engine.create_rating(&admin, &draft(party.id, 2024)).unwrap();

        let ratings = engine.export_ratings(&accountant(5)).unwrap();
        assert_eq!(ratings.len(), 1);

        let trail = engine.audit_trail(&admin, SubjectType::System, 0).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::Export);
    }

    #[test]
    fn test_audit_trail_requires_supervisor() {
        let engine = engine();
        let err = engine.audit_trail(&accountant(5), SubjectType::Rating, 1);
        assert!(matches!(err, Err(CoreError::Authorization)));
    }
}
