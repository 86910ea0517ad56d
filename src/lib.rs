// Rating Engine - Core Library
// Exposes all modules for use in the CLI and tests

pub mod audit;
pub mod authz;
pub mod clock;
pub mod db;
pub mod engine;
pub mod entities;
pub mod error;
pub mod ingest;
pub mod params;
pub mod store;
pub mod validation;
pub mod workflow;

// Re-export commonly used types
pub use audit::{AuditAction, AuditEntry, SubjectType};
pub use authz::{
    allowed_roles, authorize, authorize_party, ActionTag, Actor, Role, ScopeLookup, StaticScope,
    ROLE_PRIORITY,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use db::setup_database;
pub use engine::RatingEngine;
pub use entities::{
    Approval, ApprovalOutcome, ApprovalState, Batch, BatchResult, BatchRow, BatchState,
    Instrument, InstrumentKind, Party, PartyStatus, Rating, RatingChanges, RatingDraft,
    RatingSource, RatingState, RowOutcome,
};
pub use error::{CoreError, CoreResult};
pub use ingest::{FileStore, LocalFileStore};
pub use params::Parameter;
pub use validation::{compute_factor, validate, Violation, YearBounds};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
