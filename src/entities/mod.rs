// Entity Models - data model of the rating lifecycle engine
//
// Each entity carries:
// - A stable numeric identity assigned by the store
// - An exhaustive state enum (never a free-text status string)
// - String codecs (as_str/parse) for persistence

pub mod party;
pub mod instrument;
pub mod rating;
pub mod approval;
pub mod batch;

pub use party::{Party, PartyStatus};
pub use instrument::{Instrument, InstrumentKind};
pub use rating::{Rating, RatingChanges, RatingDraft, RatingSource, RatingState};
pub use approval::{Approval, ApprovalOutcome, ApprovalState};
pub use batch::{Batch, BatchResult, BatchRow, BatchState, RowOutcome};
