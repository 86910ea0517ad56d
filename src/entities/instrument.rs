// Instrument - a financial instrument issued by exactly one Party

use serde::{Deserialize, Serialize};

/// Instrument type, closed enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentKind {
    Equity,
    Bond,
    FundUnit,
    TimeDeposit,
    PromissoryNote,
    DebtInstrument,
    Other,
}

impl InstrumentKind {
    /// Short code for persistence and batch files
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Equity => "equity",
            InstrumentKind::Bond => "bond",
            InstrumentKind::FundUnit => "fund_unit",
            InstrumentKind::TimeDeposit => "time_deposit",
            InstrumentKind::PromissoryNote => "promissory_note",
            InstrumentKind::DebtInstrument => "debt_instrument",
            InstrumentKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<InstrumentKind> {
        match s {
            "equity" => Some(InstrumentKind::Equity),
            "bond" => Some(InstrumentKind::Bond),
            "fund_unit" => Some(InstrumentKind::FundUnit),
            "time_deposit" => Some(InstrumentKind::TimeDeposit),
            "promissory_note" => Some(InstrumentKind::PromissoryNote),
            "debt_instrument" => Some(InstrumentKind::DebtInstrument),
            "other" => Some(InstrumentKind::Other),
            _ => None,
        }
    }

    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            InstrumentKind::Equity => "Equity",
            InstrumentKind::Bond => "Bond",
            InstrumentKind::FundUnit => "Fund unit",
            InstrumentKind::TimeDeposit => "Time deposit",
            InstrumentKind::PromissoryNote => "Promissory note",
            InstrumentKind::DebtInstrument => "Debt instrument",
            InstrumentKind::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub id: i64,
    /// Owning party. A rating that references this instrument must
    /// reference the same party.
    pub party_id: i64,
    pub kind: InstrumentKind,
    pub name: Option<String>,
    pub description: Option<String>,
}
