// Party - the issuing entity a rating is about ("emisor")

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Party lifecycle status. Deactivation is a soft delete: the row stays,
/// referenced ratings stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyStatus {
    Active,
    Inactive,
}

impl PartyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyStatus::Active => "active",
            PartyStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<PartyStatus> {
        match s {
            "active" => Some(PartyStatus::Active),
            "inactive" => Some(PartyStatus::Inactive),
            _ => None,
        }
    }
}

/// An issuing entity. `tax_id` is the natural key: at most one party per
/// tax id. Legal name and tax id are fixed once a rating references the
/// party; contact metadata may still change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: i64,
    pub legal_name: String,
    pub tax_id: String,
    pub contact_email: Option<String>,
    pub status: PartyStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [PartyStatus::Active, PartyStatus::Inactive] {
            assert_eq!(PartyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PartyStatus::parse("deleted"), None);
    }
}
