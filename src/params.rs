// Versioned parameter store
//
// Named configuration values with monotonically increasing versions.
// Writers always append a new version; readers take the latest version at
// the time of computation and never cache across operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CoreResult;

// Well-known parameter keys
pub const BASE_FACTOR_COEFFICIENT: &str = "base_factor_coefficient";
pub const MIN_FISCAL_YEAR: &str = "min_fiscal_year";
pub const APPROVAL_REQUIRED: &str = "approval_required";

// Defaults used when no version of a parameter exists
pub const DEFAULT_FACTOR_COEFFICIENT: Decimal = dec!(0.05);
pub const DEFAULT_MIN_FISCAL_YEAR: i32 = 2023;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: String,
    pub kind: String,
    pub description: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Latest version of a parameter, None if never set.
pub fn latest(conn: &Connection, key: &str) -> CoreResult<Option<Parameter>> {
    let param = conn
        .query_row(
            "SELECT key, value, kind, description, version, created_at
             FROM parameters
             WHERE key = ?1
             ORDER BY version DESC
             LIMIT 1",
            params![key],
            |row| {
                let created_at: String = row.get(5)?;
                Ok(Parameter {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    kind: row.get(2)?,
                    description: row.get(3)?,
                    version: row.get(4)?,
                    created_at: crate::db::parse_datetime(&created_at, 5)?,
                })
            },
        )
        .optional()?;

    Ok(param)
}

/// Append a new version of a parameter (version = latest + 1).
pub fn set(
    conn: &Connection,
    key: &str,
    value: &str,
    kind: &str,
    description: Option<&str>,
) -> CoreResult<Parameter> {
    let version = latest(conn, key)?.map(|p| p.version + 1).unwrap_or(1);
    let now = Utc::now();

    conn.execute(
        "INSERT INTO parameters (key, value, kind, description, version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![key, value, kind, description, version, now.to_rfc3339()],
    )?;

    Ok(Parameter {
        key: key.to_string(),
        value: value.to_string(),
        kind: kind.to_string(),
        description: description.map(|s| s.to_string()),
        version,
        created_at: now,
    })
}

/// Latest decimal value of a parameter, or a default. Malformed stored
/// values fall back to the default rather than failing the computation.
pub fn decimal_or(conn: &Connection, key: &str, default: Decimal) -> CoreResult<Decimal> {
    Ok(latest(conn, key)?
        .and_then(|p| Decimal::from_str(&p.value).ok())
        .unwrap_or(default))
}

pub fn i32_or(conn: &Connection, key: &str, default: i32) -> CoreResult<i32> {
    Ok(latest(conn, key)?
        .and_then(|p| p.value.parse::<i32>().ok())
        .unwrap_or(default))
}

pub fn bool_or(conn: &Connection, key: &str, default: bool) -> CoreResult<bool> {
    Ok(latest(conn, key)?
        .map(|p| matches!(p.value.as_str(), "true" | "1" | "yes"))
        .unwrap_or(default))
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
    fn test_latest_returns_none_when_unset() {
        let conn = test_conn();
        assert!(latest(&conn, BASE_FACTOR_COEFFICIENT).unwrap().is_none());
    }

    #[test]
    fn test_set_increments_version() {
        let conn = test_conn();

        let v1 = set(&conn, MIN_FISCAL_YEAR, "2023", "int", None).unwrap();
        let v2 = set(&conn, MIN_FISCAL_YEAR, "2024", "int", None).unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let current = latest(&conn, MIN_FISCAL_YEAR).unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.value, "2024");
    }

    #[test]
    fn test_typed_accessors_with_defaults() {
        let conn = test_conn();

        assert_eq!(
            decimal_or(&conn, BASE_FACTOR_COEFFICIENT, DEFAULT_FACTOR_COEFFICIENT).unwrap(),
            dec!(0.05)
        );
        assert_eq!(i32_or(&conn, MIN_FISCAL_YEAR, 2023).unwrap(), 2023);
        assert!(!bool_or(&conn, APPROVAL_REQUIRED, false).unwrap());

        set(&conn, BASE_FACTOR_COEFFICIENT, "0.07", "decimal", None).unwrap();
        set(&conn, APPROVAL_REQUIRED, "true", "bool", None).unwrap();

        assert_eq!(
            decimal_or(&conn, BASE_FACTOR_COEFFICIENT, DEFAULT_FACTOR_COEFFICIENT).unwrap(),
            dec!(0.07)
        );
        assert!(bool_or(&conn, APPROVAL_REQUIRED, false).unwrap());
    }

    #[test]
    fn test_malformed_value_falls_back_to_default() {
        let conn = test_conn();
        set(&conn, BASE_FACTOR_COEFFICIENT, "not-a-number", "decimal", None).unwrap();

        assert_eq!(
            decimal_or(&conn, BASE_FACTOR_COEFFICIENT, DEFAULT_FACTOR_COEFFICIENT).unwrap(),
            DEFAULT_FACTOR_COEFFICIENT
        );
    }
}
