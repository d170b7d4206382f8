use chrono::{SecondsFormat, Utc};

use crate::error::StoreError;

/// Current time as fixed-width RFC 3339 (UTC, microseconds), so that text
/// ordering in SQL matches chronological ordering.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Clamp a caller-supplied row limit into `1..=max`.
pub fn clamp_limit(limit: u32, max: u32) -> u32 {
    limit.clamp(1, max)
}
