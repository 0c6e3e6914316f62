//! Conversions between model fields and SQLite column values.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use serde::Serialize;

use hive_shared::types::from_millis;

pub(crate) fn millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn timestamp(ms: i64) -> DateTime<Utc> {
    from_millis(ms)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> crate::Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text column inside a row mapper.
pub(crate) fn json_column<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse a UUID text column inside a row mapper.
pub(crate) fn uuid_column(idx: usize, text: &str) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse an enum stored as text inside a row mapper.
pub(crate) fn enum_column<T>(idx: usize, text: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unexpected value '{text}'").into(),
        )
    })
}
