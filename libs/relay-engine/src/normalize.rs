//! Payload parsing and `timestamp` normalization.
//!
//! Inbound payloads carry `timestamp` as epoch seconds (integer or
//! fractional). The warehouse row carries it as a naive UTC calendar string,
//! `YYYY-MM-DDTHH:MM:SS` with a `.ffffff` suffix only when the microsecond
//! part is non-zero. Every other field is passed through untouched.

use std::fmt::Write as _;

use chrono::{DateTime, Datelike, Utc};
use serde_json::{Number, Value};

use relay_api::Record;

use crate::error::MalformedMessageError;

pub const TIMESTAMP_FIELD: &str = "timestamp";

const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Decode a payload and normalize its `timestamp` in place.
pub fn parse_record(message_id: &str, payload: &[u8]) -> Result<Record, MalformedMessageError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| MalformedMessageError::InvalidJson(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(MalformedMessageError::NotAnObject);
    };

    let ts = fields
        .get_mut(TIMESTAMP_FIELD)
        .ok_or(MalformedMessageError::MissingTimestamp)?;
    let formatted = match ts {
        Value::Number(n) => format_timestamp(n)?,
        other => return Err(MalformedMessageError::NonNumericTimestamp(json_type(other))),
    };
    *ts = Value::String(formatted);

    Ok(Record::new(message_id, fields))
}

/// Epoch seconds → `YYYY-MM-DDTHH:MM:SS[.ffffff]` (UTC, no offset).
///
/// Fractional seconds are rounded to the nearest microsecond, ties to even.
pub fn format_timestamp(n: &Number) -> Result<String, MalformedMessageError> {
    let out_of_range = || MalformedMessageError::TimestampOutOfRange(n.to_string());

    let (secs, micros) = if let Some(secs) = n.as_i64() {
        (secs, 0)
    } else if let Some(secs) = n.as_u64() {
        (i64::try_from(secs).map_err(|_| out_of_range())?, 0)
    } else {
        let value = n.as_f64().ok_or_else(out_of_range)?;
        split_seconds(value).ok_or_else(out_of_range)?
    };

    format_parts(secs, micros).ok_or_else(out_of_range)
}

/// Split fractional epoch seconds into whole seconds and a microsecond
/// remainder in `0..1_000_000`.
fn split_seconds(value: f64) -> Option<(i64, u32)> {
    if !value.is_finite() {
        return None;
    }
    let whole = value.trunc();
    if whole.abs() >= i64::MAX as f64 {
        return None;
    }
    let mut secs = whole as i64;
    let mut micros = ((value - whole) * MICROS_PER_SEC).round_ties_even() as i64;
    if micros >= 1_000_000 {
        secs = secs.checked_add(1)?;
        micros -= 1_000_000;
    } else if micros < 0 {
        secs = secs.checked_sub(1)?;
        micros += 1_000_000;
    }
    Some((secs, micros as u32))
}

fn format_parts(secs: i64, micros: u32) -> Option<String> {
    let dt: DateTime<Utc> = DateTime::from_timestamp(secs, micros * 1_000)?;
    if !(1..=9999).contains(&dt.year()) {
        return None;
    }
    let mut out = dt.format("%Y-%m-%dT%H:%M:%S").to_string();
    if micros != 0 {
        let _ = write!(out, ".{micros:06}");
    }
    Some(out)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
