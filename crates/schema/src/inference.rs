//! Data-type inference for raw JSON values: value classification, the
//! registered detections, and the coercion matrix consulted when a value
//! arrives for an already-typed column.

use crate::types::{DataType, Detection};
use chrono::DateTime;
use lazy_static::lazy_static;
use num_bigint::BigInt;
use serde_json::Value;

/// Accepted epoch window for the numeric `timestamp` detection:
/// 2000-01-01T00:00:00Z to 2100-01-01T00:00:00Z, inclusive.
pub const TIMESTAMP_EPOCH_MIN: f64 = 946_684_800.0;
pub const TIMESTAMP_EPOCH_MAX: f64 = 4_102_444_800.0;

lazy_static! {
    /// Smallest integer magnitude classified as `wei`: 2^64.
    static ref WEI_THRESHOLD: BigInt = BigInt::from(1u8) << 64u32;
}

/// Maps a value to its base data type, ignoring detections and preferences.
/// `Null` carries no type and returns `None`.
pub fn value_data_type(value: &Value) -> Option<DataType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(DataType::Bool),
        Value::Number(n) => Some(number_data_type(&n.to_string())),
        Value::String(_) => Some(DataType::Text),
        Value::Array(_) | Value::Object(_) => Some(DataType::Complex),
    }
}

/// Classifies a JSON number literal. Integers of magnitude `>= 2^64` become
/// `wei`; anything with a fraction or exponent is `double`.
fn number_data_type(literal: &str) -> DataType {
    if literal.contains('.') || literal.contains('e') || literal.contains('E') {
        return DataType::Double;
    }
    match literal.parse::<BigInt>() {
        Ok(v) if v.magnitude() >= WEI_THRESHOLD.magnitude() => DataType::Wei,
        Ok(_) => DataType::Bigint,
        // Unparseable integer literals do not occur in well-formed JSON;
        // treat defensively as text.
        Err(_) => DataType::Text,
    }
}

/// Runs the registered detections in order, returning the first hit.
pub fn detect_type(detections: &[Detection], value: &Value) -> Option<DataType> {
    detections.iter().find_map(|d| match d {
        Detection::Timestamp => detect_epoch_timestamp(value),
        Detection::IsoTimestamp => detect_iso_timestamp(value),
    })
}

/// A numeric value lying within a sane epoch window is a timestamp.
fn detect_epoch_timestamp(value: &Value) -> Option<DataType> {
    let n = value.as_f64()?;
    if (TIMESTAMP_EPOCH_MIN..=TIMESTAMP_EPOCH_MAX).contains(&n) {
        Some(DataType::Timestamp)
    } else {
        None
    }
}

/// A string parsing as RFC-3339 is a timestamp.
fn detect_iso_timestamp(value: &Value) -> Option<DataType> {
    let s = value.as_str()?;
    DateTime::parse_from_rfc3339(s).ok().map(|_| DataType::Timestamp)
}

/// Whether a value observed as `observed` may land in a column declared as
/// `declared`. The matrix only ever widens: a declared type never changes.
pub fn can_coerce(declared: DataType, observed: DataType) -> bool {
    if declared == observed {
        return true;
    }
    matches!(
        (declared, observed),
        (DataType::Wei, DataType::Bigint)
            | (DataType::Double, DataType::Bigint)
            | (DataType::Decimal, DataType::Bigint)
            | (DataType::Decimal, DataType::Double)
            | (DataType::Binary, DataType::Text)
            | (DataType::Timestamp, DataType::Bigint)
            | (DataType::Timestamp, DataType::Double)
    )
}
