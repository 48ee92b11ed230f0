// SPDX-License-Identifier: MIT OR Apache-2.0
//! Entropy boundary enforcement.
//!
//! Fingerprints must be reproducible on any machine at any time, so two
//! classes of values are banned from the digest path: wall-clock readings
//! and floating-point numbers. JSON carries no native time type; the
//! wall-clock manifestation at this layer is a string that parses as a full
//! RFC 3339 timestamp, which is exactly what serializers emit for time
//! values.

use crate::HashError;
use serde_json::Value;

/// Recursively check `value` for entropy-boundary violations.
///
/// `path` is the JSON-pointer-style location of `value`, used to name the
/// offending element in the error (`$` for the root).
///
/// # Errors
///
/// - [`HashError::FloatInDigest`] for any non-integer number.
/// - [`HashError::WallClockInDigest`] for any RFC 3339 timestamp string.
pub fn entropy_check(value: &Value, path: &str) -> Result<(), HashError> {
    match value {
        Value::Null | Value::Bool(_) => Ok(()),
        Value::Number(n) => {
            if n.as_i64().is_some() || n.as_u64().is_some() {
                Ok(())
            } else {
                Err(HashError::FloatInDigest { path: path.into() })
            }
        }
        Value::String(s) => {
            if is_wall_clock(s) {
                Err(HashError::WallClockInDigest { path: path.into() })
            } else {
                Ok(())
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                entropy_check(item, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, child) in map {
                entropy_check(child, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
    }
}

/// A string is a wall-clock reading when it parses as a full RFC 3339
/// timestamp. Bare dates, durations, and ordinary text pass.
fn is_wall_clock(s: &str) -> bool {
    // Cheap pre-filter: RFC 3339 timestamps are at least
    // "YYYY-MM-DDTHH:MM:SSZ" long and start with four digits.
    if s.len() < 20 || !s.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        return false;
    }
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
}
