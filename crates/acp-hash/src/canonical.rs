// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical byte-form emitter.
//!
//! Maps the closed value domain — object, array, string, integer, boolean,
//! null — to a single canonical byte string:
//!
//! - object keys sorted lexicographically as byte strings, emitted `{"k":v,...}`
//! - array order preserved exactly
//! - strings JSON-escaped
//! - integers in minimal decimal form
//! - `true` / `false` / `null` as literal tokens
//!
//! Floats are not part of the domain and fail canonicalization outright.

use crate::HashError;
use serde_json::Value;

/// Errors from the canonical emitter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalError {
    /// A number that is not representable as an integer.
    #[error("non-integer number at {path}")]
    NonIntegerNumber {
        /// Path to the offending value.
        path: String,
    },
}

impl CanonicalError {
    /// Lift into the crate-wide [`HashError`].
    #[must_use]
    pub fn into_hash_error(self) -> HashError {
        match self {
            Self::NonIntegerNumber { path } => HashError::FloatInDigest { path },
        }
    }
}

/// Produce the canonical byte form of `value`.
///
/// # Errors
///
/// Returns [`CanonicalError::NonIntegerNumber`] when the value contains a
/// number that is neither `i64` nor `u64` representable.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut out = Vec::with_capacity(128);
    write_value(value, "$", &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, path: &str, out: &mut Vec<u8>) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.extend_from_slice(i.to_string().as_bytes());
            } else if let Some(u) = n.as_u64() {
                out.extend_from_slice(u.to_string().as_bytes());
            } else {
                return Err(CanonicalError::NonIntegerNumber { path: path.into() });
            }
        }
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, &format!("{path}[{i}]"), out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Keys sorted as byte strings; Rust's String ordering is
            // byte-wise, so a plain sort suffices.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_escaped(key, out);
                out.push(b':');
                let child = &map[key.as_str()];
                write_value(child, &format!("{path}.{key}"), out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

/// JSON-escape a string into `out`, including the surrounding quotes.
fn write_escaped(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(v: &Value) -> String {
        String::from_utf8(canonical_bytes(v).unwrap()).unwrap()
    }

    #[test]
    fn scalars() {
        assert_eq!(canon(&json!(null)), "null");
        assert_eq!(canon(&json!(true)), "true");
        assert_eq!(canon(&json!(false)), "false");
        assert_eq!(canon(&json!(42)), "42");
        assert_eq!(canon(&json!(-7)), "-7");
        assert_eq!(canon(&json!(0)), "0");
        assert_eq!(canon(&json!("hi")), r#""hi""#);
    }

    #[test]
    fn u64_beyond_i64_range() {
        assert_eq!(canon(&json!(u64::MAX)), u64::MAX.to_string());
    }

    #[test]
    fn object_keys_sorted() {
        assert_eq!(
            canon(&json!({"z": 1, "a": 2, "m": 3})),
            r#"{"a":2,"m":3,"z":1}"#
        );
    }

    #[test]
    fn array_order_preserved() {
        assert_eq!(canon(&json!([3, 1, 2])), "[3,1,2]");
    }

    #[test]
    fn nested_structures() {
        assert_eq!(
            canon(&json!({"b": [{"y": 1, "x": 2}], "a": null})),
            r#"{"a":null,"b":[{"x":2,"y":1}]}"#
        );
    }

    #[test]
    fn string_escaping() {
        assert_eq!(canon(&json!("a\"b")), r#""a\"b""#);
        assert_eq!(canon(&json!("a\\b")), r#""a\\b""#);
        assert_eq!(canon(&json!("a\nb")), r#""a\nb""#);
        assert_eq!(canon(&json!("a\u{1}b")), "\"a\\u0001b\"");
    }

    #[test]
    fn unicode_passes_through() {
        assert_eq!(canon(&json!("héllo")), "\"héllo\"");
    }

    #[test]
    fn float_fails_with_path() {
        let err = canonical_bytes(&json!({"outer": {"inner": 1.25}})).unwrap_err();
        assert_eq!(
            err,
            CanonicalError::NonIntegerNumber {
                path: "$.outer.inner".into()
            }
        );
    }

    #[test]
    fn float_in_array_fails_with_index_path() {
        let err = canonical_bytes(&json!([1, 2.5])).unwrap_err();
        assert_eq!(
            err,
            CanonicalError::NonIntegerNumber {
                path: "$[1]".into()
            }
        );
    }

    #[test]
    fn empty_containers() {
        assert_eq!(canon(&json!({})), "{}");
        assert_eq!(canon(&json!([])), "[]");
    }
}
