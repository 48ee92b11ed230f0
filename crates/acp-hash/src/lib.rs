// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical serialization and hashing for deterministic fingerprints.
//!
//! Everything that influences a run fingerprint flows through this crate:
//! the canonical byte form (sorted map keys, preserved array order, minimal
//! integers), the SHA-256 digest over it, and the entropy boundary that
//! rejects wall-clock readings and floating-point numbers before they can
//! poison a digest.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Canonical byte-form emitter.
pub mod canonical;
/// Entropy boundary checks for digest inputs.
pub mod entropy;

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub use canonical::{CanonicalError, canonical_bytes};
pub use entropy::entropy_check;

/// Pinned digest engine version embedded in every fingerprint.
///
/// Bumping this value invalidates all previously recorded fingerprints, so
/// it changes only when the canonical byte form itself changes.
pub const ENGINE_VERSION: &str = "acp-engine/v1";

/// Errors from hashing and entropy enforcement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    /// A floating-point number reached the digest path.
    #[error("entropy violation at {path}: floating-point value")]
    FloatInDigest {
        /// JSON-pointer-style path to the offending value.
        path: String,
    },

    /// A wall-clock reading reached the digest path.
    #[error("entropy violation at {path}: wall-clock timestamp")]
    WallClockInDigest {
        /// JSON-pointer-style path to the offending value.
        path: String,
    },

    /// The canonicalizer cannot normalize the value.
    #[error("cannot canonicalize value at {path}: {detail}")]
    Unhashable {
        /// JSON-pointer-style path to the offending value.
        path: String,
        /// What made the value unhashable.
        detail: String,
    },
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// 32-bit FNV-1a over `bytes`.
///
/// Used for shard selection and deterministic jitter; never for integrity.
#[must_use]
pub fn fnv32a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Authority over everything that enters a fingerprint.
///
/// All digest-affecting values must pass through one of these methods; each
/// runs the entropy check before canonicalizing, so a wall-clock or float
/// can never slip into a fingerprint unnoticed.
///
/// # Examples
///
/// ```
/// use acp_hash::DigestAuthority;
/// use serde_json::json;
///
/// let authority = DigestAuthority::new(acp_hash::ENGINE_VERSION);
/// let a = authority.hash(&json!({"z": 1, "a": 2})).unwrap();
/// let b = authority.hash(&json!({"a": 2, "z": 1})).unwrap();
/// assert_eq!(a, b); // key order never matters
/// ```
#[derive(Debug, Clone)]
pub struct DigestAuthority {
    engine_version: String,
}

impl DigestAuthority {
    /// Create an authority pinned to the given engine version.
    #[must_use]
    pub fn new(engine_version: impl Into<String>) -> Self {
        Self {
            engine_version: engine_version.into(),
        }
    }

    /// The engine version this authority stamps into fingerprints.
    #[must_use]
    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// Hash an arbitrary value after enforcing the entropy boundary.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the value contains a float, a wall-clock
    /// reading, or anything the canonicalizer cannot normalize.
    pub fn hash(&self, value: &Value) -> Result<String, HashError> {
        entropy_check(value, "$")?;
        let bytes = canonical_bytes(value).map_err(CanonicalError::into_hash_error)?;
        Ok(sha256_hex(&bytes))
    }

    /// Hash an ordered event log under its run id.
    ///
    /// The digest input is `{"event_log": events, "run_id": run_id}`; the
    /// canonical form sorts those two keys, so the layout here is purely
    /// documentary.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if any event payload violates the entropy
    /// boundary.
    pub fn event_log_hash(&self, events: &[Value], run_id: &str) -> Result<String, HashError> {
        let doc = serde_json::json!({
            "event_log": events,
            "run_id": run_id,
        });
        self.hash(&doc)
    }

    /// Recompute the event-log hash and compare it to `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the events cannot be hashed at all; a clean
    /// mismatch is reported as `Ok(false)`.
    pub fn verify_replay(
        &self,
        events: &[Value],
        run_id: &str,
        expected: &str,
    ) -> Result<bool, HashError> {
        let actual = self.event_log_hash(events, run_id)?;
        Ok(actual == expected)
    }

    /// Hash a value under a label namespace.
    ///
    /// Two identical payloads hashed under different labels produce
    /// different digests, which keeps unrelated subsystems from colliding
    /// in golden-path registries.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the value violates the entropy boundary.
    pub fn context_hash(&self, labels: &[&str], value: &Value) -> Result<String, HashError> {
        let doc = serde_json::json!({
            "_data": value,
            "_labels": labels,
        });
        self.hash(&doc)
    }

    /// Compute the run fingerprint from an already-computed event-log hash.
    ///
    /// Fingerprint = `hash({engine_version, event_log_hash, run_id})`.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the inputs cannot be canonicalized (they are
    /// plain strings, so this is effectively infallible).
    pub fn fingerprint(&self, run_id: &str, event_log_hash: &str) -> Result<String, HashError> {
        let doc = serde_json::json!({
            "engine_version": self.engine_version,
            "event_log_hash": event_log_hash,
            "run_id": run_id,
        });
        self.hash(&doc)
    }
}

static GLOBAL_AUTHORITY: OnceLock<DigestAuthority> = OnceLock::new();

/// Initialize the process-wide [`DigestAuthority`] exactly once.
///
/// # Panics
///
/// Panics on double initialization. Fingerprints from two differently-pinned
/// authorities in one process would be incomparable, so this is fatal.
pub fn init_global(engine_version: &str) {
    let authority = DigestAuthority::new(engine_version);
    if GLOBAL_AUTHORITY.set(authority).is_err() {
        panic!("digest authority initialized twice");
    }
}

/// Access the process-wide [`DigestAuthority`].
///
/// # Panics
///
/// Panics if [`init_global`] has not been called. Hashing before the engine
/// version is pinned would produce unverifiable fingerprints, so this is
/// fatal.
#[must_use]
pub fn global() -> &'static DigestAuthority {
    GLOBAL_AUTHORITY
        .get()
        .unwrap_or_else(|| panic!("digest authority accessed before initialization"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authority() -> DigestAuthority {
        DigestAuthority::new(ENGINE_VERSION)
    }

    #[test]
    fn map_key_order_is_irrelevant() {
        let a = authority().hash(&json!({"z": 1, "a": 2, "m": 3})).unwrap();
        let b = authority().hash(&json!({"a": 2, "m": 3, "z": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn array_order_is_significant() {
        let a = authority().hash(&json!([1, 2, 3])).unwrap();
        let b = authority().hash(&json!([3, 2, 1])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        let h = authority().hash(&json!({"k": "v"})).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn floats_are_rejected() {
        let err = authority().hash(&json!({"cost": 1.5})).unwrap_err();
        assert!(matches!(err, HashError::FloatInDigest { ref path } if path == "$.cost"));
    }

    #[test]
    fn rfc3339_strings_are_rejected_as_wall_clock() {
        let err = authority()
            .hash(&json!({"at": "2026-08-01T12:00:00Z"}))
            .unwrap_err();
        assert!(matches!(err, HashError::WallClockInDigest { ref path } if path == "$.at"));
    }

    #[test]
    fn event_log_hash_round_trips() {
        let events = vec![
            json!({"payload": {"schemaVersion": "1", "x": 1}, "type": "tool.result"}),
            json!({"payload": {"schemaVersion": "1", "y": 2}, "type": "tool.result"}),
        ];
        let h = authority().event_log_hash(&events, "run-1").unwrap();
        assert!(authority().verify_replay(&events, "run-1", &h).unwrap());
    }

    #[test]
    fn replay_fails_on_single_byte_change() {
        let events = vec![json!({"payload": {"v": "abc"}, "type": "tool.result"})];
        let h = authority().event_log_hash(&events, "run-1").unwrap();

        let tampered = vec![json!({"payload": {"v": "abd"}, "type": "tool.result"})];
        assert!(!authority().verify_replay(&tampered, "run-1", &h).unwrap());
    }

    #[test]
    fn replay_fails_on_different_run_id() {
        let events = vec![json!({"payload": {"v": 1}, "type": "tool.result"})];
        let h = authority().event_log_hash(&events, "run-1").unwrap();
        assert!(!authority().verify_replay(&events, "run-2", &h).unwrap());
    }

    #[test]
    fn context_hash_separates_namespaces() {
        let v = json!({"k": "v"});
        let a = authority().context_hash(&["drift"], &v).unwrap();
        let b = authority().context_hash(&["policy"], &v).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fnv32a_matches_reference_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv32a(b""), 0x811c_9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c_292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn fingerprint_depends_on_engine_version() {
        let v1 = DigestAuthority::new("acp-engine/v1");
        let v2 = DigestAuthority::new("acp-engine/v2");
        let a = v1.fingerprint("run-1", "deadbeef").unwrap();
        let b = v2.fingerprint("run-1", "deadbeef").unwrap();
        assert_ne!(a, b);
    }
}
