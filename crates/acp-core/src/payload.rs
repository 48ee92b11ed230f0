// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event payload schema validation and normalization.
//!
//! Every event payload is a JSON object carrying a mandatory
//! `schemaVersion`. The core enforces key *existence* per event type;
//! values stay opaque. `replay.event` is the one exception: its payload is
//! opaque JSON checked for well-formedness only.

use crate::{PROTOCOL_VERSION, events};
use serde_json::Value;

/// Payload validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The payload is not a JSON object.
    #[error("payload for '{event_type}' must be a JSON object")]
    NotAnObject {
        /// Event type being validated.
        event_type: String,
    },

    /// `schemaVersion` is present but does not match the pinned version.
    #[error("schemaVersion mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// The pinned protocol version.
        expected: String,
        /// The version carried by the payload.
        found: String,
    },

    /// A required key for the event type is missing.
    #[error("payload for '{event_type}' is missing required key '{key}'")]
    MissingKey {
        /// Event type being validated.
        event_type: String,
        /// The absent key.
        key: String,
    },

    /// An enumerated field carries a value outside its allowed set.
    #[error("payload for '{event_type}' has invalid {field}: '{value}'")]
    InvalidEnumValue {
        /// Event type being validated.
        event_type: String,
        /// The offending field.
        field: String,
        /// The rejected value.
        value: String,
    },
}

/// Required keys per event type. Types not listed here only need to be
/// objects with a valid `schemaVersion`.
fn required_keys(event_type: &str) -> &'static [&'static str] {
    match event_type {
        events::SPAWN_EVENT => &["spawnId", "sessionId", "goal", "depth", "status"],
        events::GUARDRAIL_STOP => &["reason", "triggeredBy", "runId"],
        events::SESSION_STARTED => &["sessionId", "tenantId", "status", "startedAt", "members"],
        events::CAPSULE_SYNC => &["capsuleId", "session", "spawn", "syncState", "updatedAt"],
        events::POLICY_GATE_REQUESTED => &["gate_id", "reason"],
        events::POLICY_GATE_RESOLVED => &["gate_id", "decision"],
        events::POLICY_GATE_STORED => &["id", "tool", "reason"],
        _ => &[],
    }
}

/// Allowed decisions for `policy.gate.resolved`.
const GATE_DECISIONS: &[&str] = &["approve_once", "approve_run", "deny"];

/// Validate and normalize an event payload in place.
///
/// - `replay.event` payloads pass untouched (any well-formed JSON).
/// - All other payloads must be objects; a missing `schemaVersion` is
///   injected with [`PROTOCOL_VERSION`], a mismatched one is rejected.
/// - The per-type required-key set is enforced.
///
/// # Errors
///
/// Returns [`PayloadError`] describing the first violation found.
pub fn normalize(event_type: &str, payload: &mut Value) -> Result<(), PayloadError> {
    if event_type == events::REPLAY_EVENT {
        // Opaque: the store keeps whatever valid JSON the replayer wrote.
        return Ok(());
    }

    let Some(map) = payload.as_object_mut() else {
        return Err(PayloadError::NotAnObject {
            event_type: event_type.into(),
        });
    };

    match map.get("schemaVersion") {
        None => {
            map.insert(
                "schemaVersion".into(),
                Value::String(PROTOCOL_VERSION.into()),
            );
        }
        Some(Value::String(v)) if v == PROTOCOL_VERSION => {}
        Some(other) => {
            return Err(PayloadError::SchemaVersionMismatch {
                expected: PROTOCOL_VERSION.into(),
                found: other.as_str().map_or_else(|| other.to_string(), Into::into),
            });
        }
    }

    for key in required_keys(event_type) {
        if !map.contains_key(*key) {
            return Err(PayloadError::MissingKey {
                event_type: event_type.into(),
                key: (*key).into(),
            });
        }
    }

    if event_type == events::POLICY_GATE_RESOLVED {
        let decision = map.get("decision").and_then(Value::as_str).unwrap_or("");
        if !GATE_DECISIONS.contains(&decision) {
            return Err(PayloadError::InvalidEnumValue {
                event_type: event_type.into(),
                field: "decision".into(),
                value: decision.into(),
            });
        }
    }

    Ok(())
}
