// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the agent control plane.
//!
//! If you only take one dependency, take this one.

/// Run and job identifier assignment.
pub mod ids;
/// Event payload schema validation and normalization.
pub mod payload;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pinned protocol version embedded in every event payload as
/// `schemaVersion`.
///
/// # Examples
///
/// ```
/// assert_eq!(acp_core::PROTOCOL_VERSION, "acp/v0.1");
/// ```
pub const PROTOCOL_VERSION: &str = "acp/v0.1";

/// Well-known event type tags.
pub mod events {
    /// A sub-agent was spawned.
    pub const SPAWN_EVENT: &str = "spawn.event";
    /// A guardrail halted execution.
    pub const GUARDRAIL_STOP: &str = "guardrail.stop";
    /// A session began.
    pub const SESSION_STARTED: &str = "session.started";
    /// A capsule synchronized state.
    pub const CAPSULE_SYNC: &str = "capsule.sync";
    /// A policy gate asked for a decision.
    pub const POLICY_GATE_REQUESTED: &str = "policy.gate.requested";
    /// A policy gate was decided.
    pub const POLICY_GATE_RESOLVED: &str = "policy.gate.resolved";
    /// A policy gate decision was persisted.
    pub const POLICY_GATE_STORED: &str = "policy.gate.stored";
    /// Replay-internal event; payload is opaque to the core.
    pub const REPLAY_EVENT: &str = "replay.event";
    /// A tool call returned a result.
    pub const TOOL_RESULT: &str = "tool.result";
    /// A tool call failed.
    pub const TOOL_ERROR: &str = "tool.error";
    /// Audit: a budget reservation was denied.
    pub const BUDGET_DENIED: &str = "budget.denied";
    /// Audit: a run drifted from its golden path.
    pub const DRIFT_ALERT: &str = "drift.alert";
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet executing.
    Created,
    /// Actively executing tool calls.
    Running,
    /// Finished; fingerprint recorded.
    Finalized,
    /// Terminated with an error.
    Failed,
}

impl RunStatus {
    /// Stable string form used in the persistent store.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "finalized" => Some(Self::Finalized),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One agent execution, owned by exactly one tenant.
///
/// All events, audit entries, and budget records of a run carry the run's
/// tenant; cross-tenant access is refused at the store layer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    /// Opaque run identifier, unique within the control plane.
    pub run_id: String,

    /// Owning tenant.
    pub tenant_id: String,

    /// Ordered capability tokens granted to this run.
    pub capabilities: Vec<String>,

    /// Lifecycle status.
    pub status: RunStatus,

    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Content id of the pack this run executes, if any.
    pub pack_cid: Option<String>,

    /// Replay fingerprint; set exactly once on finalization.
    pub fingerprint: Option<String>,

    /// Hard spend cap in USD.
    pub budget_usd: f64,

    /// Critical runs are routed only to high-accuracy nodes.
    pub critical: bool,

    /// Deterministic runs stamp epoch 0 into event payloads and are
    /// drift-checked; the flag is fixed at creation.
    pub deterministic: bool,

    /// Set when drift above the alert threshold was detected; hardened runs
    /// are pinned to the strict deterministic strategy.
    pub hardened: bool,
}

impl Run {
    /// `true` once the run can no longer accept events.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Finalized | RunStatus::Failed)
    }

    /// `true` if the run declares the given capability token.
    #[must_use]
    pub fn has_capability(&self, token: &str) -> bool {
        self.capabilities.iter().any(|c| c == token)
    }
}

// ---------------------------------------------------------------------------
// Event / audit
// ---------------------------------------------------------------------------

/// One record in a run's append-only event log.
///
/// Once appended an event is never mutated or reordered; `id` is strictly
/// increasing within the run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    /// Store-assigned id, strictly increasing per run.
    pub id: i64,
    /// The run this event belongs to.
    pub run_id: String,
    /// Event type tag (see [`events`]).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Normalized JSON payload (see [`payload`]).
    pub payload: serde_json::Value,
    /// Append timestamp (UTC). Row metadata only; never part of a digest.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// The canonical event-log entry for this event: type and payload only.
    ///
    /// Store-assigned ids and append timestamps are row metadata; including
    /// them would push wall-clock readings into the digest path.
    #[must_use]
    pub fn log_entry(&self) -> serde_json::Value {
        serde_json::json!({
            "payload": self.payload,
            "type": self.event_type,
        })
    }
}

/// A governance/admin observability record; separate stream from [`Event`],
/// same append-only invariant.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditEntry {
    /// Store-assigned id, strictly increasing per run.
    pub id: i64,
    /// The run this entry belongs to.
    pub run_id: String,
    /// Entry type tag (e.g. `budget.denied`, `drift.alert`).
    #[serde(rename = "type")]
    pub entry_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Append timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Job`] in the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be leased.
    Queued,
    /// Held by a worker under a lease token.
    Leased,
    /// Failed; waiting for its backoff to elapse.
    RetryWait,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts or failed fatally.
    DeadLetter,
}

impl JobStatus {
    /// Stable string form used in the persistent store.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::RetryWait => "retry_wait",
            Self::Completed => "completed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "leased" => Some(Self::Leased),
            "retry_wait" => Some(Self::RetryWait),
            "completed" => Some(Self::Completed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// `true` once the job can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job identifier.
    pub job_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// The run this job executes for.
    pub run_id: String,
    /// Optional session the job belongs to (scheduler cap scope).
    pub session_id: Option<String>,
    /// Optional node the job is pinned to (scheduler cap scope).
    pub node_id: Option<String>,
    /// Job type tag (e.g. `"tool_call"`).
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque JSON payload handed to the worker.
    pub payload: serde_json::Value,
    /// Deduplication key; `(tenant_id, idempotency_key)` is unique.
    pub idempotency_key: String,
    /// Dispatch priority; lower runs earlier. Default 100.
    pub priority: i64,
    /// Completed attempts so far.
    pub attempts: u32,
    /// Attempts after which the job dead-letters. Default 5.
    pub max_attempts: u32,
    /// Queue state.
    pub status: JobStatus,
    /// Earliest time the job is eligible for a lease.
    pub next_run_at: DateTime<Utc>,
    /// Opaque token of the active lease, if leased.
    pub lease_token: Option<String>,
    /// When the active lease expires.
    pub leased_until: Option<DateTime<Utc>>,
    /// Error message from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Enqueue timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Node / session
// ---------------------------------------------------------------------------

/// A registered worker node, upserted on heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDescriptor {
    /// Stable node identifier.
    pub node_id: String,
    /// Capability tokens the node offers.
    pub capabilities: Vec<String>,
    /// Free-form routing tags.
    pub tags: Vec<String>,
    /// Most recent heartbeat (UTC).
    pub last_heartbeat: DateTime<Utc>,
    /// Most recently reported request latency in milliseconds.
    pub latency_ms: u64,
    /// Reported load factor in [0, 1].
    pub load: f64,
    /// Protocol spec version the node speaks.
    pub spec_version: String,
    /// Hash of the tool registry snapshot the node was built against.
    pub registry_snapshot_hash: String,
    /// Administrative trust score in [0, 1].
    pub trust_score: f64,
    /// Excluded from delegation when set.
    pub quarantined: bool,
}

/// A collaboration session grouping runs and jobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Session {
    /// Unique session identifier.
    pub session_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Free-form status tag.
    pub status: String,
    /// Session start timestamp (UTC).
    pub started_at: DateTime<Utc>,
    /// Participating member identifiers.
    pub members: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run() -> Run {
        Run {
            run_id: "run-1".into(),
            tenant_id: "t1".into(),
            capabilities: vec!["tool.read".into()],
            status: RunStatus::Created,
            created_at: Utc::now(),
            pack_cid: None,
            fingerprint: None,
            budget_usd: 1.0,
            critical: false,
            deterministic: true,
            hardened: false,
        }
    }

    #[test]
    fn run_status_string_roundtrip() {
        for status in [
            RunStatus::Created,
            RunStatus::Running,
            RunStatus::Finalized,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn job_status_string_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Leased,
            JobStatus::RetryWait,
            JobStatus::Completed,
            JobStatus::DeadLetter,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse(""), None);
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Leased.is_terminal());
        assert!(!JobStatus::RetryWait.is_terminal());

        let mut run = sample_run();
        assert!(!run.is_terminal());
        run.status = RunStatus::Finalized;
        assert!(run.is_terminal());
    }

    #[test]
    fn capability_lookup() {
        let run = sample_run();
        assert!(run.has_capability("tool.read"));
        assert!(!run.has_capability("tool.write"));
    }

    #[test]
    fn event_log_entry_excludes_row_metadata() {
        let event = Event {
            id: 17,
            run_id: "run-1".into(),
            event_type: "tool.result".into(),
            payload: json!({"schemaVersion": PROTOCOL_VERSION, "tool": "echo"}),
            created_at: Utc::now(),
        };
        let entry = event.log_entry();
        assert_eq!(entry["type"], "tool.result");
        assert!(entry.get("id").is_none());
        assert!(entry.get("created_at").is_none());
    }

    #[test]
    fn run_serde_roundtrip() {
        let run = sample_run();
        let json = serde_json::to_string(&run).unwrap();
        let back: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, run.run_id);
        assert_eq!(back.status, run.status);
    }

    #[test]
    fn job_serializes_type_field_name() {
        let job = Job {
            job_id: "job-1".into(),
            tenant_id: "t1".into(),
            run_id: "run-1".into(),
            session_id: None,
            node_id: None,
            job_type: "tool_call".into(),
            payload: json!({}),
            idempotency_key: "k1".into(),
            priority: 100,
            attempts: 0,
            max_attempts: 5,
            status: JobStatus::Queued,
            next_run_at: Utc::now(),
            lease_token: None,
            leased_until: None,
            last_error: None,
            created_at: Utc::now(),
        };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["type"], "tool_call");
    }
}
