// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for the embedded store: tenancy scoping, append-only
//! event ids, and the lease state machine.

use acp_core::{Job, JobStatus, NodeDescriptor, Run, RunStatus, Session};
use acp_store::{Store, StoreError};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::time::Duration;

fn sample_run(run_id: &str, tenant: &str) -> Run {
    Run {
        run_id: run_id.into(),
        tenant_id: tenant.into(),
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

fn sample_job(job_id: &str, tenant: &str, key: &str, priority: i64) -> Job {
    Job {
        job_id: job_id.into(),
        tenant_id: tenant.into(),
        run_id: "run-1".into(),
        session_id: None,
        node_id: None,
        job_type: "tool_call".into(),
        payload: json!({"tool": "echo"}),
        idempotency_key: key.into(),
        priority,
        attempts: 0,
        max_attempts: 5,
        status: JobStatus::Queued,
        next_run_at: Utc::now(),
        lease_token: None,
        leased_until: None,
        last_error: None,
        created_at: Utc::now(),
    }
}

// ── runs ────────────────────────────────────────────────────────────

#[test]
fn run_lookup_is_tenant_scoped() {
    let store = Store::open_in_memory().unwrap();
    store.insert_run(&sample_run("run-1", "t1")).unwrap();

    assert!(store.get_run("t1", "run-1").is_ok());
    let err = store.get_run("t2", "run-1").unwrap_err();
    assert!(matches!(err, StoreError::RunNotFound { .. }));
}

#[test]
fn finalize_run_is_exactly_once() {
    let store = Store::open_in_memory().unwrap();
    store.insert_run(&sample_run("run-1", "t1")).unwrap();

    store.finalize_run("t1", "run-1", "abc123").unwrap();
    let run = store.get_run("t1", "run-1").unwrap();
    assert_eq!(run.status, RunStatus::Finalized);
    assert_eq!(run.fingerprint.as_deref(), Some("abc123"));

    let err = store.finalize_run("t1", "run-1", "def456").unwrap_err();
    assert!(matches!(err, StoreError::AlreadyFinalized { .. }));
    // Fingerprint unchanged.
    let run = store.get_run("t1", "run-1").unwrap();
    assert_eq!(run.fingerprint.as_deref(), Some("abc123"));
}

#[test]
fn finalize_missing_run_is_not_found() {
    let store = Store::open_in_memory().unwrap();
    let err = store.finalize_run("t1", "run-x", "abc").unwrap_err();
    assert!(matches!(err, StoreError::RunNotFound { .. }));
}

#[test]
fn hardened_flag_persists() {
    let store = Store::open_in_memory().unwrap();
    store.insert_run(&sample_run("run-1", "t1")).unwrap();
    store.set_run_hardened("run-1").unwrap();
    assert!(store.get_run("t1", "run-1").unwrap().hardened);
}

// ── events ──────────────────────────────────────────────────────────

#[test]
fn event_ids_are_strictly_increasing() {
    let store = Store::open_in_memory().unwrap();
    let mut last = 0;
    for i in 0..5 {
        let id = store
            .append_event("t1", "run-1", "tool.result", &json!({"i": i}), Utc::now())
            .unwrap();
        assert!(id > last, "id {id} not after {last}");
        last = id;
    }
}

#[test]
fn list_events_after_id_returns_strict_suffix() {
    let store = Store::open_in_memory().unwrap();
    let ids: Vec<i64> = (0..4)
        .map(|i| {
            store
                .append_event("t1", "run-1", "tool.result", &json!({"i": i}), Utc::now())
                .unwrap()
        })
        .collect();

    let tail = store.list_events("t1", "run-1", ids[1]).unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].id, ids[2]);
    assert_eq!(tail[1].id, ids[3]);

    // Other tenants see nothing.
    assert!(store.list_events("t2", "run-1", 0).unwrap().is_empty());
}

#[test]
fn audit_stream_is_separate_from_events() {
    let store = Store::open_in_memory().unwrap();
    store
        .append_audit("t1", "run-1", "budget.denied", &json!({"tool": "x"}))
        .unwrap();
    assert!(store.list_events("t1", "run-1", 0).unwrap().is_empty());
    assert_eq!(store.list_audit("t1", "run-1", 0).unwrap().len(), 1);
}

// ── jobs: idempotency ───────────────────────────────────────────────

#[test]
fn duplicate_idempotency_key_rejected_and_first_untouched() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-1", "t1", "k1", 10)).unwrap();

    let err = store
        .insert_job(&sample_job("job-2", "t1", "k1", 99))
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateJob { .. }));

    let first = store.get_job("job-1").unwrap().unwrap();
    assert_eq!(first.priority, 10);
    assert!(store.get_job("job-2").unwrap().is_none());
}

#[test]
fn same_key_in_different_tenants_is_allowed() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-1", "t1", "k1", 10)).unwrap();
    store.insert_job(&sample_job("job-2", "t2", "k1", 10)).unwrap();
}

// ── jobs: lease machine ─────────────────────────────────────────────

#[test]
fn lease_orders_by_priority_then_id() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-b", "t1", "kb", 50)).unwrap();
    store.insert_job(&sample_job("job-a", "t1", "ka", 10)).unwrap();
    store.insert_job(&sample_job("job-c", "t1", "kc", 50)).unwrap();

    let leased = store
        .lease_ready_jobs(Utc::now(), 10, "token-1", Duration::from_secs(30))
        .unwrap();
    let ids: Vec<&str> = leased.iter().map(|j| j.job_id.as_str()).collect();
    assert_eq!(ids, ["job-a", "job-b", "job-c"]);
    assert!(leased.iter().all(|j| j.status == JobStatus::Leased));
    assert!(leased.iter().all(|j| j.lease_token.as_deref() == Some("token-1")));
}

#[test]
fn leased_jobs_are_invisible_until_expiry() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-1", "t1", "k1", 10)).unwrap();

    let first = store
        .lease_ready_jobs(Utc::now(), 10, "token-1", Duration::from_secs(30))
        .unwrap();
    assert_eq!(first.len(), 1);

    // Active lease blocks a second scan.
    let second = store
        .lease_ready_jobs(Utc::now(), 10, "token-2", Duration::from_secs(30))
        .unwrap();
    assert!(second.is_empty());

    // After expiry the job is eligible again under a fresh token.
    let later = Utc::now() + ChronoDuration::seconds(60);
    let third = store
        .lease_ready_jobs(later, 10, "token-3", Duration::from_secs(30))
        .unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].lease_token.as_deref(), Some("token-3"));
}

#[test]
fn future_next_run_at_is_invisible() {
    let store = Store::open_in_memory().unwrap();
    let mut job = sample_job("job-1", "t1", "k1", 10);
    job.next_run_at = Utc::now() + ChronoDuration::seconds(120);
    store.insert_job(&job).unwrap();

    let leased = store
        .lease_ready_jobs(Utc::now(), 10, "token-1", Duration::from_secs(30))
        .unwrap();
    assert!(leased.is_empty());
}

#[test]
fn complete_requires_matching_token() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-1", "t1", "k1", 10)).unwrap();
    store
        .lease_ready_jobs(Utc::now(), 1, "token-1", Duration::from_secs(30))
        .unwrap();

    // Wrong token: silent no-op.
    assert!(!store.complete_job("job-1", "stale", &json!({"ok": true})).unwrap());
    assert_eq!(
        store.get_job("job-1").unwrap().unwrap().status,
        JobStatus::Leased
    );

    // Right token: completes, records result and attempt.
    assert!(store.complete_job("job-1", "token-1", &json!({"ok": true})).unwrap());
    let job = store.get_job("job-1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.lease_token.is_none());
    assert_eq!(store.job_result("job-1").unwrap().unwrap(), json!({"ok": true}));
    assert_eq!(store.list_attempts("job-1").unwrap().len(), 1);

    // Re-complete with the same token: no-op (token already cleared).
    assert!(!store.complete_job("job-1", "token-1", &json!({"again": true})).unwrap());
}

#[test]
fn fail_schedules_retry_and_records_attempt() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-1", "t1", "k1", 10)).unwrap();
    store
        .lease_ready_jobs(Utc::now(), 1, "token-1", Duration::from_secs(30))
        .unwrap();

    let retry_at = Utc::now() + ChronoDuration::seconds(4);
    assert!(store.fail_job("job-1", "token-1", "tool crashed", retry_at, false).unwrap());

    let job = store.get_job("job-1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::RetryWait);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("tool crashed"));
    assert!(job.lease_token.is_none());

    let attempts = store.list_attempts("job-1").unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, "failed");
    assert_eq!(attempts[0].error.as_deref(), Some("tool crashed"));
}

#[test]
fn fail_with_dead_flag_dead_letters() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-1", "t1", "k1", 10)).unwrap();
    store
        .lease_ready_jobs(Utc::now(), 1, "token-1", Duration::from_secs(30))
        .unwrap();

    assert!(store.fail_job("job-1", "token-1", "fatal", Utc::now(), true).unwrap());
    let job = store.get_job("job-1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
}

#[test]
fn retry_wait_becomes_visible_after_backoff() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-1", "t1", "k1", 10)).unwrap();
    store
        .lease_ready_jobs(Utc::now(), 1, "token-1", Duration::from_secs(30))
        .unwrap();
    let retry_at = Utc::now() + ChronoDuration::seconds(4);
    store.fail_job("job-1", "token-1", "transient", retry_at, false).unwrap();

    // Before the backoff elapses: invisible.
    assert!(store
        .lease_ready_jobs(Utc::now(), 10, "token-2", Duration::from_secs(30))
        .unwrap()
        .is_empty());

    // After: leased again.
    let leased = store
        .lease_ready_jobs(retry_at + ChronoDuration::seconds(1), 10, "token-2", Duration::from_secs(30))
        .unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].attempts, 1);
}

#[test]
fn live_job_count_tracks_terminal_states() {
    let store = Store::open_in_memory().unwrap();
    store.insert_job(&sample_job("job-1", "t1", "k1", 10)).unwrap();
    store.insert_job(&sample_job("job-2", "t1", "k2", 10)).unwrap();
    assert_eq!(store.count_live_jobs().unwrap(), 2);

    store
        .lease_ready_jobs(Utc::now(), 1, "token-1", Duration::from_secs(30))
        .unwrap();
    store.complete_job("job-1", "token-1", &json!({})).unwrap();
    assert_eq!(store.count_live_jobs().unwrap(), 1);
}

// ── nodes / sessions ────────────────────────────────────────────────

#[test]
fn node_upsert_updates_heartbeat() {
    let store = Store::open_in_memory().unwrap();
    let mut node = NodeDescriptor {
        node_id: "node-1".into(),
        capabilities: vec!["tool.echo".into()],
        tags: vec![],
        last_heartbeat: Utc::now(),
        latency_ms: 20,
        load: 0.1,
        spec_version: "acp/v0.1".into(),
        registry_snapshot_hash: "r1".into(),
        trust_score: 0.9,
        quarantined: false,
    };
    store.upsert_node(&node).unwrap();

    node.latency_ms = 45;
    node.quarantined = true;
    store.upsert_node(&node).unwrap();

    let fetched = store.get_node("node-1").unwrap().unwrap();
    assert_eq!(fetched.latency_ms, 45);
    assert!(fetched.quarantined);
    assert_eq!(store.list_nodes().unwrap().len(), 1);
}

#[test]
fn session_roundtrip_is_tenant_scoped() {
    let store = Store::open_in_memory().unwrap();
    let session = Session {
        session_id: "sess-1".into(),
        tenant_id: "t1".into(),
        status: "open".into(),
        started_at: Utc::now(),
        members: vec!["agent-a".into(), "agent-b".into()],
    };
    store.insert_session(&session).unwrap();

    let fetched = store.get_session("t1", "sess-1").unwrap().unwrap();
    assert_eq!(fetched.members, vec!["agent-a", "agent-b"]);
    assert!(store.get_session("t2", "sess-1").unwrap().is_none());
}

// ── durability on disk ──────────────────────────────────────────────

#[test]
fn reopen_preserves_rows_and_skips_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plane.db");

    {
        let store = Store::open(&path, Duration::from_millis(500)).unwrap();
        store.insert_run(&sample_run("run-1", "t1")).unwrap();
    }

    let store = Store::open(&path, Duration::from_millis(500)).unwrap();
    assert!(store.get_run("t1", "run-1").is_ok());
    assert_eq!(store.applied_migrations().unwrap().len(), 3);
}
