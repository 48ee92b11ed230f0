// SPDX-License-Identifier: MIT OR Apache-2.0
//! Embedded SQLite persistence for the control plane.
//!
//! One WAL-journaled database holds the append-only tables: runs, events,
//! audit entries, jobs (with attempt and result history), nodes, and
//! sessions. Schema comes from embedded migrations applied in ascending
//! filename order; each is recorded in `schema_migrations` and skipped
//! thereafter.
//!
//! Concurrency contract: the connection sits behind a mutex, every write
//! path runs in a transaction, and the queue lease scan is a single atomic
//! section so parallel workers never double-lease.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_core::{Event, Job, JobStatus, NodeDescriptor, Run, RunStatus, Session};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Embedded migrations, applied in ascending filename order.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_runs_events_audit.sql",
        include_str!("../migrations/0001_runs_events_audit.sql"),
    ),
    ("0002_jobs.sql", include_str!("../migrations/0002_jobs.sql")),
    (
        "0003_nodes_sessions.sql",
        include_str!("../migrations/0003_nodes_sessions.sql"),
    ),
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The addressed run does not exist in the caller's tenant.
    #[error("run not found: {run_id} (tenant {tenant_id})")]
    RunNotFound {
        /// Tenant that was searched.
        tenant_id: String,
        /// Run that was requested.
        run_id: String,
    },

    /// A job with the same `(tenant, idempotency_key)` already exists.
    #[error("duplicate job: idempotency key '{idempotency_key}' (tenant {tenant_id})")]
    DuplicateJob {
        /// Owning tenant.
        tenant_id: String,
        /// Conflicting key.
        idempotency_key: String,
    },

    /// The run was already finalized; fingerprints are set exactly once.
    #[error("run already finalized: {run_id}")]
    AlreadyFinalized {
        /// The run in question.
        run_id: String,
    },

    /// A stored row failed to decode.
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow {
        /// Table the row came from.
        table: String,
        /// What failed to decode.
        detail: String,
    },

    /// Underlying SQLite failure.
    #[error("sqlite error")]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// Row types without a contract-level home
// ---------------------------------------------------------------------------

/// One attempt record for a job.
#[derive(Debug, Clone)]
pub struct JobAttempt {
    /// Store-assigned row id.
    pub id: i64,
    /// The job attempted.
    pub job_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// `"completed"` or `"failed"`.
    pub outcome: String,
    /// Error message for failed attempts.
    pub error: Option<String>,
    /// Record timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Fixed-width UTC text form; lexicographic order equals chronological order.
fn ts_to_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_str(s: &str, table: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: table.into(),
            detail: format!("bad timestamp '{s}': {e}"),
        })
}

fn json_to_str(v: &serde_json::Value) -> String {
    v.to_string()
}

fn json_from_str(s: &str, table: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::CorruptRow {
        table: table.into(),
        detail: format!("bad json: {e}"),
    })
}

fn string_vec_to_str(v: &[String]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".into())
}

fn string_vec_from_str(s: &str, table: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::CorruptRow {
        table: table.into(),
        detail: format!("bad string list: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the embedded database.
///
/// Cheap to share behind an `Arc`; all access serializes on the inner
/// connection mutex, which is the intended single-node concurrency model.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the database cannot be opened or a
    /// migration fails.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (tests and ephemeral deployments).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if a migration fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the connection is unusable.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    /// Apply pending migrations in ascending filename order.
    fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name       TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        for (name, sql) in MIGRATIONS {
            let applied: Option<String> = conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            if applied.is_some() {
                debug!(migration = name, "migration already applied, skipping");
                continue;
            }

            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
                params![name, ts_to_str(Utc::now())],
            )?;
            tx.commit()?;
            info!(migration = name, "applied migration");
        }
        Ok(())
    }

    /// Names of applied migrations, in application order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn applied_migrations(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // -- runs ------------------------------------------------------------

    /// Persist a new run row. Returns the assigned row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on conflict or I/O failure.
    pub fn insert_run(&self, run: &Run) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO runs (run_id, tenant_id, capabilities, status, created_at,
                               pack_cid, fingerprint, budget_usd, critical,
                               deterministic, hardened)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.run_id,
                run.tenant_id,
                string_vec_to_str(&run.capabilities),
                run.status.as_str(),
                ts_to_str(run.created_at),
                run.pack_cid,
                run.fingerprint,
                run.budget_usd,
                run.critical,
                run.deterministic,
                run.hardened,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Tenant-scoped run lookup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RunNotFound`] when the run does not exist in
    /// that tenant (including when it exists in another tenant).
    pub fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<Run, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT run_id, tenant_id, capabilities, status, created_at, pack_cid,
                    fingerprint, budget_usd, critical, deterministic, hardened
             FROM runs WHERE run_id = ?1 AND tenant_id = ?2",
            params![run_id, tenant_id],
            row_to_run,
        )
        .optional()?
        .transpose()?
        .ok_or_else(|| StoreError::RunNotFound {
            tenant_id: tenant_id.into(),
            run_id: run_id.into(),
        })
    }

    /// Update a run's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure; updating a missing run is
    /// a no-op.
    pub fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE runs SET status = ?2 WHERE run_id = ?1",
            params![run_id, status.as_str()],
        )?;
        Ok(())
    }

    /// Set status `finalized` and record the fingerprint, exactly once.
    ///
    /// # Errors
    ///
    /// - [`StoreError::RunNotFound`] if the run does not exist in the tenant.
    /// - [`StoreError::AlreadyFinalized`] if a fingerprint was already set.
    pub fn finalize_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE runs SET status = 'finalized', fingerprint = ?3
             WHERE run_id = ?1 AND tenant_id = ?2 AND fingerprint IS NULL",
            params![run_id, tenant_id, fingerprint],
        )?;
        if changed == 1 {
            return Ok(());
        }
        // Distinguish "missing" from "finalized twice".
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM runs WHERE run_id = ?1 AND tenant_id = ?2",
                params![run_id, tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(StoreError::AlreadyFinalized {
                run_id: run_id.into(),
            }),
            None => Err(StoreError::RunNotFound {
                tenant_id: tenant_id.into(),
                run_id: run_id.into(),
            }),
        }
    }

    /// Mark a run hardened after significant drift.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn set_run_hardened(&self, run_id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE runs SET hardened = 1 WHERE run_id = ?1",
            params![run_id],
        )?;
        Ok(())
    }

    // -- events / audit --------------------------------------------------

    /// Append one event; returns its monotonically increasing row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn append_event(
        &self,
        tenant_id: &str,
        run_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (run_id, tenant_id, type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                tenant_id,
                event_type,
                json_to_str(payload),
                ts_to_str(created_at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events of a run strictly after `after_id`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn list_events(
        &self,
        tenant_id: &str,
        run_id: &str,
        after_id: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, type, payload, created_at FROM events
             WHERE tenant_id = ?1 AND run_id = ?2 AND id > ?3
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![tenant_id, run_id, after_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (id, run_id, event_type, payload, created_at) = row?;
            events.push(Event {
                id,
                run_id,
                event_type,
                payload: json_from_str(&payload, "events")?,
                created_at: ts_from_str(&created_at, "events")?,
            });
        }
        Ok(events)
    }

    /// Append one audit entry; returns its row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn append_audit(
        &self,
        tenant_id: &str,
        run_id: &str,
        entry_type: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit (run_id, tenant_id, type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                tenant_id,
                entry_type,
                json_to_str(payload),
                ts_to_str(Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Audit entries of a run strictly after `after_id`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn list_audit(
        &self,
        tenant_id: &str,
        run_id: &str,
        after_id: i64,
    ) -> Result<Vec<acp_core::AuditEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, type, payload, created_at FROM audit
             WHERE tenant_id = ?1 AND run_id = ?2 AND id > ?3
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![tenant_id, run_id, after_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, run_id, entry_type, payload, created_at) = row?;
            entries.push(acp_core::AuditEntry {
                id,
                run_id,
                entry_type,
                payload: json_from_str(&payload, "audit")?,
                created_at: ts_from_str(&created_at, "audit")?,
            });
        }
        Ok(entries)
    }

    // -- jobs ------------------------------------------------------------

    /// Persist a new job row.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DuplicateJob`] when `(tenant, idempotency_key)`
    ///   already exists.
    /// - [`StoreError::Sqlite`] on other failures.
    pub fn insert_job(&self, job: &Job) -> Result<i64, StoreError> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO jobs (job_id, tenant_id, run_id, session_id, node_id, type,
                               payload, idempotency_key, priority, attempts,
                               max_attempts, status, next_run_at, lease_token,
                               leased_until, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                job.job_id,
                job.tenant_id,
                job.run_id,
                job.session_id,
                job.node_id,
                job.job_type,
                json_to_str(&job.payload),
                job.idempotency_key,
                job.priority,
                job.attempts,
                job.max_attempts,
                job.status.as_str(),
                ts_to_str(job.next_run_at),
                job.lease_token,
                job.leased_until.map(ts_to_str),
                job.last_error,
                ts_to_str(job.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateJob {
                tenant_id: job.tenant_id.clone(),
                idempotency_key: job.idempotency_key.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a job by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            &format!("{JOB_SELECT} WHERE job_id = ?1"),
            params![job_id],
            row_to_job,
        )
        .optional()?
        .transpose()
    }

    /// Number of live (not yet terminal) jobs; mirrors the queue depth.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn count_live_jobs(&self) -> Result<usize, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'leased', 'retry_wait')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Atomically select visible jobs, mark them leased, and return them.
    ///
    /// Visible: status queued/retry_wait with `next_run_at ≤ now`, or an
    /// expired lease. Selection order is (priority, tenant, session,
    /// created_at, id) ascending; the whole scan-and-mark is one
    /// transaction, so concurrent workers can never lease the same job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn lease_ready_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease_token: &str,
        lease_duration: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now_str = ts_to_str(now);
        let leased_until = ts_to_str(now + chrono::Duration::from_std(lease_duration).unwrap_or_default());

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT job_id FROM jobs
                 WHERE next_run_at <= ?1
                   AND (
                         status IN ('queued', 'retry_wait')
                      OR (status = 'leased' AND leased_until < ?1)
                   )
                 ORDER BY priority, tenant_id, session_id, created_at, id
                 LIMIT ?2",
            )?;
            stmt.query_map(params![now_str, limit as i64], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };

        let mut leased = Vec::with_capacity(ids.len());
        for job_id in &ids {
            tx.execute(
                "UPDATE jobs SET status = 'leased', lease_token = ?2, leased_until = ?3
                 WHERE job_id = ?1",
                params![job_id, lease_token, leased_until],
            )?;
            let job = tx.query_row(
                &format!("{JOB_SELECT} WHERE job_id = ?1"),
                params![job_id],
                row_to_job,
            )??;
            leased.push(job);
        }
        tx.commit()?;
        Ok(leased)
    }

    /// Complete a leased job. Succeeds only when `lease_token` matches the
    /// stored token; otherwise a silent no-op (`Ok(false)`) so a recovered
    /// worker cannot corrupt a job reclaimed by another.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn complete_job(
        &self,
        job_id: &str,
        lease_token: &str,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET status = 'completed', lease_token = NULL, leased_until = NULL
             WHERE job_id = ?1 AND lease_token = ?2 AND status = 'leased'",
            params![job_id, lease_token],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        let attempt: u32 = tx.query_row(
            "SELECT attempts FROM jobs WHERE job_id = ?1",
            params![job_id],
            |row| row.get::<_, u32>(0),
        )? + 1;
        let now = ts_to_str(Utc::now());
        tx.execute(
            "INSERT INTO job_results (job_id, result, created_at) VALUES (?1, ?2, ?3)",
            params![job_id, json_to_str(result), now],
        )?;
        tx.execute(
            "INSERT INTO job_attempts (job_id, attempt, outcome, error, created_at)
             VALUES (?1, ?2, 'completed', NULL, ?3)",
            params![job_id, attempt, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Fail a leased job: increment attempts, record the error, and either
    /// schedule a retry at `next_run_at` or dead-letter it. Lease-guarded
    /// like [`complete_job`]; a stale token is a silent no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn fail_job(
        &self,
        job_id: &str,
        lease_token: &str,
        error: &str,
        next_run_at: DateTime<Utc>,
        dead: bool,
    ) -> Result<bool, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let status = if dead { "dead_letter" } else { "retry_wait" };
        let changed = tx.execute(
            "UPDATE jobs SET status = ?3, attempts = attempts + 1, last_error = ?4,
                             next_run_at = ?5, lease_token = NULL, leased_until = NULL
             WHERE job_id = ?1 AND lease_token = ?2 AND status = 'leased'",
            params![job_id, lease_token, status, error, ts_to_str(next_run_at)],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        let attempt: u32 = tx.query_row(
            "SELECT attempts FROM jobs WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO job_attempts (job_id, attempt, outcome, error, created_at)
             VALUES (?1, ?2, 'failed', ?3, ?4)",
            params![job_id, attempt, error, ts_to_str(Utc::now())],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Stored result of a completed job, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn job_result(&self, job_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT result FROM job_results WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| json_from_str(&s, "job_results")).transpose()
    }

    /// Attempt history of a job, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn list_attempts(&self, job_id: &str) -> Result<Vec<JobAttempt>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, attempt, outcome, error, created_at
             FROM job_attempts WHERE job_id = ?1 ORDER BY attempt, id",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut attempts = Vec::new();
        for row in rows {
            let (id, job_id, attempt, outcome, error, created_at) = row?;
            attempts.push(JobAttempt {
                id,
                job_id,
                attempt,
                outcome,
                error,
                created_at: ts_from_str(&created_at, "job_attempts")?,
            });
        }
        Ok(attempts)
    }

    // -- nodes / sessions -------------------------------------------------

    /// Insert or update a node row (heartbeat upsert).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn upsert_node(&self, node: &NodeDescriptor) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO nodes (node_id, capabilities, tags, last_heartbeat, latency_ms,
                                load, spec_version, registry_snapshot_hash, trust_score,
                                quarantined)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (node_id) DO UPDATE SET
                capabilities = excluded.capabilities,
                tags = excluded.tags,
                last_heartbeat = excluded.last_heartbeat,
                latency_ms = excluded.latency_ms,
                load = excluded.load,
                spec_version = excluded.spec_version,
                registry_snapshot_hash = excluded.registry_snapshot_hash,
                trust_score = excluded.trust_score,
                quarantined = excluded.quarantined",
            params![
                node.node_id,
                string_vec_to_str(&node.capabilities),
                string_vec_to_str(&node.tags),
                ts_to_str(node.last_heartbeat),
                node.latency_ms as i64,
                node.load,
                node.spec_version,
                node.registry_snapshot_hash,
                node.trust_score,
                node.quarantined,
            ],
        )?;
        Ok(())
    }

    /// Fetch a node row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn get_node(&self, node_id: &str) -> Result<Option<NodeDescriptor>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT node_id, capabilities, tags, last_heartbeat, latency_ms, load,
                    spec_version, registry_snapshot_hash, trust_score, quarantined
             FROM nodes WHERE node_id = ?1",
            params![node_id],
            row_to_node,
        )
        .optional()?
        .transpose()
    }

    /// All node rows, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn list_nodes(&self) -> Result<Vec<NodeDescriptor>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, capabilities, tags, last_heartbeat, latency_ms, load,
                    spec_version, registry_snapshot_hash, trust_score, quarantined
             FROM nodes ORDER BY node_id",
        )?;
        let rows = stmt.query_map([], row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row??);
        }
        Ok(nodes)
    }

    /// Persist a session row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (session_id, tenant_id, status, started_at, members)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.session_id,
                session.tenant_id,
                session.status,
                ts_to_str(session.started_at),
                string_vec_to_str(&session.members),
            ],
        )?;
        Ok(())
    }

    /// Tenant-scoped session lookup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn get_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT session_id, tenant_id, status, started_at, members
             FROM sessions WHERE session_id = ?1 AND tenant_id = ?2",
            params![session_id, tenant_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?
        .map(|(session_id, tenant_id, status, started_at, members)| {
            Ok(Session {
                session_id,
                tenant_id,
                status,
                started_at: ts_from_str(&started_at, "sessions")?,
                members: string_vec_from_str(&members, "sessions")?,
            })
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const JOB_SELECT: &str = "SELECT job_id, tenant_id, run_id, session_id, node_id, type, payload,
        idempotency_key, priority, attempts, max_attempts, status, next_run_at,
        lease_token, leased_until, last_error, created_at FROM jobs";

type RowResult<T> = Result<Result<T, StoreError>, rusqlite::Error>;

fn row_to_run(row: &rusqlite::Row<'_>) -> RowResult<Run> {
    let capabilities: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok((|| {
        Ok(Run {
            run_id: row.get(0).map_err(StoreError::Sqlite)?,
            tenant_id: row.get(1).map_err(StoreError::Sqlite)?,
            capabilities: string_vec_from_str(&capabilities, "runs")?,
            status: RunStatus::parse(&status).ok_or_else(|| StoreError::CorruptRow {
                table: "runs".into(),
                detail: format!("bad status '{status}'"),
            })?,
            created_at: ts_from_str(&created_at, "runs")?,
            pack_cid: row.get(5).map_err(StoreError::Sqlite)?,
            fingerprint: row.get(6).map_err(StoreError::Sqlite)?,
            budget_usd: row.get(7).map_err(StoreError::Sqlite)?,
            critical: row.get(8).map_err(StoreError::Sqlite)?,
            deterministic: row.get(9).map_err(StoreError::Sqlite)?,
            hardened: row.get(10).map_err(StoreError::Sqlite)?,
        })
    })())
}

fn row_to_job(row: &rusqlite::Row<'_>) -> RowResult<Job> {
    let payload: String = row.get(6)?;
    let status: String = row.get(11)?;
    let next_run_at: String = row.get(12)?;
    let leased_until: Option<String> = row.get(14)?;
    let created_at: String = row.get(16)?;
    Ok((|| {
        Ok(Job {
            job_id: row.get(0).map_err(StoreError::Sqlite)?,
            tenant_id: row.get(1).map_err(StoreError::Sqlite)?,
            run_id: row.get(2).map_err(StoreError::Sqlite)?,
            session_id: row.get(3).map_err(StoreError::Sqlite)?,
            node_id: row.get(4).map_err(StoreError::Sqlite)?,
            job_type: row.get(5).map_err(StoreError::Sqlite)?,
            payload: json_from_str(&payload, "jobs")?,
            idempotency_key: row.get(7).map_err(StoreError::Sqlite)?,
            priority: row.get(8).map_err(StoreError::Sqlite)?,
            attempts: row.get(9).map_err(StoreError::Sqlite)?,
            max_attempts: row.get(10).map_err(StoreError::Sqlite)?,
            status: JobStatus::parse(&status).ok_or_else(|| StoreError::CorruptRow {
                table: "jobs".into(),
                detail: format!("bad status '{status}'"),
            })?,
            next_run_at: ts_from_str(&next_run_at, "jobs")?,
            lease_token: row.get(13).map_err(StoreError::Sqlite)?,
            leased_until: leased_until
                .map(|s| ts_from_str(&s, "jobs"))
                .transpose()?,
            last_error: row.get(15).map_err(StoreError::Sqlite)?,
            created_at: ts_from_str(&created_at, "jobs")?,
        })
    })())
}

fn row_to_node(row: &rusqlite::Row<'_>) -> RowResult<NodeDescriptor> {
    let capabilities: String = row.get(1)?;
    let tags: String = row.get(2)?;
    let last_heartbeat: String = row.get(3)?;
    Ok((|| {
        Ok(NodeDescriptor {
            node_id: row.get(0).map_err(StoreError::Sqlite)?,
            capabilities: string_vec_from_str(&capabilities, "nodes")?,
            tags: string_vec_from_str(&tags, "nodes")?,
            last_heartbeat: ts_from_str(&last_heartbeat, "nodes")?,
            latency_ms: row.get::<_, i64>(4).map_err(StoreError::Sqlite)? as u64,
            load: row.get(5).map_err(StoreError::Sqlite)?,
            spec_version: row.get(6).map_err(StoreError::Sqlite)?,
            registry_snapshot_hash: row.get(7).map_err(StoreError::Sqlite)?,
            trust_score: row.get(8).map_err(StoreError::Sqlite)?,
            quarantined: row.get(9).map_err(StoreError::Sqlite)?,
        })
    })())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
