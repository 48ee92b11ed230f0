// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded, durable, priority FIFO with lease-based dispatch.
//!
//! Jobs live in the persistent store; this crate layers the queue
//! semantics on top: depth cap, per-tenant idempotency, fresh lease tokens
//! per scan, exponential backoff with deterministic jitter, and
//! dead-lettering once attempts run out. An in-process atomic counter
//! mirrors queue depth so observers never have to query the store.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_core::{Job, JobStatus};
use acp_hash::fnv32a;
use acp_store::{Store, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default queue depth cap.
pub const DEFAULT_MAX_DEPTH: usize = 1_000;

/// Default attempt cap for jobs that do not set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default dispatch priority (lower runs earlier).
pub const DEFAULT_PRIORITY: i64 = 100;

/// Backoff ceiling in seconds.
const BACKOFF_CAP_SECS: u64 = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is at its depth cap.
    #[error("queue is full (max depth {max_depth})")]
    Full {
        /// Configured depth cap.
        max_depth: usize,
    },

    /// A job with the same `(tenant, idempotency_key)` is already enqueued.
    #[error("duplicate job: key '{idempotency_key}' (tenant {tenant_id})")]
    Duplicate {
        /// Owning tenant.
        tenant_id: String,
        /// Conflicting key.
        idempotency_key: String,
    },

    /// Underlying store failure.
    #[error("store failure")]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Map onto the stable error taxonomy.
    pub fn error_code(&self) -> acp_error::ErrorCode {
        match self {
            Self::Full { .. } => acp_error::ErrorCode::QueueFull,
            Self::Duplicate { .. } => acp_error::ErrorCode::DuplicateJob,
            Self::Store(_) => acp_error::ErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Enqueue request
// ---------------------------------------------------------------------------

/// Parameters for [`DurableQueue::enqueue`]. Unset fields take the
/// documented defaults.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Run the job executes for.
    pub run_id: String,
    /// Optional session scope.
    pub session_id: Option<String>,
    /// Optional node pin.
    pub node_id: Option<String>,
    /// Job type tag.
    pub job_type: String,
    /// Opaque worker payload.
    pub payload: serde_json::Value,
    /// Deduplication key, unique per tenant.
    pub idempotency_key: String,
    /// Dispatch priority; defaults to [`DEFAULT_PRIORITY`].
    pub priority: Option<i64>,
    /// Attempt cap; defaults to [`DEFAULT_MAX_ATTEMPTS`].
    pub max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Retry delay after `attempts` completed attempts:
/// `min(2^(attempts+1), 64)` seconds plus a deterministic jitter in
/// `[0, 1000)` ms derived from the job id, so a thundering herd of retries
/// spreads out identically on every replay.
#[must_use]
pub fn retry_backoff(job_id: &str, salt: &str, attempts: u32) -> Duration {
    let exp = attempts.saturating_add(1).min(63);
    let secs = (1u64 << exp).min(BACKOFF_CAP_SECS);
    let jitter_ms = u64::from(fnv32a(format!("{job_id}{salt}").as_bytes()) % 1_000);
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Durable queue facade over the persistent store.
#[derive(Debug)]
pub struct DurableQueue {
    store: Arc<Store>,
    max_depth: usize,
    lease_duration: Duration,
    default_max_attempts: u32,
    jitter_salt: String,
    /// Live-job mirror; advisory only, the store stays authoritative.
    depth: AtomicUsize,
}

impl DurableQueue {
    /// Create a queue with the given caps, seeding the depth mirror from
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the live-job count cannot be read.
    pub fn new(
        store: Arc<Store>,
        max_depth: usize,
        lease_duration: Duration,
        default_max_attempts: u32,
    ) -> Result<Self, QueueError> {
        let depth = store.count_live_jobs()?;
        Ok(Self {
            store,
            max_depth,
            lease_duration,
            default_max_attempts,
            jitter_salt: "acp-queue".into(),
            depth: AtomicUsize::new(depth),
        })
    }

    /// Current live-job depth (mirror).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(SeqCst)
    }

    /// Remaining enqueue capacity (mirror).
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.max_depth.saturating_sub(self.depth())
    }

    /// Configured depth cap.
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Enqueue a job, filling defaults.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Full`] at the depth cap.
    /// - [`QueueError::Duplicate`] when `(tenant, idempotency_key)` exists.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<Job, QueueError> {
        if self.depth() >= self.max_depth {
            return Err(QueueError::Full {
                max_depth: self.max_depth,
            });
        }

        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id,
            run_id: request.run_id,
            session_id: request.session_id,
            node_id: request.node_id,
            job_type: request.job_type,
            payload: request.payload,
            idempotency_key: request.idempotency_key,
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(self.default_max_attempts),
            status: JobStatus::Queued,
            next_run_at: now,
            lease_token: None,
            leased_until: None,
            last_error: None,
            created_at: now,
        };

        match self.store.insert_job(&job) {
            Ok(_) => {
                self.depth.fetch_add(1, SeqCst);
                debug!(job_id = %job.job_id, tenant = %job.tenant_id, "enqueued job");
                Ok(job)
            }
            Err(StoreError::DuplicateJob {
                tenant_id,
                idempotency_key,
            }) => Err(QueueError::Duplicate {
                tenant_id,
                idempotency_key,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Lease up to `limit` visible jobs under a fresh opaque token.
    ///
    /// Returns the token and the leased jobs in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on store failure.
    pub fn lease(&self, limit: usize) -> Result<(String, Vec<Job>), QueueError> {
        let token = Uuid::new_v4().to_string();
        let jobs = self
            .store
            .lease_ready_jobs(Utc::now(), limit, &token, self.lease_duration)?;
        if !jobs.is_empty() {
            debug!(count = jobs.len(), "leased jobs");
        }
        Ok((token, jobs))
    }

    /// Complete a leased job. A stale token is a silent no-op and returns
    /// `false`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on store failure.
    pub fn complete(
        &self,
        job_id: &str,
        lease_token: &str,
        result: &serde_json::Value,
    ) -> Result<bool, QueueError> {
        let done = self.store.complete_job(job_id, lease_token, result)?;
        if done {
            self.depth.fetch_sub(1, SeqCst);
        }
        Ok(done)
    }

    /// Fail a leased job: schedule a backoff retry, or dead-letter when
    /// `dead` is set or attempts are exhausted. A stale token is a silent
    /// no-op and returns `false`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on store failure.
    pub fn fail(
        &self,
        job_id: &str,
        lease_token: &str,
        error: &str,
        dead: bool,
    ) -> Result<bool, QueueError> {
        let Some(job) = self.store.get_job(job_id)? else {
            return Ok(false);
        };

        let exhausted = job.attempts + 1 >= job.max_attempts;
        let dead = dead || exhausted;
        let backoff = retry_backoff(job_id, &self.jitter_salt, job.attempts);
        let next_run_at =
            Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();

        let changed = self
            .store
            .fail_job(job_id, lease_token, error, next_run_at, dead)?;
        if changed && dead {
            self.depth.fetch_sub(1, SeqCst);
            warn!(job_id, attempts = job.attempts + 1, "job dead-lettered");
        }
        Ok(changed)
    }

    /// Stored result of a completed job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] on store failure.
    pub fn result(&self, job_id: &str) -> Result<Option<serde_json::Value>, QueueError> {
        Ok(self.store.job_result(job_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_with_cap() {
        let base = |attempts| retry_backoff("job", "s", attempts).as_secs();
        assert_eq!(base(0), 2);
        assert_eq!(base(1), 4);
        assert_eq!(base(2), 8);
        assert_eq!(base(4), 32);
        assert_eq!(base(5), 64);
        assert_eq!(base(20), 64);
        assert_eq!(base(u32::MAX), 64);
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let a = retry_backoff("job-1", "salt", 0);
        let b = retry_backoff("job-1", "salt", 0);
        assert_eq!(a, b);

        let other = retry_backoff("job-2", "salt", 0);
        // Different jobs usually land on different jitter; both stay under
        // one extra second.
        assert!(a.subsec_millis() < 1_000);
        assert!(other.subsec_millis() < 1_000);
    }
}
