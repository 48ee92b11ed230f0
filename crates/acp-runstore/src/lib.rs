// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run lifecycle and per-run event streams.
//!
//! Wraps the persistent store with run-centric semantics: tenant-scoped
//! reads, payload normalization on append, bounded in-memory fan-out to
//! live subscribers, and exactly-once finalization that fingerprints the
//! event log.
//!
//! Fan-out never gates the log: a subscriber with a full channel loses that
//! event (and recovers by rereading [`RunStore::event_history`] from its
//! last acknowledged id), while the append itself always lands.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_core::ids::RunIdGenerator;
use acp_core::{Event, Run, RunStatus, payload};
use acp_hash::{DigestAuthority, HashError};
use acp_store::{Store, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Default per-subscriber channel capacity.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from run-store operations.
#[derive(Debug, thiserror::Error)]
pub enum RunStoreError {
    /// The payload failed schema validation.
    #[error("invalid payload")]
    InvalidPayload(#[from] payload::PayloadError),

    /// A digest input violated the entropy boundary.
    #[error("entropy violation")]
    Entropy(#[from] HashError),

    /// Underlying store failure (including tenant-scoped not-found).
    #[error("store failure")]
    Store(#[from] StoreError),
}

impl RunStoreError {
    /// Map onto the stable error taxonomy.
    pub fn error_code(&self) -> acp_error::ErrorCode {
        match self {
            Self::InvalidPayload(_) => acp_error::ErrorCode::InvalidPayload,
            Self::Entropy(_) => acp_error::ErrorCode::EntropyViolation,
            Self::Store(StoreError::RunNotFound { .. }) => acp_error::ErrorCode::NotFound,
            Self::Store(StoreError::AlreadyFinalized { .. }) => {
                acp_error::ErrorCode::AlreadyExists
            }
            Self::Store(StoreError::DuplicateJob { .. }) => acp_error::ErrorCode::DuplicateJob,
            Self::Store(_) => acp_error::ErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    /// Set before removal so a concurrent publish can never race a close.
    closed: AtomicBool,
}

/// Handle that keeps a subscription alive; dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionGuard {
    run_id: String,
    subscriber_id: u64,
    subs: Arc<Mutex<HashMap<String, Vec<Arc<Subscriber>>>>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut subs = self.subs.lock().expect("subscription map poisoned");
        if let Some(list) = subs.get_mut(&self.run_id) {
            // Mark closed first; publish checks the flag before sending.
            for sub in list.iter() {
                if sub.id == self.subscriber_id {
                    sub.closed.store(true, Ordering::SeqCst);
                }
            }
            list.retain(|sub| sub.id != self.subscriber_id);
            if list.is_empty() {
                subs.remove(&self.run_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Run creation options
// ---------------------------------------------------------------------------

/// Options for [`RunStore::create_run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Hard spend cap in USD.
    pub budget_usd: f64,
    /// Route only to high-accuracy nodes.
    pub critical: bool,
    /// Deterministic time mode (fixed at creation).
    pub deterministic: bool,
    /// Content id of the pack to execute.
    pub pack_cid: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            budget_usd: 5.0,
            critical: false,
            deterministic: false,
            pack_cid: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

/// Run-centric view over the persistent store with live subscriptions.
#[derive(Debug)]
pub struct RunStore {
    store: Arc<Store>,
    ids: RunIdGenerator,
    subs: Arc<Mutex<HashMap<String, Vec<Arc<Subscriber>>>>>,
    next_subscriber_id: AtomicU64,
    subscriber_capacity: usize,
}

impl RunStore {
    /// Create a run store over the given persistent store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_capacity(store, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a run store with a custom per-subscriber channel capacity.
    #[must_use]
    pub fn with_capacity(store: Arc<Store>, subscriber_capacity: usize) -> Self {
        Self {
            store,
            ids: RunIdGenerator::new(),
            subs: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
            subscriber_capacity,
        }
    }

    /// Shared access to the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Create a run: assign an id, persist the row, return the run.
    ///
    /// # Errors
    ///
    /// Returns [`RunStoreError::Store`] on persistence failure.
    pub fn create_run(
        &self,
        tenant_id: &str,
        capabilities: Vec<String>,
        options: RunOptions,
    ) -> Result<Run, RunStoreError> {
        let run = Run {
            run_id: self.ids.next_id(),
            tenant_id: tenant_id.into(),
            capabilities,
            status: RunStatus::Created,
            created_at: Utc::now(),
            pack_cid: options.pack_cid,
            fingerprint: None,
            budget_usd: options.budget_usd,
            critical: options.critical,
            deterministic: options.deterministic,
            hardened: false,
        };
        self.store.insert_run(&run)?;
        debug!(run_id = %run.run_id, tenant = tenant_id, "created run");
        Ok(run)
    }

    /// Tenant-scoped run lookup.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the run is absent in that tenant.
    pub fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<Run, RunStoreError> {
        Ok(self.store.get_run(tenant_id, run_id)?)
    }

    /// Mark a run as actively executing.
    ///
    /// # Errors
    ///
    /// Returns [`RunStoreError::Store`] on persistence failure.
    pub fn start_run(&self, run_id: &str) -> Result<(), RunStoreError> {
        Ok(self.store.update_run_status(run_id, RunStatus::Running)?)
    }

    /// Mark a run failed.
    ///
    /// # Errors
    ///
    /// Returns [`RunStoreError::Store`] on persistence failure.
    pub fn fail_run(&self, run_id: &str) -> Result<(), RunStoreError> {
        Ok(self.store.update_run_status(run_id, RunStatus::Failed)?)
    }

    /// Validate, normalize, and persist one event. Returns the assigned id.
    ///
    /// # Errors
    ///
    /// - [`RunStoreError::InvalidPayload`] on schema violations.
    /// - A not-found error when the run is absent in the tenant.
    pub fn append_event(
        &self,
        tenant_id: &str,
        run_id: &str,
        event_type: &str,
        mut event_payload: serde_json::Value,
    ) -> Result<i64, RunStoreError> {
        // Ownership check before any write.
        self.store.get_run(tenant_id, run_id)?;
        payload::normalize(event_type, &mut event_payload)?;
        let id = self
            .store
            .append_event(tenant_id, run_id, event_type, &event_payload, Utc::now())?;
        Ok(id)
    }

    /// Append an event, then fan it out to live subscribers of the run.
    ///
    /// Fan-out is best-effort per subscriber: a full channel drops the
    /// event for that subscriber only; the log always keeps it.
    ///
    /// # Errors
    ///
    /// Same as [`RunStore::append_event`].
    pub fn publish_event(
        &self,
        tenant_id: &str,
        run_id: &str,
        event_type: &str,
        event_payload: serde_json::Value,
    ) -> Result<i64, RunStoreError> {
        let mut normalized = event_payload;
        self.store.get_run(tenant_id, run_id)?;
        payload::normalize(event_type, &mut normalized)?;
        let created_at = Utc::now();
        let id =
            self.store
                .append_event(tenant_id, run_id, event_type, &normalized, created_at)?;

        let event = Event {
            id,
            run_id: run_id.into(),
            event_type: event_type.into(),
            payload: normalized,
            created_at,
        };
        self.fan_out(run_id, event);
        Ok(id)
    }

    fn fan_out(&self, run_id: &str, event: Event) {
        let subs = self.subs.lock().expect("subscription map poisoned");
        let Some(list) = subs.get(run_id) else {
            return;
        };
        for sub in list {
            if sub.closed.load(Ordering::SeqCst) {
                continue;
            }
            if sub.tx.try_send(event.clone()).is_err() {
                // Slow subscriber: this event is lost for them; recovery is
                // event_history from the last acknowledged id.
                warn!(
                    run_id,
                    subscriber = sub.id,
                    event_id = event.id,
                    "subscriber channel full, dropping event"
                );
            }
        }
    }

    /// Ordered events of a run strictly after `after_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RunStoreError::Store`] on persistence failure.
    pub fn event_history(
        &self,
        tenant_id: &str,
        run_id: &str,
        after_id: i64,
    ) -> Result<Vec<Event>, RunStoreError> {
        Ok(self.store.list_events(tenant_id, run_id, after_id)?)
    }

    /// Subscribe to future events of a run.
    ///
    /// The stream yields a prefix of the run's event sequence; drop the
    /// guard to unsubscribe. Restart coverage after drops via
    /// [`RunStore::event_history`].
    #[must_use]
    pub fn subscribe(&self, run_id: &str) -> (ReceiverStream<Event>, SubscriptionGuard) {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            tx,
            closed: AtomicBool::new(false),
        });
        self.subs
            .lock()
            .expect("subscription map poisoned")
            .entry(run_id.to_string())
            .or_default()
            .push(subscriber);
        (
            ReceiverStream::new(rx),
            SubscriptionGuard {
                run_id: run_id.to_string(),
                subscriber_id: id,
                subs: Arc::clone(&self.subs),
            },
        )
    }

    /// Number of live subscribers for a run.
    #[must_use]
    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.subs
            .lock()
            .expect("subscription map poisoned")
            .get(run_id)
            .map_or(0, Vec::len)
    }

    /// Finalize a run: fingerprint its full event log and set the status,
    /// exactly once.
    ///
    /// # Errors
    ///
    /// - [`RunStoreError::Entropy`] if any payload violates the boundary.
    /// - An already-finalized error on a second call.
    pub fn finalize_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        authority: &DigestAuthority,
    ) -> Result<String, RunStoreError> {
        let events = self.store.list_events(tenant_id, run_id, 0)?;
        let entries: Vec<serde_json::Value> = events.iter().map(Event::log_entry).collect();
        let log_hash = authority.event_log_hash(&entries, run_id)?;
        let fingerprint = authority.fingerprint(run_id, &log_hash)?;
        self.store.finalize_run(tenant_id, run_id, &fingerprint)?;
        debug!(run_id, fingerprint = %fingerprint, "finalized run");
        Ok(fingerprint)
    }
}
