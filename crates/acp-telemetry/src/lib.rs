// SPDX-License-Identifier: MIT OR Apache-2.0
//! Observability snapshot readers.
//!
//! The core mandates counter and gauge *readers*, not a transport: this
//! crate aggregates the live numbers (queue depth and free slots, CAS
//! counts and bytes, per-node reputation, per-run budget status) into one
//! serializable report a façade can expose however it likes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_budget::{BudgetRegistry, BudgetSnapshot};
use acp_cas::Cas;
use acp_queue::DurableQueue;
use acp_reputation::{ReputationEngine, ReputationSnapshot};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Queue gauges.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Live jobs (queued + leased + retry-wait).
    pub depth: usize,
    /// Remaining enqueue capacity.
    pub available_slots: usize,
    /// Configured depth cap.
    pub max_depth: usize,
}

/// CAS gauges.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CasMetrics {
    /// Live objects per type (stable key order).
    pub counts: BTreeMap<String, usize>,
    /// Total live object bytes.
    pub total_bytes: u64,
    /// Stray files relative to live objects.
    pub fragmentation: f64,
}

/// Full control-plane metrics report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsReport {
    /// Queue gauges, when a queue is registered.
    pub queue: Option<QueueMetrics>,
    /// CAS gauges, when a store is registered.
    pub cas: Option<CasMetrics>,
    /// Per-node reputation snapshots.
    pub nodes: HashMap<String, ReputationSnapshot>,
    /// Per-run budget snapshots.
    pub budgets: HashMap<String, BudgetSnapshot>,
}

/// Aggregating reader over the live subsystems.
///
/// Construct with whatever subsystems exist; absent ones simply produce
/// empty sections.
#[derive(Debug, Default)]
pub struct Telemetry {
    queue: Option<Arc<DurableQueue>>,
    cas: Option<Arc<Cas>>,
    reputation: Option<Arc<ReputationEngine>>,
    budgets: Option<Arc<BudgetRegistry>>,
}

impl Telemetry {
    /// Create a reader with no registered subsystems.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the durable queue.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<DurableQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Register the content-addressed store.
    #[must_use]
    pub fn with_cas(mut self, cas: Arc<Cas>) -> Self {
        self.cas = Some(cas);
        self
    }

    /// Register the reputation engine.
    #[must_use]
    pub fn with_reputation(mut self, engine: Arc<ReputationEngine>) -> Self {
        self.reputation = Some(engine);
        self
    }

    /// Register the budget registry.
    #[must_use]
    pub fn with_budgets(mut self, budgets: Arc<BudgetRegistry>) -> Self {
        self.budgets = Some(budgets);
        self
    }

    /// Collect a point-in-time report across all registered subsystems.
    #[must_use]
    pub fn report(&self) -> MetricsReport {
        let queue = self.queue.as_ref().map(|q| QueueMetrics {
            depth: q.depth(),
            available_slots: q.available_slots(),
            max_depth: q.max_depth(),
        });

        let cas = self.cas.as_ref().and_then(|cas| match cas.status_ex() {
            Ok(status) => Some(CasMetrics {
                counts: status
                    .counts
                    .iter()
                    .map(|(kind, count)| (kind.to_string(), *count))
                    .collect(),
                total_bytes: status.total_bytes,
                fragmentation: status.fragmentation,
            }),
            Err(e) => {
                warn!(error = %e, "cas status unavailable");
                None
            }
        });

        MetricsReport {
            queue,
            cas,
            nodes: self
                .reputation
                .as_ref()
                .map(|r| r.snapshots())
                .unwrap_or_default(),
            budgets: self
                .budgets
                .as_ref()
                .map(|b| b.snapshots())
                .unwrap_or_default(),
        }
    }
}
