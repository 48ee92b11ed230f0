// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node reputation engine.
//!
//! Per-node state is sharded 64 ways by `fnv32a(node_id) % 64` so parallel
//! outcome recording from many workers does not contend on one lock. Each
//! node carries atomic outcome counters, latency/throughput EMAs, quality
//! scalars, a circuit breaker, and a bounded snapshot history; the engine
//! layers routing scores and best-node selection on top.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Per-node reputation state and the circuit breaker.
pub mod node;

pub use node::{CircuitState, NodeReputation, OutcomeCounters, ReputationSnapshot};

use acp_hash::fnv32a;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shard count for the node map.
const SHARDS: usize = 64;

/// Score returned for nodes that must not be routed to.
pub const DO_NOT_ROUTE: f64 = -1.0;

/// Routing profile of the task being placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskClass {
    /// Mission-critical: only near-perfect nodes qualify.
    Critical,
    /// Latency-bound: nodes slower than the cap are excluded.
    LatencySensitive {
        /// Maximum tolerable EMA latency in milliseconds; 0 disables the cap.
        max_latency_ms: u64,
    },
    /// Bulk work: any passable node, discounted.
    Background,
    /// Default routing.
    Normal,
}

/// Sharded reputation engine.
///
/// # Examples
///
/// ```
/// use acp_reputation::{ReputationEngine, TaskClass};
/// use std::time::Duration;
///
/// let engine = ReputationEngine::new(Duration::from_secs(30));
/// engine.record_success("node-a", 40.0, true);
/// let score = engine.get_routing_score("node-a", TaskClass::Normal);
/// assert!(score > 0.0);
/// ```
pub struct ReputationEngine {
    shards: Vec<Mutex<HashMap<String, Arc<NodeReputation>>>>,
    recovery: Duration,
    /// Global latency aggregates for relative latency scaling.
    global_latency_sum_ms: AtomicU64,
    global_latency_count: AtomicU64,
}

impl std::fmt::Debug for ReputationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationEngine")
            .field("shards", &self.shards.len())
            .field("nodes", &self.node_count())
            .finish()
    }
}

impl ReputationEngine {
    /// Create an engine whose circuits probe after `recovery`.
    #[must_use]
    pub fn new(recovery: Duration) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            recovery,
            global_latency_sum_ms: AtomicU64::new(0),
            global_latency_count: AtomicU64::new(0),
        }
    }

    fn shard(&self, node_id: &str) -> &Mutex<HashMap<String, Arc<NodeReputation>>> {
        let idx = (fnv32a(node_id.as_bytes()) as usize) % SHARDS;
        &self.shards[idx]
    }

    /// Fetch or create the reputation entry for a node.
    pub fn node(&self, node_id: &str) -> Arc<NodeReputation> {
        let mut shard = self.shard(node_id).lock().expect("reputation shard poisoned");
        Arc::clone(
            shard
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(NodeReputation::new(node_id, self.recovery))),
        )
    }

    /// Number of tracked nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("reputation shard poisoned").len())
            .sum()
    }

    // -- recording --------------------------------------------------------

    /// Record a successful execution on a node.
    pub fn record_success(&self, node_id: &str, latency_ms: f64, verified: bool) {
        self.observe_global_latency(latency_ms);
        self.node(node_id).record_success(latency_ms, verified);
    }

    /// Record a failed execution on a node.
    pub fn record_failure(&self, node_id: &str, latency_ms: f64) {
        self.observe_global_latency(latency_ms);
        self.node(node_id).record_failure(latency_ms);
    }

    /// Record a timeout on a node.
    pub fn record_timeout(&self, node_id: &str) {
        self.node(node_id).record_timeout();
    }

    /// Record a drifted step attributed to a node.
    pub fn record_drift(&self, node_id: &str) {
        self.node(node_id).record_drift();
    }

    /// Record a replay verification mismatch for a node.
    pub fn record_replay_mismatch(&self, node_id: &str) {
        self.node(node_id).record_replay_mismatch();
    }

    /// Force a node's circuit open with no timed recovery.
    pub fn quarantine(&self, node_id: &str) {
        self.node(node_id).quarantine();
    }

    /// Force a node's circuit into half-open probing.
    pub fn restore(&self, node_id: &str) {
        self.node(node_id).restore();
    }

    fn observe_global_latency(&self, latency_ms: f64) {
        self.global_latency_sum_ms
            .fetch_add(latency_ms.max(0.0) as u64, Relaxed);
        self.global_latency_count.fetch_add(1, Relaxed);
    }

    /// Mean latency across all recorded executions, if any.
    #[must_use]
    pub fn global_mean_latency_ms(&self) -> Option<f64> {
        let count = self.global_latency_count.load(Relaxed);
        if count == 0 {
            return None;
        }
        Some(self.global_latency_sum_ms.load(Relaxed) as f64 / count as f64)
    }

    // -- routing ----------------------------------------------------------

    /// Routing score for one node under a task class.
    ///
    /// [`DO_NOT_ROUTE`] (−1) means the node must not be used: open circuit,
    /// a failed critical gate, a blown latency cap, or a composite below
    /// the background floor.
    #[must_use]
    pub fn get_routing_score(&self, node_id: &str, task: TaskClass) -> f64 {
        let rep = self.node(node_id);
        self.score_node(&rep, task)
    }

    fn score_node(&self, rep: &NodeReputation, task: TaskClass) -> f64 {
        if rep.circuit_state() == CircuitState::Open {
            return DO_NOT_ROUTE;
        }
        let composite = rep.composite();

        match task {
            TaskClass::Critical => {
                let accuracy = rep.accuracy();
                let success_rate = rep.success_rate();
                if accuracy < 0.95 || success_rate < 0.99 {
                    return DO_NOT_ROUTE;
                }
                composite * accuracy * accuracy * success_rate
            }
            TaskClass::LatencySensitive { max_latency_ms } => {
                let latency = rep.latency_ms();
                if max_latency_ms > 0 && latency > max_latency_ms as f64 {
                    return DO_NOT_ROUTE;
                }
                match self.global_mean_latency_ms() {
                    Some(global_mean) if latency > 0.0 && global_mean > 0.0 => {
                        composite * (global_mean / latency)
                    }
                    _ => composite,
                }
            }
            TaskClass::Background => {
                if composite < 0.3 {
                    return DO_NOT_ROUTE;
                }
                composite * 0.8
            }
            TaskClass::Normal => composite,
        }
    }

    /// The top `n` routable nodes for a task, best first.
    ///
    /// Scans every shard, drops excluded and unroutable nodes, sorts by
    /// score descending with node-id-ascending tie-breaks for determinism.
    #[must_use]
    pub fn select_best_nodes(
        &self,
        task: TaskClass,
        n: usize,
        excludes: &[&str],
    ) -> Vec<(String, f64)> {
        let mut scored = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().expect("reputation shard poisoned");
            for (node_id, rep) in shard.iter() {
                if excludes.contains(&node_id.as_str()) {
                    continue;
                }
                let score = self.score_node(rep, task);
                if score >= 0.0 {
                    scored.push((node_id.clone(), score));
                }
            }
        }
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(n);
        scored
    }

    /// Snapshot of every tracked node's headline numbers, keyed by node id.
    #[must_use]
    pub fn snapshots(&self) -> HashMap<String, ReputationSnapshot> {
        let mut out = HashMap::new();
        for shard in &self.shards {
            let shard = shard.lock().expect("reputation shard poisoned");
            for (node_id, rep) in shard.iter() {
                out.insert(
                    node_id.clone(),
                    ReputationSnapshot {
                        ts: chrono::Utc::now(),
                        success_rate: rep.success_rate(),
                        latency_p50: rep.latency_p50_ms(),
                        composite: rep.composite(),
                    },
                );
            }
        }
        out
    }
}
