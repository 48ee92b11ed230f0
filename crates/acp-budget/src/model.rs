// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-tool cost models and the registry that learns them.
//!
//! Predictions read under a shared lock; observed-spend learning writes
//! under the exclusive lock. Models update with an EMA so a tool whose
//! price drifts converges without a restart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// EMA factor for learning from observed spend.
const ACCURACY_ALPHA: f64 = 0.2;

/// Cost model for one tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostModel {
    /// Fixed cost per invocation in USD.
    pub base: f64,
    /// Cost per token in USD.
    pub per_token: f64,
    /// Flat per-call surcharge in USD.
    pub per_call: f64,
    /// Running variance of observed cost against the model.
    pub variance: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            base: 0.001,
            per_token: 0.000_002,
            per_call: 0.0005,
            variance: 0.0,
        }
    }
}

impl CostModel {
    /// Point estimate for a call consuming `tokens`.
    #[must_use]
    pub fn estimate(&self, tokens: u64) -> f64 {
        self.base + self.per_token * tokens as f64 + self.per_call
    }
}

/// Thread-safe registry of per-tool cost models.
#[derive(Debug, Default)]
pub struct CostRegistry {
    models: RwLock<HashMap<String, CostModel>>,
}

impl CostRegistry {
    /// Create an empty registry; unknown tools get [`CostModel::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace the model for a tool.
    pub fn set_model(&self, tool: &str, model: CostModel) {
        self.models
            .write()
            .expect("cost registry poisoned")
            .insert(tool.to_string(), model);
    }

    /// The current model for a tool (default when unknown).
    #[must_use]
    pub fn model(&self, tool: &str) -> CostModel {
        self.models
            .read()
            .expect("cost registry poisoned")
            .get(tool)
            .copied()
            .unwrap_or_default()
    }

    /// Learn from an observed spend: EMA the base toward the actual cost
    /// and track the squared deviation as running variance.
    pub fn observe(&self, tool: &str, actual_cost: f64) {
        let mut models = self.models.write().expect("cost registry poisoned");
        let model = models.entry(tool.to_string()).or_default();
        let deviation = actual_cost - model.base;
        model.base = model.base * (1.0 - ACCURACY_ALPHA) + actual_cost * ACCURACY_ALPHA;
        model.variance =
            model.variance * (1.0 - ACCURACY_ALPHA) + deviation * deviation * ACCURACY_ALPHA;
    }
}
