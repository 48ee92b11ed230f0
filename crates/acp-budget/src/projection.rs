// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sliding-window ordinary-least-squares spend projection.

use std::collections::VecDeque;

/// Maximum number of samples retained.
pub const WINDOW: usize = 60;

/// A sliding window of `(t_ms, spend_usd)` samples with OLS prediction.
#[derive(Debug, Default)]
pub struct RegressionWindow {
    samples: VecDeque<(i64, f64)>,
}

impl RegressionWindow {
    /// Create an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample, evicting the oldest past [`WINDOW`].
    pub fn push(&mut self, t_ms: i64, spend_usd: f64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((t_ms, spend_usd));
    }

    /// Number of retained samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// `true` when no samples are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Predict the spend at time `t_ms`.
    ///
    /// With fewer than two samples there is no slope: a single sample
    /// predicts itself, an empty window predicts 0.
    #[must_use]
    pub fn predict(&self, t_ms: i64) -> f64 {
        match self.samples.len() {
            0 => 0.0,
            1 => self.samples[0].1,
            n => {
                let n_f = n as f64;
                let mean_t = self.samples.iter().map(|(t, _)| *t as f64).sum::<f64>() / n_f;
                let mean_y = self.samples.iter().map(|(_, y)| *y).sum::<f64>() / n_f;
                let mut num = 0.0;
                let mut den = 0.0;
                for (t, y) in &self.samples {
                    let dt = *t as f64 - mean_t;
                    num += dt * (*y - mean_y);
                    den += dt * dt;
                }
                if den == 0.0 {
                    // All samples at the same instant; no trend to fit.
                    return mean_y;
                }
                let slope = num / den;
                let intercept = mean_y - slope * mean_t;
                intercept + slope * t_ms as f64
            }
        }
    }
}
