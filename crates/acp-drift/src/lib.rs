// SPDX-License-Identifier: MIT OR Apache-2.0
//! Drift detection and replay verification.
//!
//! The golden-path registry remembers the first hash ever observed for
//! each `(pack, step)`; later executions of the same step either match it
//! or count as drift for their run. Replay verification recomputes a
//! historical event log's fingerprint and compares — pure, no clock, no
//! network.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_hash::{DigestAuthority, HashError};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Default cumulative drift score above which a run is hardened.
pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.5;

/// Outcome of one drift check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DriftCheck {
    /// 0.0 on match or first observation, 1.0 on divergence.
    pub score: f64,
    /// Whether this step diverged from its golden hash.
    pub drifted: bool,
}

/// Golden-path registry and per-run drift accounting.
///
/// # Examples
///
/// ```
/// use acp_drift::DriftDetector;
///
/// let detector = DriftDetector::new(0.5);
/// detector.register_step("pack-alpha", 0, "aaa");
/// let check = detector.check_drift("run-1", "pack-alpha", 0, "bbb");
/// assert!(check.drifted);
/// assert!(detector.exceeds_threshold("run-1"));
/// ```
#[derive(Debug)]
pub struct DriftDetector {
    golden: Mutex<HashMap<(String, u32), String>>,
    drift_counts: Mutex<HashMap<String, u32>>,
    alert_threshold: f64,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_THRESHOLD)
    }
}

impl DriftDetector {
    /// Create a detector with the given hardening threshold.
    #[must_use]
    pub fn new(alert_threshold: f64) -> Self {
        Self {
            golden: Mutex::new(HashMap::new()),
            drift_counts: Mutex::new(HashMap::new()),
            alert_threshold,
        }
    }

    /// The configured hardening threshold.
    #[must_use]
    pub fn alert_threshold(&self) -> f64 {
        self.alert_threshold
    }

    /// Record `hash` as the golden hash for `(pack, step)` iff none is
    /// registered yet. Returns `true` when this call set it.
    pub fn register_step(&self, pack_id: &str, step: u32, hash: &str) -> bool {
        let mut golden = self.golden.lock().expect("golden registry poisoned");
        let key = (pack_id.to_string(), step);
        if golden.contains_key(&key) {
            return false;
        }
        debug!(pack = pack_id, step, hash, "registered golden step hash");
        golden.insert(key, hash.to_string());
        true
    }

    /// The golden hash for `(pack, step)`, if one is registered.
    #[must_use]
    pub fn golden_hash(&self, pack_id: &str, step: u32) -> Option<String> {
        self.golden
            .lock()
            .expect("golden registry poisoned")
            .get(&(pack_id.to_string(), step))
            .cloned()
    }

    /// Compare `current_hash` against the golden hash for `(pack, step)`.
    ///
    /// The first observation of a step becomes its golden hash and scores
    /// `(0, false)`; a match scores the same; a divergence scores
    /// `(1, true)` and increments the run's drift count.
    pub fn check_drift(
        &self,
        run_id: &str,
        pack_id: &str,
        step: u32,
        current_hash: &str,
    ) -> DriftCheck {
        let mut golden = self.golden.lock().expect("golden registry poisoned");
        let key = (pack_id.to_string(), step);
        match golden.get(&key) {
            None => {
                golden.insert(key, current_hash.to_string());
                DriftCheck {
                    score: 0.0,
                    drifted: false,
                }
            }
            Some(expected) if expected == current_hash => DriftCheck {
                score: 0.0,
                drifted: false,
            },
            Some(expected) => {
                warn!(
                    run_id,
                    pack = pack_id,
                    step,
                    expected = %expected,
                    actual = current_hash,
                    "step drifted from golden path"
                );
                drop(golden);
                *self
                    .drift_counts
                    .lock()
                    .expect("drift counts poisoned")
                    .entry(run_id.to_string())
                    .or_insert(0) += 1;
                DriftCheck {
                    score: 1.0,
                    drifted: true,
                }
            }
        }
    }

    /// Cumulative drift score for a run (one point per drifted step).
    #[must_use]
    pub fn drift_score(&self, run_id: &str) -> f64 {
        f64::from(
            self.drift_counts
                .lock()
                .expect("drift counts poisoned")
                .get(run_id)
                .copied()
                .unwrap_or(0),
        )
    }

    /// Whether the run's cumulative drift exceeds the hardening threshold.
    #[must_use]
    pub fn exceeds_threshold(&self, run_id: &str) -> bool {
        self.drift_score(run_id) > self.alert_threshold
    }
}

// ---------------------------------------------------------------------------
// Replay verification
// ---------------------------------------------------------------------------

/// Verify a historical event log against a stored fingerprint.
///
/// Recomputes `hash({event_log, run_id})`, rebuilds the fingerprint under
/// the authority's pinned engine version, and compares. Pure: no side
/// effects, no clock, no network.
///
/// # Errors
///
/// Returns [`HashError`] if the log cannot be hashed (entropy violation in
/// a payload); a clean mismatch is `Ok(false)`.
pub fn verify_fingerprint(
    authority: &DigestAuthority,
    event_log: &[Value],
    run_id: &str,
    expected_fingerprint: &str,
) -> Result<bool, HashError> {
    let log_hash = authority.event_log_hash(event_log, run_id)?;
    let fingerprint = authority.fingerprint(run_id, &log_hash)?;
    Ok(fingerprint == expected_fingerprint)
}
