// SPDX-License-Identifier: MIT OR Apache-2.0
//! Federation selection: which remote node gets a delegation.
//!
//! Candidates first pass an eligibility filter (quarantine, spec and
//! registry compatibility, required capabilities); survivors are then
//! either tie-broken deterministically by node id or scored with the
//! weighted formula. Selection is a pure function of its inputs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A remote node offered as a delegation target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable node identifier.
    pub node_id: String,
    /// Capability tokens the node offers.
    pub capabilities: Vec<String>,
    /// Protocol spec version the node speaks.
    pub spec_version: String,
    /// Hash of the tool registry snapshot the node was built against.
    pub registry_snapshot_hash: String,
    /// Recent request latency in milliseconds.
    pub latency_ms: u64,
    /// Reputation-derived trust score in [0, 1].
    pub trust_score: f64,
    /// Stake or economic weight backing the node.
    pub economic_weight: f64,
    /// Administratively or automatically excluded.
    pub quarantined: bool,
}

/// Selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Capabilities every eligible candidate must offer.
    pub required_capabilities: Vec<String>,
    /// Spec version candidates must match.
    pub spec_version: String,
    /// Registry snapshot hash candidates must match.
    pub registry_snapshot_hash: String,
    /// Score with the weighted formula instead of the id tiebreak.
    pub enable_weighted: bool,
    /// Multiplier for the economic-weight term.
    pub economic_weight_factor: f64,
}

/// Selection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    /// Every candidate was filtered out.
    #[error("no eligible delegation candidate")]
    NoEligibleCandidate,
}

/// A selection outcome: the chosen node and its score (0 for unweighted).
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// The chosen node.
    pub node_id: String,
    /// Weighted score, or 0.0 under the deterministic tiebreak.
    pub score: f64,
}

fn eligible(candidate: &Candidate, config: &SelectorConfig) -> bool {
    !candidate.quarantined
        && candidate.spec_version == config.spec_version
        && candidate.registry_snapshot_hash == config.registry_snapshot_hash
        && config
            .required_capabilities
            .iter()
            .all(|cap| candidate.capabilities.contains(cap))
}

/// Weighted score:
/// `trust × 10 + ⌊1000 / latency_ms⌋ + economic_weight × factor`.
fn weighted_score(candidate: &Candidate, factor: f64) -> f64 {
    let latency_term = if candidate.latency_ms > 0 {
        (1_000 / candidate.latency_ms) as f64
    } else {
        1_000.0
    };
    candidate.trust_score * 10.0 + latency_term + candidate.economic_weight * factor
}

/// Choose the delegation target from `candidates`.
///
/// Unweighted mode picks the eligible candidate with the lexicographically
/// smallest node id. Weighted mode scores candidates and picks the
/// highest, ties broken by node id ascending.
///
/// # Errors
///
/// Returns [`SelectError::NoEligibleCandidate`] when the filter leaves
/// nothing.
pub fn select(
    config: &SelectorConfig,
    candidates: &[Candidate],
) -> Result<Selection, SelectError> {
    let mut survivors: Vec<&Candidate> =
        candidates.iter().filter(|c| eligible(c, config)).collect();
    if survivors.is_empty() {
        return Err(SelectError::NoEligibleCandidate);
    }

    if !config.enable_weighted {
        survivors.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let chosen = survivors[0];
        debug!(node = %chosen.node_id, "selected delegation target (tiebreak)");
        return Ok(Selection {
            node_id: chosen.node_id.clone(),
            score: 0.0,
        });
    }

    let mut scored: Vec<(f64, &Candidate)> = survivors
        .into_iter()
        .map(|c| (weighted_score(c, config.economic_weight_factor), c))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.node_id.cmp(&b.1.node_id))
    });
    let (score, chosen) = scored[0];
    debug!(node = %chosen.node_id, score, "selected delegation target (weighted)");
    Ok(Selection {
        node_id: chosen.node_id.clone(),
        score,
    })
}

/// Whether a node should be quarantined: any replay mismatch is an
/// immediate quarantine, and so is a routing score below the threshold.
#[must_use]
pub fn should_quarantine(score: f64, replay_mismatch: bool, threshold: f64) -> bool {
    replay_mismatch || score < threshold
}

/// An encrypted delegation envelope, opaque to the control plane.
///
/// `hash` is the canonical hash of the plaintext; the receiving node
/// verifies it after decrypting. The core never decrypts — it only
/// shuttles envelopes and stores them as content-addressed blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationEnvelope {
    /// Target node.
    pub node_id: String,
    /// Encrypted payload, base64.
    pub ciphertext: String,
    /// Ephemeral public key, base64.
    pub epk: String,
    /// Initialization vector, base64.
    pub iv: String,
    /// Canonical hash of the plaintext.
    pub hash: String,
}
