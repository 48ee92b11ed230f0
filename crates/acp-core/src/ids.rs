// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run identifier assignment.
//!
//! Two schemes, chosen per deployment:
//!
//! - sequential: `run-<seq>` from a process-local monotonic counter,
//! - content-addressed: `H(pack_hash, input_hash, sequence)` so a run's id
//!   is reproducible from what it executes.

use acp_hash::DigestAuthority;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local monotonic run id generator.
///
/// # Examples
///
/// ```
/// use acp_core::ids::RunIdGenerator;
///
/// let ids = RunIdGenerator::new();
/// assert_eq!(ids.next_id(), "run-000001");
/// assert_eq!(ids.next_id(), "run-000002");
/// ```
#[derive(Debug, Default)]
pub struct RunIdGenerator {
    counter: AtomicU64,
}

impl RunIdGenerator {
    /// Create a generator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequential run id.
    pub fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("run-{seq:06}")
    }

    /// The number of ids assigned so far.
    #[must_use]
    pub fn assigned(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Derive a content-addressed run id.
///
/// The id is the digest of `{pack_hash, input_hash, sequence}`, so re-running
/// the same pack on the same input at the same sequence yields the same id
/// on any machine.
///
/// # Errors
///
/// Returns the underlying hash error; the inputs are strings and an integer,
/// so this is effectively infallible.
pub fn content_addressed_run_id(
    authority: &DigestAuthority,
    pack_hash: &str,
    input_hash: &str,
    sequence: u64,
) -> Result<String, acp_hash::HashError> {
    authority.hash(&serde_json::json!({
        "input_hash": input_hash,
        "pack_hash": pack_hash,
        "sequence": sequence,
    }))
}
