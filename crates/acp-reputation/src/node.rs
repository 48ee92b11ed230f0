// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-node reputation state and the circuit breaker.
//!
//! Outcome counters and quality scalars are atomics (scalars fixed-point
//! ×10⁶); the one mutex guards circuit state transitions only, keeping the
//! record hot path lock-free.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed, Ordering::SeqCst};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fixed-point scale for unit-interval scalars.
const SCALAR_SCALE: f64 = 1_000_000.0;

/// EMA factor for latency.
const LATENCY_ALPHA: f64 = 0.3;

/// EMA factor for accuracy and availability recovery.
const QUALITY_ALPHA: f64 = 0.2;

/// Minimum outcomes before the circuit may open.
const OPEN_MIN_TOTAL: u64 = 10;

/// Failure rate above which a closed circuit opens.
const OPEN_FAILURE_RATE: f64 = 0.5;

/// Minimum probes before a half-open circuit may settle.
const HALF_OPEN_MIN_TOTAL: u64 = 5;

/// Probe success rate above which a half-open circuit closes.
const HALF_OPEN_SUCCESS_RATE: f64 = 0.8;

/// History ring capacity.
const HISTORY_CAPACITY: usize = 100;

/// One history snapshot is recorded every this many executions.
const HISTORY_EVERY: u64 = 10;

/// Raw latency samples retained for percentile reads.
const LATENCY_WINDOW: usize = 64;

/// Latency-sample slot value meaning "never written".
const EMPTY_SLOT: u64 = u64::MAX;

fn scalar_to_f64(raw: u32) -> f64 {
    f64::from(raw) / SCALAR_SCALE
}

fn f64_to_scalar(v: f64) -> u32 {
    (v.clamp(0.0, 1.0) * SCALAR_SCALE) as u32
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper] * frac
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast; requests are refused without attempting the node.
    Open,
    /// Probing after the recovery delay.
    HalfOpen,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    /// When the circuit opened; `None` means held open (quarantine).
    opened_at: Option<Instant>,
    /// Probe outcomes observed since entering half-open.
    window_success: u64,
    window_failure: u64,
}

/// A point-in-time history record.
#[derive(Debug, Clone, Serialize)]
pub struct ReputationSnapshot {
    /// Snapshot timestamp.
    pub ts: DateTime<Utc>,
    /// Success rate at snapshot time.
    pub success_rate: f64,
    /// Median latency over the recent sample window, in milliseconds.
    pub latency_p50: f64,
    /// Composite quality score.
    pub composite: f64,
}

/// Full reputation state for one node.
#[derive(Debug)]
pub struct NodeReputation {
    node_id: String,

    success: AtomicU64,
    failure: AtomicU64,
    drift: AtomicU64,
    timeout: AtomicU64,
    replay_mismatch: AtomicU64,
    executions: AtomicU64,

    /// Latency EMA, milliseconds ×10³.
    latency_ema: AtomicU64,
    /// EMA of squared latency deviation, ms² ×10³.
    latency_var_ema: AtomicU64,
    /// Throughput EMA, operations per second ×10⁶.
    throughput_ema: AtomicU64,
    /// Ring of recent raw latency samples (ms ×10³) for percentile reads;
    /// plain atomic slots keep the record path lock-free.
    latency_samples: Vec<AtomicU64>,
    latency_sample_idx: AtomicU64,

    /// Quality scalars in [0, 1], fixed-point ×10⁶.
    accuracy: AtomicU32,
    consistency: AtomicU32,
    availability: AtomicU32,

    /// Lazily cached composite score (×10⁶); `u32::MAX` marks dirty.
    composite_cache: AtomicU32,

    circuit: Mutex<CircuitInner>,
    recovery: Duration,

    history: Mutex<VecDeque<ReputationSnapshot>>,
}

/// Aggregated counter values.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OutcomeCounters {
    /// Successful executions.
    pub success: u64,
    /// Failed executions.
    pub failure: u64,
    /// Drifted steps.
    pub drift: u64,
    /// Timed-out executions.
    pub timeout: u64,
    /// Replay verification mismatches.
    pub replay_mismatch: u64,
}

impl NodeReputation {
    /// Fresh reputation for `node_id` with the given circuit recovery delay.
    #[must_use]
    pub fn new(node_id: impl Into<String>, recovery: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            drift: AtomicU64::new(0),
            timeout: AtomicU64::new(0),
            replay_mismatch: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            latency_ema: AtomicU64::new(0),
            latency_var_ema: AtomicU64::new(0),
            throughput_ema: AtomicU64::new(0),
            latency_samples: (0..LATENCY_WINDOW).map(|_| AtomicU64::new(EMPTY_SLOT)).collect(),
            latency_sample_idx: AtomicU64::new(0),
            accuracy: AtomicU32::new(f64_to_scalar(0.5)),
            consistency: AtomicU32::new(f64_to_scalar(0.95)),
            availability: AtomicU32::new(f64_to_scalar(1.0)),
            composite_cache: AtomicU32::new(u32::MAX),
            circuit: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                opened_at: None,
                window_success: 0,
                window_failure: 0,
            }),
            recovery,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// The node this reputation tracks.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // -- recording --------------------------------------------------------

    /// Record a successful execution. `verified` successes pull accuracy
    /// toward 1.0; unverified ones pull it toward 0.5.
    pub fn record_success(&self, latency_ms: f64, verified: bool) {
        if self.circuit_state() == CircuitState::Open {
            return;
        }
        self.success.fetch_add(1, Relaxed);
        self.observe_latency(latency_ms);
        self.update_scalar(&self.accuracy, if verified { 1.0 } else { 0.5 }, QUALITY_ALPHA);
        self.update_scalar(&self.availability, 1.0, QUALITY_ALPHA);
        self.circuit_on_success();
        self.after_execution();
    }

    /// Record a failed execution.
    pub fn record_failure(&self, latency_ms: f64) {
        // Failures while open are no-ops: the node is already fast-failing
        // and the reopen counters must stay frozen.
        if self.circuit_state() == CircuitState::Open {
            return;
        }
        self.failure.fetch_add(1, Relaxed);
        self.observe_latency(latency_ms);
        self.circuit_on_failure();
        self.after_execution();
    }

    /// Record a timeout: counts as a failure and floors availability.
    pub fn record_timeout(&self) {
        if self.circuit_state() == CircuitState::Open {
            return;
        }
        self.timeout.fetch_add(1, Relaxed);
        self.failure.fetch_add(1, Relaxed);
        self.availability.store(f64_to_scalar(0.0), SeqCst);
        self.mark_dirty();
        self.circuit_on_failure();
        self.after_execution();
    }

    /// Record a drifted step.
    pub fn record_drift(&self) {
        self.drift.fetch_add(1, Relaxed);
        self.mark_dirty();
    }

    /// Record a replay verification mismatch.
    pub fn record_replay_mismatch(&self) {
        self.replay_mismatch.fetch_add(1, Relaxed);
        self.mark_dirty();
    }

    fn observe_latency(&self, latency_ms: f64) {
        let sample = latency_ms.max(0.0);
        let slot =
            (self.latency_sample_idx.fetch_add(1, Relaxed) as usize) % LATENCY_WINDOW;
        self.latency_samples[slot].store((sample * 1_000.0) as u64, Relaxed);
        let _ = self.latency_ema.fetch_update(SeqCst, SeqCst, |old| {
            let old_f = old as f64 / 1_000.0;
            let new_f = if old == 0 {
                sample
            } else {
                old_f * (1.0 - LATENCY_ALPHA) + sample * LATENCY_ALPHA
            };
            Some((new_f * 1_000.0) as u64)
        });
        let mean = self.latency_ema.load(SeqCst) as f64 / 1_000.0;
        let deviation = sample - mean;
        let _ = self.latency_var_ema.fetch_update(SeqCst, SeqCst, |old| {
            let old_f = old as f64 / 1_000.0;
            let new_f = old_f * (1.0 - LATENCY_ALPHA) + deviation * deviation * LATENCY_ALPHA;
            Some((new_f * 1_000.0) as u64)
        });
        if sample > 0.0 {
            let ops_per_sec = 1_000.0 / sample;
            let _ = self.throughput_ema.fetch_update(SeqCst, SeqCst, |old| {
                let old_f = old as f64 / SCALAR_SCALE;
                let new_f = if old == 0 {
                    ops_per_sec
                } else {
                    old_f * (1.0 - LATENCY_ALPHA) + ops_per_sec * LATENCY_ALPHA
                };
                Some((new_f * SCALAR_SCALE) as u64)
            });
        }

        // Consistency follows the latency spread: tight < 100 ms, loose
        // < 500 ms, anything beyond is erratic.
        let stddev = (self.latency_var_ema.load(SeqCst) as f64 / 1_000.0).sqrt();
        let consistency = if stddev < 100.0 {
            0.95
        } else if stddev < 500.0 {
            0.7
        } else {
            0.4
        };
        self.consistency.store(f64_to_scalar(consistency), SeqCst);
        self.mark_dirty();
    }

    fn update_scalar(&self, scalar: &AtomicU32, target: f64, alpha: f64) {
        let _ = scalar.fetch_update(SeqCst, SeqCst, |old| {
            let old_f = scalar_to_f64(old);
            Some(f64_to_scalar(old_f * (1.0 - alpha) + target * alpha))
        });
        self.mark_dirty();
    }

    fn after_execution(&self) {
        let n = self.executions.fetch_add(1, Relaxed) + 1;
        if n % HISTORY_EVERY == 0 {
            let snapshot = ReputationSnapshot {
                ts: Utc::now(),
                success_rate: self.success_rate(),
                latency_p50: self.latency_p50_ms(),
                composite: self.composite(),
            };
            let mut history = self.history.lock().expect("history ring poisoned");
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(snapshot);
        }
    }

    // -- circuit ----------------------------------------------------------

    /// Current circuit state, applying the timed open → half-open
    /// transition lazily.
    pub fn circuit_state(&self) -> CircuitState {
        let mut circuit = self.circuit.lock().expect("circuit poisoned");
        if circuit.state == CircuitState::Open
            && let Some(opened_at) = circuit.opened_at
            && opened_at.elapsed() >= self.recovery
        {
            debug!(node = %self.node_id, "circuit recovery elapsed, probing");
            circuit.state = CircuitState::HalfOpen;
            circuit.opened_at = None;
            circuit.window_success = 0;
            circuit.window_failure = 0;
        }
        circuit.state
    }

    fn circuit_on_success(&self) {
        let mut circuit = self.circuit.lock().expect("circuit poisoned");
        if circuit.state == CircuitState::HalfOpen {
            circuit.window_success += 1;
            self.settle_half_open(&mut circuit);
        }
    }

    fn circuit_on_failure(&self) {
        let mut circuit = self.circuit.lock().expect("circuit poisoned");
        match circuit.state {
            CircuitState::Closed => {
                let success = self.success.load(Relaxed);
                let failure = self.failure.load(Relaxed);
                let total = success + failure;
                if total >= OPEN_MIN_TOTAL
                    && failure as f64 / total as f64 > OPEN_FAILURE_RATE
                {
                    warn!(node = %self.node_id, failure, total, "circuit opened");
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                circuit.window_failure += 1;
                self.settle_half_open(&mut circuit);
            }
            CircuitState::Open => {}
        }
    }

    fn settle_half_open(&self, circuit: &mut CircuitInner) {
        let total = circuit.window_success + circuit.window_failure;
        if total < HALF_OPEN_MIN_TOTAL {
            return;
        }
        let rate = circuit.window_success as f64 / total as f64;
        if rate > HALF_OPEN_SUCCESS_RATE {
            debug!(node = %self.node_id, "circuit closed after successful probes");
            circuit.state = CircuitState::Closed;
            circuit.opened_at = None;
            circuit.window_success = 0;
            circuit.window_failure = 0;
            // Closing resets the outcome counters the breaker feeds on.
            self.success.store(0, SeqCst);
            self.failure.store(0, SeqCst);
            self.mark_dirty();
        } else {
            warn!(node = %self.node_id, rate, "probe window failed, reopening");
            circuit.state = CircuitState::Open;
            circuit.opened_at = Some(Instant::now());
            circuit.window_success = 0;
            circuit.window_failure = 0;
        }
    }

    /// Force the circuit open with no timed recovery (quarantine).
    pub fn quarantine(&self) {
        let mut circuit = self.circuit.lock().expect("circuit poisoned");
        circuit.state = CircuitState::Open;
        circuit.opened_at = None;
        warn!(node = %self.node_id, "node quarantined");
    }

    /// Force the circuit into half-open probing (administrative restore).
    pub fn restore(&self) {
        let mut circuit = self.circuit.lock().expect("circuit poisoned");
        circuit.state = CircuitState::HalfOpen;
        circuit.opened_at = None;
        circuit.window_success = 0;
        circuit.window_failure = 0;
    }

    // -- reads ------------------------------------------------------------

    /// Success rate over the current counter window; optimistic (1.0) when
    /// no outcomes have been recorded yet.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let success = self.success.load(Relaxed);
        let failure = self.failure.load(Relaxed);
        let total = success + failure;
        if total == 0 {
            1.0
        } else {
            success as f64 / total as f64
        }
    }

    /// Latency EMA in milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> f64 {
        self.latency_ema.load(SeqCst) as f64 / 1_000.0
    }

    /// Median latency over the recent sample window, in milliseconds.
    /// 0.0 until the first sample lands.
    #[must_use]
    pub fn latency_p50_ms(&self) -> f64 {
        let mut samples: Vec<f64> = self
            .latency_samples
            .iter()
            .map(|slot| slot.load(Relaxed))
            .filter(|&raw| raw != EMPTY_SLOT)
            .map(|raw| raw as f64 / 1_000.0)
            .collect();
        samples.sort_by(f64::total_cmp);
        percentile(&samples, 50.0)
    }

    /// Throughput EMA in operations per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        self.throughput_ema.load(SeqCst) as f64 / SCALAR_SCALE
    }

    /// Accuracy scalar in [0, 1].
    #[must_use]
    pub fn accuracy(&self) -> f64 {
        scalar_to_f64(self.accuracy.load(SeqCst))
    }

    /// Consistency scalar in [0, 1].
    #[must_use]
    pub fn consistency(&self) -> f64 {
        scalar_to_f64(self.consistency.load(SeqCst))
    }

    /// Availability scalar in [0, 1].
    #[must_use]
    pub fn availability(&self) -> f64 {
        scalar_to_f64(self.availability.load(SeqCst))
    }

    /// Raw outcome counters.
    #[must_use]
    pub fn counters(&self) -> OutcomeCounters {
        OutcomeCounters {
            success: self.success.load(Relaxed),
            failure: self.failure.load(Relaxed),
            drift: self.drift.load(Relaxed),
            timeout: self.timeout.load(Relaxed),
            replay_mismatch: self.replay_mismatch.load(Relaxed),
        }
    }

    fn mark_dirty(&self) {
        self.composite_cache.store(u32::MAX, SeqCst);
    }

    /// Composite quality score, lazily cached:
    /// `0.35·accuracy + 0.25·availability + 0.20·consistency +
    /// 0.20·success_rate`, clamped to [0, 1].
    #[must_use]
    pub fn composite(&self) -> f64 {
        let cached = self.composite_cache.load(SeqCst);
        if cached != u32::MAX {
            return scalar_to_f64(cached);
        }
        let composite = (0.35 * self.accuracy()
            + 0.25 * self.availability()
            + 0.20 * self.consistency()
            + 0.20 * self.success_rate())
        .clamp(0.0, 1.0);
        self.composite_cache.store(f64_to_scalar(composite), SeqCst);
        composite
    }

    /// The bounded snapshot history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ReputationSnapshot> {
        self.history
            .lock()
            .expect("history ring poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
