// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-run predictive budget control.
//!
//! Every tool call first reserves a pessimistic estimate, then commits the
//! actual cost. The hot path is lock-free: spend and reservations live in
//! atomic counters with fixed-point encodings (10⁴ units per USD for
//! money, 10⁶ for unit-interval scalars). The only locks are the cost
//! registry's reader-writer lock and the per-shard creation lock in
//! [`BudgetRegistry`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Per-tool cost models and the learning registry.
pub mod model;
/// Sliding-window OLS spend projection.
pub mod projection;

pub use model::{CostModel, CostRegistry};
pub use projection::RegressionWindow;

use acp_hash::fnv32a;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Fixed-point money scale: 1 USD = 10,000 units (4-decimal precision).
pub const MONEY_SCALE: u64 = 10_000;

/// Fixed-point scale for unit-interval scalars.
const SCALAR_SCALE: f64 = 1_000_000.0;

/// EMA factor for spend velocity.
const VELOCITY_ALPHA: f64 = 0.3;

/// Alert fires when committed + reserved crosses this fraction of budget.
const ALERT_RATIO: f64 = 0.8;

/// Shard count for the controller registry.
const REGISTRY_SHARDS: usize = 256;

/// Projection horizon for the regression term.
const PROJECTION_HORIZON_MS: i64 = 60_000;

/// Convert USD to fixed-point units.
#[must_use]
pub fn usd_to_fixed(usd: f64) -> u64 {
    (usd.max(0.0) * MONEY_SCALE as f64).round() as u64
}

/// Convert fixed-point units to USD.
#[must_use]
pub fn fixed_to_usd(units: u64) -> f64 {
    units as f64 / MONEY_SCALE as f64
}

/// Callback invoked from a detached task on budget transitions.
pub type BudgetCallback = Arc<dyn Fn() + Send + Sync>;

/// Alert and pause hooks for one controller.
#[derive(Clone, Default)]
pub struct BudgetHooks {
    /// Fired once, when committed + reserved first crosses the alert line.
    pub on_alert: Option<BudgetCallback>,
    /// Fired once, when a reservation is first denied.
    pub on_pause: Option<BudgetCallback>,
}

impl std::fmt::Debug for BudgetHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetHooks")
            .field("on_alert", &self.on_alert.is_some())
            .field("on_pause", &self.on_pause.is_some())
            .finish()
    }
}

/// Invoke a callback off the hot path.
fn fire_detached(cb: BudgetCallback) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { cb() });
    } else {
        cb();
    }
}

// ---------------------------------------------------------------------------
// Allocation and reservation outcome
// ---------------------------------------------------------------------------

/// A granted reservation, settled later by commit or release.
///
/// The reserved amount travels inside the handle, so settling is a pure
/// atomic subtraction with no allocation table to lock.
#[derive(Debug)]
pub struct Allocation {
    /// Unique allocation id (diagnostics and audit).
    pub id: u64,
    amount: u64,
}

impl Allocation {
    /// The reserved amount in USD.
    #[must_use]
    pub fn amount_usd(&self) -> f64 {
        fixed_to_usd(self.amount)
    }
}

/// Outcome of [`BudgetController::predict_and_reserve`].
#[derive(Debug)]
pub struct Reservation {
    /// Whether the reservation was granted.
    pub approved: bool,
    /// The allocation to settle, when approved.
    pub allocation: Option<Allocation>,
    /// Point estimate of the call's cost in USD.
    pub est_cost_usd: f64,
    /// Prediction confidence in [0.1, 1.0].
    pub confidence: f64,
    /// Budget headroom after this reservation, in USD.
    pub remaining_usd: f64,
}

/// Read-only snapshot of a controller for observability.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BudgetSnapshot {
    /// Total budget in USD.
    pub budget_usd: f64,
    /// Committed spend in USD.
    pub spent_usd: f64,
    /// Currently reserved in USD.
    pub reserved_usd: f64,
    /// Headroom in USD.
    pub remaining_usd: f64,
    /// Whether the alert threshold was crossed.
    pub alert_fired: bool,
    /// Whether a reservation has been denied.
    pub pause_triggered: bool,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Per-run budget controller.
///
/// # Examples
///
/// ```
/// use acp_budget::{BudgetController, BudgetHooks, CostRegistry};
/// use std::sync::Arc;
///
/// let registry = Arc::new(CostRegistry::new());
/// let budget = BudgetController::new(1.0, registry, BudgetHooks::default());
/// let reservation = budget.predict_and_reserve("echo", 100);
/// assert!(reservation.approved);
/// let allocation = reservation.allocation.unwrap();
/// budget.commit_spend(allocation, 0.002, "echo");
/// ```
pub struct BudgetController {
    budget: u64,
    alert_threshold: u64,
    spent: AtomicU64,
    reserved: AtomicU64,
    alert_fired: AtomicBool,
    pause_triggered: AtomicBool,
    /// Spend per operation, EMA, fixed-point 10⁻⁶ USD.
    velocity_ema: AtomicU64,
    regression: Mutex<RegressionWindow>,
    next_allocation: AtomicU64,
    registry: Arc<CostRegistry>,
    hooks: BudgetHooks,
}

impl std::fmt::Debug for BudgetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetController")
            .field("budget", &self.budget)
            .field("spent", &self.spent.load(SeqCst))
            .field("reserved", &self.reserved.load(SeqCst))
            .field("pause_triggered", &self.pause_triggered.load(SeqCst))
            .finish()
    }
}

impl BudgetController {
    /// Create a controller with the given budget in USD.
    #[must_use]
    pub fn new(budget_usd: f64, registry: Arc<CostRegistry>, hooks: BudgetHooks) -> Self {
        let budget = usd_to_fixed(budget_usd);
        Self {
            budget,
            alert_threshold: (budget as f64 * ALERT_RATIO) as u64,
            spent: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            alert_fired: AtomicBool::new(false),
            pause_triggered: AtomicBool::new(false),
            velocity_ema: AtomicU64::new(0),
            regression: Mutex::new(RegressionWindow::new()),
            next_allocation: AtomicU64::new(1),
            registry,
            hooks,
        }
    }

    /// Predict the cost of calling `tool` with `estimated_tokens` and
    /// reserve a pessimistic amount (point estimate plus twice the model
    /// variance).
    ///
    /// A denial rolls the reservation back, latches `pause_triggered`, and
    /// fires the pause hook once from a detached task.
    pub fn predict_and_reserve(&self, tool: &str, estimated_tokens: u64) -> Reservation {
        let model = self.registry.model(tool);
        let base_cost = model.estimate(estimated_tokens);
        let reserve_usd = base_cost + 2.0 * model.variance;
        let amount = usd_to_fixed(reserve_usd);

        // A paused run refuses all further reservations (cancellation and
        // exhaustion look identical from here).
        if self.pause_triggered.load(SeqCst) {
            return self.denied(base_cost);
        }

        let prev_reserved = self.reserved.fetch_add(amount, SeqCst);
        let spent = self.spent.load(SeqCst);
        let total = spent + prev_reserved + amount;

        if total > self.budget {
            self.reserved.fetch_sub(amount, SeqCst);
            if self
                .pause_triggered
                .compare_exchange(false, true, SeqCst, SeqCst)
                .is_ok()
            {
                warn!(tool, reserve_usd, "budget exhausted, pausing run");
                if let Some(cb) = self.hooks.on_pause.clone() {
                    fire_detached(cb);
                }
            }
            return self.denied(base_cost);
        }

        if total >= self.alert_threshold
            && self
                .alert_fired
                .compare_exchange(false, true, SeqCst, SeqCst)
                .is_ok()
        {
            debug!(tool, "budget alert threshold crossed");
            if let Some(cb) = self.hooks.on_alert.clone() {
                fire_detached(cb);
            }
        }

        let confidence = if base_cost > 0.0 {
            (1.0 - model.variance / base_cost).clamp(0.1, 1.0)
        } else {
            1.0
        };

        Reservation {
            approved: true,
            allocation: Some(Allocation {
                id: self.next_allocation.fetch_add(1, SeqCst),
                amount,
            }),
            est_cost_usd: base_cost,
            confidence,
            remaining_usd: fixed_to_usd(self.budget.saturating_sub(total)),
        }
    }

    fn denied(&self, est_cost_usd: f64) -> Reservation {
        let committed = self.spent.load(SeqCst) + self.reserved.load(SeqCst);
        Reservation {
            approved: false,
            allocation: None,
            est_cost_usd,
            confidence: 0.0,
            remaining_usd: fixed_to_usd(self.budget.saturating_sub(committed)),
        }
    }

    /// Settle an allocation with the actual cost: clear the reservation,
    /// commit the spend, refresh velocity and regression, and feed the cost
    /// registry.
    pub fn commit_spend(&self, allocation: Allocation, actual_cost_usd: f64, tool: &str) {
        self.release_amount(allocation.amount);
        self.spent.fetch_add(usd_to_fixed(actual_cost_usd), SeqCst);
        self.update_velocity(actual_cost_usd);
        self.regression
            .lock()
            .expect("regression window poisoned")
            .push(chrono::Utc::now().timestamp_millis(), actual_cost_usd);
        self.registry.observe(tool, actual_cost_usd);
    }

    /// Roll back an allocation without committing any spend (cancelled or
    /// failed-before-invoke calls).
    pub fn release(&self, allocation: Allocation) {
        self.release_amount(allocation.amount);
    }

    fn release_amount(&self, amount: u64) {
        let _ = self
            .reserved
            .fetch_update(SeqCst, SeqCst, |cur| Some(cur.saturating_sub(amount)));
    }

    fn update_velocity(&self, sample_usd: f64) {
        let _ = self.velocity_ema.fetch_update(SeqCst, SeqCst, |old| {
            let old_f = old as f64 / SCALAR_SCALE;
            let new_f = old_f * (1.0 - VELOCITY_ALPHA) + sample_usd * VELOCITY_ALPHA;
            Some((new_f * SCALAR_SCALE) as u64)
        });
    }

    /// Spend velocity (USD per operation, EMA).
    #[must_use]
    pub fn velocity_usd(&self) -> f64 {
        self.velocity_ema.load(SeqCst) as f64 / SCALAR_SCALE
    }

    /// Project total spend after `remaining_ops` more operations:
    /// `spent + 0.7·(velocity × ops) + 0.3·regression(now + 60 s)`.
    #[must_use]
    pub fn get_projection(&self, remaining_ops: u64) -> f64 {
        let spent = fixed_to_usd(self.spent.load(SeqCst));
        let velocity_term = self.velocity_usd() * remaining_ops as f64;
        let regression_term = self
            .regression
            .lock()
            .expect("regression window poisoned")
            .predict(chrono::Utc::now().timestamp_millis() + PROJECTION_HORIZON_MS);
        spent + 0.7 * velocity_term + 0.3 * regression_term
    }

    /// Force the paused state (used by cancellation). Sticky.
    pub fn pause(&self) {
        self.pause_triggered.store(true, SeqCst);
    }

    /// `true` once any reservation has been denied.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause_triggered.load(SeqCst)
    }

    /// Observability snapshot.
    #[must_use]
    pub fn snapshot(&self) -> BudgetSnapshot {
        let spent = self.spent.load(SeqCst);
        let reserved = self.reserved.load(SeqCst);
        BudgetSnapshot {
            budget_usd: fixed_to_usd(self.budget),
            spent_usd: fixed_to_usd(spent),
            reserved_usd: fixed_to_usd(reserved),
            remaining_usd: fixed_to_usd(self.budget.saturating_sub(spent + reserved)),
            alert_fired: self.alert_fired.load(SeqCst),
            pause_triggered: self.pause_triggered.load(SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Sharded registry
// ---------------------------------------------------------------------------

/// Sharded map of per-run controllers.
///
/// Creation (`load_or_create`) locks only the run's shard, so budget
/// lookups from parallel runs do not contend on one global lock.
pub struct BudgetRegistry {
    shards: Vec<Mutex<HashMap<String, Arc<BudgetController>>>>,
    costs: Arc<CostRegistry>,
}

impl std::fmt::Debug for BudgetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetRegistry")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl BudgetRegistry {
    /// Create an empty registry sharing one cost registry across runs.
    #[must_use]
    pub fn new(costs: Arc<CostRegistry>) -> Self {
        Self {
            shards: (0..REGISTRY_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            costs,
        }
    }

    fn shard(&self, run_id: &str) -> &Mutex<HashMap<String, Arc<BudgetController>>> {
        let idx = (fnv32a(run_id.as_bytes()) as usize) % REGISTRY_SHARDS;
        &self.shards[idx]
    }

    /// The shared cost registry.
    #[must_use]
    pub fn costs(&self) -> &Arc<CostRegistry> {
        &self.costs
    }

    /// Fetch the run's controller, creating it with `budget_usd` and
    /// `hooks` on first access.
    pub fn load_or_create(
        &self,
        run_id: &str,
        budget_usd: f64,
        hooks: BudgetHooks,
    ) -> Arc<BudgetController> {
        let mut shard = self.shard(run_id).lock().expect("budget shard poisoned");
        Arc::clone(shard.entry(run_id.to_string()).or_insert_with(|| {
            Arc::new(BudgetController::new(
                budget_usd,
                Arc::clone(&self.costs),
                hooks,
            ))
        }))
    }

    /// The run's controller, if one exists.
    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<Arc<BudgetController>> {
        self.shard(run_id)
            .lock()
            .expect("budget shard poisoned")
            .get(run_id)
            .cloned()
    }

    /// Drop the run's controller (run finished).
    pub fn remove(&self, run_id: &str) {
        self.shard(run_id)
            .lock()
            .expect("budget shard poisoned")
            .remove(run_id);
    }

    /// Snapshots of all live controllers, keyed by run id.
    #[must_use]
    pub fn snapshots(&self) -> HashMap<String, BudgetSnapshot> {
        let mut out = HashMap::new();
        for shard in &self.shards {
            let shard = shard.lock().expect("budget shard poisoned");
            for (run_id, controller) in shard.iter() {
                out.insert(run_id.clone(), controller.snapshot());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_model(base: f64, variance: f64) -> CostModel {
        CostModel {
            base,
            per_token: 0.0,
            per_call: 0.0,
            variance,
        }
    }

    fn controller_with(budget: f64, model: CostModel) -> BudgetController {
        let registry = Arc::new(CostRegistry::new());
        registry.set_model("tool", model);
        BudgetController::new(budget, registry, BudgetHooks::default())
    }

    #[test]
    fn reserve_then_commit_tracks_spend() {
        let budget = controller_with(1.0, fixed_model(0.1, 0.0));
        let reservation = budget.predict_and_reserve("tool", 0);
        assert!(reservation.approved);
        assert!((reservation.est_cost_usd - 0.1).abs() < 1e-9);

        budget.commit_spend(reservation.allocation.unwrap(), 0.08, "tool");
        let snap = budget.snapshot();
        assert!((snap.spent_usd - 0.08).abs() < 1e-9);
        assert!(snap.reserved_usd.abs() < 1e-9);
    }

    #[test]
    fn over_budget_reserve_is_denied_and_rolled_back() {
        // S4: budget $1.00, base 0.6, variance 0.3 → reserve 1.2 > 1.0.
        let budget = controller_with(1.0, fixed_model(0.6, 0.3));
        let reservation = budget.predict_and_reserve("tool", 0);

        assert!(!reservation.approved);
        assert!(reservation.allocation.is_none());
        let snap = budget.snapshot();
        assert!(snap.pause_triggered);
        assert!(snap.reserved_usd.abs() < 1e-9, "reservation not rolled back");
        assert!(snap.spent_usd.abs() < 1e-9);
    }

    #[test]
    fn pause_hook_fires_exactly_once() {
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        let registry = Arc::new(CostRegistry::new());
        registry.set_model("tool", fixed_model(0.6, 0.3));
        let budget = BudgetController::new(
            1.0,
            registry,
            BudgetHooks {
                on_alert: None,
                on_pause: Some(Arc::new(move || {
                    fired_clone.fetch_add(1, SeqCst);
                })),
            },
        );

        // No async runtime here, so hooks run inline and deterministically.
        assert!(!budget.predict_and_reserve("tool", 0).approved);
        assert!(!budget.predict_and_reserve("tool", 0).approved);
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[test]
    fn alert_hook_fires_on_first_threshold_crossing() {
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        let registry = Arc::new(CostRegistry::new());
        registry.set_model("tool", fixed_model(0.3, 0.0));
        let budget = BudgetController::new(
            1.0,
            registry,
            BudgetHooks {
                on_alert: Some(Arc::new(move || {
                    fired_clone.fetch_add(1, SeqCst);
                })),
                on_pause: None,
            },
        );

        // 0.3, 0.6 below the 0.8 line; the third reservation crosses it.
        let a = budget.predict_and_reserve("tool", 0);
        let b = budget.predict_and_reserve("tool", 0);
        assert_eq!(fired.load(SeqCst), 0);
        let c = budget.predict_and_reserve("tool", 0);
        assert!(a.approved && b.approved && c.approved);
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[test]
    fn confidence_reflects_variance() {
        let certain = controller_with(10.0, fixed_model(0.1, 0.0));
        assert!((certain.predict_and_reserve("tool", 0).confidence - 1.0).abs() < 1e-9);

        let noisy = controller_with(10.0, fixed_model(0.1, 0.5));
        // 1 - 0.5/0.1 = -4 → clamped to 0.1.
        assert!((noisy.predict_and_reserve("tool", 0).confidence - 0.1).abs() < 1e-9);
    }

    #[test]
    fn release_rolls_back_without_spend() {
        let budget = controller_with(1.0, fixed_model(0.2, 0.0));
        let reservation = budget.predict_and_reserve("tool", 0);
        budget.release(reservation.allocation.unwrap());
        let snap = budget.snapshot();
        assert!(snap.reserved_usd.abs() < 1e-9);
        assert!(snap.spent_usd.abs() < 1e-9);
    }

    #[test]
    fn paused_controller_refuses_everything() {
        let budget = controller_with(100.0, fixed_model(0.01, 0.0));
        budget.pause();
        assert!(!budget.predict_and_reserve("tool", 0).approved);
        assert!(budget.is_paused());
    }

    #[test]
    fn velocity_ema_converges() {
        let budget = controller_with(100.0, fixed_model(0.1, 0.0));
        for _ in 0..40 {
            let r = budget.predict_and_reserve("tool", 0);
            budget.commit_spend(r.allocation.unwrap(), 0.05, "tool");
        }
        assert!((budget.velocity_usd() - 0.05).abs() < 0.001);
    }

    #[test]
    fn projection_combines_velocity_and_regression() {
        let budget = controller_with(100.0, fixed_model(0.1, 0.0));
        for _ in 0..10 {
            let r = budget.predict_and_reserve("tool", 0);
            budget.commit_spend(r.allocation.unwrap(), 0.1, "tool");
        }
        let projection = budget.get_projection(10);
        // Spent 1.0 so far; the velocity term alone adds 0.7 * 0.1 * 10.
        assert!(projection > 1.0, "got {projection}");
    }

    #[test]
    fn budget_safety_under_concurrent_reserves() {
        let registry = Arc::new(CostRegistry::new());
        registry.set_model("tool", fixed_model(0.01, 0.0));
        let budget = Arc::new(BudgetController::new(
            1.0,
            registry,
            BudgetHooks::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let budget = Arc::clone(&budget);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let r = budget.predict_and_reserve("tool", 0);
                    if r.approved {
                        budget.commit_spend(r.allocation.unwrap(), 0.01, "tool");
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Committed spend can never exceed the budget while approvals held.
        let snap = budget.snapshot();
        assert!(
            snap.spent_usd <= snap.budget_usd + 1e-9,
            "overspent: {snap:?}"
        );
    }

    #[test]
    fn registry_load_or_create_is_idempotent() {
        let registry = BudgetRegistry::new(Arc::new(CostRegistry::new()));
        let a = registry.load_or_create("run-1", 1.0, BudgetHooks::default());
        let b = registry.load_or_create("run-1", 99.0, BudgetHooks::default());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("run-2").is_none());

        registry.remove("run-1");
        assert!(registry.get("run-1").is_none());
    }

    #[test]
    fn registry_snapshots_cover_all_shards() {
        let registry = BudgetRegistry::new(Arc::new(CostRegistry::new()));
        for i in 0..50 {
            registry.load_or_create(&format!("run-{i}"), 1.0, BudgetHooks::default());
        }
        assert_eq!(registry.snapshots().len(), 50);
    }
}
