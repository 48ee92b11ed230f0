// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory run execution control.
//!
//! Cancelling a run is a budget decision, not a thread kill. Stopping a
//! [`RunControl`] (a) pauses the run's budget controller so every further
//! reservation is refused, (b) latches the stopped flag the run loop
//! checks before each call, and (c) touches nothing durable: the event
//! and audit streams stay exactly as they were.

use acp_budget::BudgetController;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;
use tracing::info;

/// Why a run was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// An operator or the owning tenant asked for the stop.
    Operator,
    /// The run's deadline expired.
    DeadlineExpired,
    /// The budget controller denied a reservation.
    BudgetExhausted,
    /// A policy evaluation denied continued execution.
    PolicyDenied,
    /// The control plane is shutting down.
    Shutdown,
}

impl StopCause {
    /// Human-readable description, suitable for `last_error` columns.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Operator => "stopped by operator request",
            Self::DeadlineExpired => "stopped because the deadline expired",
            Self::BudgetExhausted => "stopped because the budget was exhausted",
            Self::PolicyDenied => "stopped by policy",
            Self::Shutdown => "stopped because the control plane is shutting down",
        }
    }
}

struct ControlInner {
    run_id: String,
    stopped: AtomicBool,
    /// First cause wins; later stops keep the original.
    cause: Mutex<Option<StopCause>>,
    /// The run's budget controller, bound on first call. Stopping pauses
    /// it so reservations fail even for callers holding no control handle.
    budget: OnceLock<Arc<BudgetController>>,
    notify: Notify,
}

/// Shared in-memory control for one run.
///
/// Cheap to clone; every clone observes the same state. The run loop
/// checks it before each tool call and binds the run's budget controller
/// into it, so [`RunControl::stop`] immediately starves the run of
/// reservations.
///
/// # Examples
///
/// ```
/// use acp_runtime::{RunControl, StopCause};
///
/// let control = RunControl::new("run-000001");
/// assert!(!control.is_stopped());
/// control.stop(StopCause::Operator);
/// assert!(control.is_stopped());
/// assert_eq!(control.cause(), Some(StopCause::Operator));
/// ```
#[derive(Clone)]
pub struct RunControl {
    inner: Arc<ControlInner>,
}

impl RunControl {
    /// Fresh, running control for `run_id`.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                run_id: run_id.into(),
                stopped: AtomicBool::new(false),
                cause: Mutex::new(None),
                budget: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// The run this control belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Bind the run's budget controller. First bind wins; if the control
    /// was already stopped, the controller is paused on the spot so the
    /// stop cannot be outraced by a late bind.
    pub fn bind_budget(&self, controller: &Arc<BudgetController>) {
        let _ = self.inner.budget.set(Arc::clone(controller));
        if self.is_stopped() {
            controller.pause();
        }
    }

    /// Stop the run: pause its budget, latch the flag, wake waiters.
    ///
    /// Idempotent; only the first cause is recorded. Durable state is
    /// never touched from here.
    pub fn stop(&self, cause: StopCause) {
        {
            let mut guard = self.inner.cause.lock().expect("stop cause poisoned");
            if guard.is_none() {
                *guard = Some(cause);
                info!(run_id = %self.inner.run_id, cause = cause.description(), "run stopped");
            }
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(controller) = self.inner.budget.get() {
            controller.pause();
        }
        self.inner.notify.notify_waiters();
    }

    /// `true` once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The first recorded stop cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<StopCause> {
        *self.inner.cause.lock().expect("stop cause poisoned")
    }

    /// Resolves when the run is stopped; immediately if it already is.
    ///
    /// Tool clients race this against their own work to honor
    /// cancellation mid-call.
    pub async fn stopped(&self) {
        if self.is_stopped() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_stopped() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("run_id", &self.inner.run_id)
            .field("stopped", &self.is_stopped())
            .field("cause", &self.cause())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_budget::{BudgetHooks, CostRegistry};

    fn controller() -> Arc<BudgetController> {
        Arc::new(BudgetController::new(
            1.0,
            Arc::new(CostRegistry::new()),
            BudgetHooks::default(),
        ))
    }

    #[test]
    fn fresh_control_is_running() {
        let control = RunControl::new("run-1");
        assert!(!control.is_stopped());
        assert!(control.cause().is_none());
        assert_eq!(control.run_id(), "run-1");
    }

    #[test]
    fn clones_observe_the_same_stop() {
        let a = RunControl::new("run-1");
        let b = a.clone();
        a.stop(StopCause::Shutdown);
        assert!(b.is_stopped());
        assert_eq!(b.cause(), Some(StopCause::Shutdown));
    }

    #[test]
    fn first_cause_wins() {
        let control = RunControl::new("run-1");
        control.stop(StopCause::BudgetExhausted);
        control.stop(StopCause::Operator);
        assert_eq!(control.cause(), Some(StopCause::BudgetExhausted));
    }

    #[test]
    fn stop_pauses_a_bound_budget() {
        let control = RunControl::new("run-1");
        let budget = controller();
        control.bind_budget(&budget);
        assert!(!budget.is_paused());

        control.stop(StopCause::Operator);
        assert!(budget.is_paused());
        assert!(!budget.predict_and_reserve("echo", 0).approved);
    }

    #[test]
    fn late_bind_after_stop_still_pauses() {
        let control = RunControl::new("run-1");
        control.stop(StopCause::DeadlineExpired);

        let budget = controller();
        control.bind_budget(&budget);
        assert!(budget.is_paused());
    }

    #[test]
    fn first_bind_wins() {
        let control = RunControl::new("run-1");
        let first = controller();
        let second = controller();
        control.bind_budget(&first);
        control.bind_budget(&second);

        control.stop(StopCause::Operator);
        assert!(first.is_paused());
        // The second controller was never adopted.
        assert!(!second.is_paused());
    }

    #[tokio::test]
    async fn stopped_future_resolves() {
        let control = RunControl::new("run-1");
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });
        control.stop(StopCause::Operator);
        handle.await.unwrap();

        // Already-stopped controls resolve immediately.
        control.stopped().await;
    }

    #[test]
    fn all_causes_have_descriptions() {
        let causes = [
            StopCause::Operator,
            StopCause::DeadlineExpired,
            StopCause::BudgetExhausted,
            StopCause::PolicyDenied,
            StopCause::Shutdown,
        ];
        for cause in &causes {
            assert!(!cause.description().is_empty(), "{cause:?} has empty description");
        }
    }

    #[test]
    fn serde_roundtrip_for_stop_cause() {
        let json = serde_json::to_string(&StopCause::BudgetExhausted).unwrap();
        assert_eq!(json, r#""budget_exhausted""#);
        let back: StopCause = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StopCause::BudgetExhausted);
    }
}
