// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! One tool call is one state transition: reserve budget, invoke the tool,
//! publish exactly one of `tool.result` / `tool.error`, commit the actual
//! spend, and drift-check deterministic runs. Long-running concerns
//! (recovery timers, alert hooks) run as detached tasks, never inline.

/// In-memory run execution control.
pub mod control;
/// The tool-client seam.
pub mod tool;

pub use control::{RunControl, StopCause};
pub use tool::{CallContext, ToolClient, ToolError, ToolOutcome};

use acp_budget::BudgetRegistry;
use acp_core::events;
use acp_drift::DriftDetector;
use acp_hash::{DigestAuthority, HashError, entropy_check};
use acp_reputation::ReputationEngine;
use acp_runstore::{RunStore, RunStoreError};
use acp_store::StoreError;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the run loop.
#[derive(Debug, thiserror::Error)]
pub enum RunLoopError {
    /// The budget controller refused the reservation; the run is paused.
    #[error("budget exceeded for run {run_id} (tool {tool})")]
    BudgetExceeded {
        /// The paused run.
        run_id: String,
        /// Tool whose reservation was denied.
        tool: String,
    },

    /// The call was cancelled before the tool was invoked.
    #[error("run {run_id} cancelled")]
    Cancelled {
        /// The cancelled run.
        run_id: String,
    },

    /// The tool failed; a `tool.error` event was published.
    #[error("tool call failed")]
    ToolFailed(#[source] ToolError),

    /// Run store failure (payload validation, tenancy, persistence).
    #[error("run store failure")]
    RunStore(#[from] RunStoreError),

    /// Direct store failure (audit, hardening).
    #[error("store failure")]
    Store(#[from] StoreError),

    /// A digest input violated the entropy boundary.
    #[error("entropy violation")]
    Entropy(#[from] HashError),
}

impl RunLoopError {
    /// Map onto the stable error taxonomy.
    pub fn error_code(&self) -> acp_error::ErrorCode {
        match self {
            Self::BudgetExceeded { .. } => acp_error::ErrorCode::BudgetExceeded,
            Self::Cancelled { .. } => acp_error::ErrorCode::Cancelled,
            Self::ToolFailed(ToolError::Timeout { .. }) => acp_error::ErrorCode::Timeout,
            Self::ToolFailed(ToolError::Cancelled { .. }) => acp_error::ErrorCode::Cancelled,
            Self::ToolFailed(_) => acp_error::ErrorCode::Internal,
            Self::RunStore(e) => e.error_code(),
            Self::Store(_) => acp_error::ErrorCode::Internal,
            Self::Entropy(_) => acp_error::ErrorCode::EntropyViolation,
        }
    }
}

// ---------------------------------------------------------------------------
// Call plumbing
// ---------------------------------------------------------------------------

/// One planned tool invocation.
#[derive(Debug, Clone)]
pub struct CallSpec {
    /// Tool to invoke.
    pub tool: String,
    /// Arguments passed through to the tool.
    pub arguments: Value,
    /// Token estimate fed to the budget predictor.
    pub estimated_tokens: u64,
    /// Step index within the run's pack (drift key).
    pub step: u32,
}

/// A completed tool call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Row id of the published `tool.result` event.
    pub event_id: i64,
    /// The tool's result.
    pub result: Value,
    /// Committed cost in USD.
    pub actual_cost_usd: f64,
    /// Whether the step drifted from its golden path.
    pub drifted: bool,
}

/// Why [`RunLoop::execute_run`] stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A reservation was denied.
    BudgetExceeded,
    /// The run's control was stopped.
    Cancelled,
}

/// Summary of a driven run.
#[derive(Debug)]
pub struct RunReport {
    /// Successfully completed calls, in order.
    pub completed: Vec<CallOutcome>,
    /// Number of calls that failed with `tool.error`.
    pub failed_calls: u32,
    /// Early-stop reason, if the run did not drain its call list.
    pub stopped: Option<StopReason>,
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

/// Drives runs through tool invocations.
pub struct RunLoop {
    runstore: Arc<RunStore>,
    budgets: Arc<BudgetRegistry>,
    drift: Arc<DriftDetector>,
    reputation: Arc<ReputationEngine>,
    authority: DigestAuthority,
    tools: Arc<dyn ToolClient>,
}

impl RunLoop {
    /// Assemble a run loop over its collaborators.
    #[must_use]
    pub fn new(
        runstore: Arc<RunStore>,
        budgets: Arc<BudgetRegistry>,
        drift: Arc<DriftDetector>,
        reputation: Arc<ReputationEngine>,
        authority: DigestAuthority,
        tools: Arc<dyn ToolClient>,
    ) -> Self {
        Self {
            runstore,
            budgets,
            drift,
            reputation,
            authority,
            tools,
        }
    }

    /// The timestamp stamped into event payloads: epoch 0 for
    /// deterministic runs, UTC now otherwise. Fixed per run.
    fn payload_timestamp(deterministic: bool) -> Value {
        if deterministic {
            json!(0)
        } else {
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        }
    }

    /// Execute one tool call for `run_id` per the run-loop contract.
    ///
    /// # Errors
    ///
    /// - [`RunLoopError::BudgetExceeded`] after a denied reservation (a
    ///   `budget.denied` audit entry is recorded first).
    /// - [`RunLoopError::Cancelled`] when the run's control is stopped.
    /// - [`RunLoopError::ToolFailed`] after publishing `tool.error`.
    pub async fn execute_call(
        &self,
        tenant_id: &str,
        run_id: &str,
        spec: &CallSpec,
        ctx: &CallContext,
    ) -> Result<CallOutcome, RunLoopError> {
        let run = self.runstore.get_run(tenant_id, run_id)?;

        // 1. Resolve the run's budget controller and bind it into the
        // control handle, so a stop from any clone starves the run of
        // reservations from here on.
        let controller =
            self.budgets
                .load_or_create(run_id, run.budget_usd, acp_budget::BudgetHooks::default());
        ctx.control.bind_budget(&controller);

        if ctx.control.is_stopped() {
            return Err(RunLoopError::Cancelled {
                run_id: run_id.into(),
            });
        }

        // 2. Reserve.
        let reservation = controller.predict_and_reserve(&spec.tool, spec.estimated_tokens);
        if !reservation.approved {
            self.runstore.store().append_audit(
                tenant_id,
                run_id,
                events::BUDGET_DENIED,
                &json!({
                    "est_cost_usd": reservation.est_cost_usd,
                    "remaining_usd": reservation.remaining_usd,
                    "run_id": run_id,
                    "tool": spec.tool,
                }),
            )?;
            warn!(run_id, tool = %spec.tool, "reservation denied, call refused");
            return Err(RunLoopError::BudgetExceeded {
                run_id: run_id.into(),
                tool: spec.tool.clone(),
            });
        }
        let allocation = reservation
            .allocation
            .expect("approved reservation always carries an allocation");

        // 3. Invoke the tool.
        let started = Instant::now();
        let invoked = self
            .tools
            .call(ctx, run_id, &spec.tool, &spec.arguments)
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        match invoked {
            Err(error) => {
                let actual_cost = self
                    .budgets
                    .costs()
                    .model(&spec.tool)
                    .estimate(error.token_usage());

                if let Some(node_id) = ctx.node_id.as_deref() {
                    match &error {
                        ToolError::Timeout { .. } => self.reputation.record_timeout(node_id),
                        _ => self.reputation.record_failure(node_id, latency_ms),
                    }
                }

                // 4. Publish the error event; the log reflects the failure,
                // the fingerprint is otherwise unaffected.
                let payload = json!({
                    "arguments": spec.arguments,
                    "error": error.to_string(),
                    "run_id": run_id,
                    "tool": spec.tool,
                    "ts": Self::payload_timestamp(run.deterministic),
                });
                self.runstore
                    .publish_event(tenant_id, run_id, events::TOOL_ERROR, payload)?;

                // 5. Settle the reservation with whatever the failure cost.
                controller.commit_spend(allocation, actual_cost, &spec.tool);
                Err(RunLoopError::ToolFailed(error))
            }
            Ok(outcome) => {
                let actual_cost = self
                    .budgets
                    .costs()
                    .model(&spec.tool)
                    .estimate(outcome.token_usage);

                // 4. Compose and publish the result event.
                let payload = json!({
                    "arguments": spec.arguments,
                    "result": outcome.result,
                    "run_id": run_id,
                    "tool": spec.tool,
                    "ts": Self::payload_timestamp(run.deterministic),
                });
                if run.deterministic {
                    // Deterministic payloads feed the fingerprint; reject
                    // entropy now rather than at finalization.
                    entropy_check(&payload, "$")?;
                }
                let event_id =
                    self.runstore
                        .publish_event(tenant_id, run_id, events::TOOL_RESULT, payload)?;

                // 5. Commit actual spend.
                controller.commit_spend(allocation, actual_cost, &spec.tool);

                if let Some(node_id) = ctx.node_id.as_deref() {
                    self.reputation
                        .record_success(node_id, latency_ms, run.deterministic);
                }

                // 6. Drift-check deterministic runs.
                let mut drifted = false;
                if run.deterministic {
                    let result_hash = self.authority.hash(&outcome.result)?;
                    let pack_id = run
                        .pack_cid
                        .clone()
                        .unwrap_or_else(|| format!("run:{run_id}"));
                    let check = self
                        .drift
                        .check_drift(run_id, &pack_id, spec.step, &result_hash);
                    drifted = check.drifted;
                    if drifted {
                        if let Some(node_id) = ctx.node_id.as_deref() {
                            self.reputation.record_drift(node_id);
                        }
                        if self.drift.exceeds_threshold(run_id) {
                            self.runstore.store().set_run_hardened(run_id)?;
                            self.runstore.store().append_audit(
                                tenant_id,
                                run_id,
                                events::DRIFT_ALERT,
                                &json!({
                                    "drift_score": self.drift.drift_score(run_id),
                                    "run_id": run_id,
                                    "step": spec.step,
                                }),
                            )?;
                            info!(run_id, step = spec.step, "run hardened after drift");
                        }
                    }
                }

                debug!(
                    run_id,
                    tool = %spec.tool,
                    event_id,
                    cost_usd = actual_cost,
                    "tool call completed"
                );
                Ok(CallOutcome {
                    event_id,
                    result: outcome.result,
                    actual_cost_usd: actual_cost,
                    drifted,
                })
            }
        }
    }

    /// Drive a run through a list of calls.
    ///
    /// Tool failures are recorded and the run continues; a denied budget
    /// or a cancellation stops it. Durable state (events, audit) survives
    /// either stop.
    ///
    /// # Errors
    ///
    /// Returns [`RunLoopError`] only for infrastructure failures; business
    /// stops are reported in the [`RunReport`].
    pub async fn execute_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        calls: &[CallSpec],
        ctx: &CallContext,
    ) -> Result<RunReport, RunLoopError> {
        self.runstore.start_run(run_id)?;
        let mut report = RunReport {
            completed: Vec::new(),
            failed_calls: 0,
            stopped: None,
        };

        for spec in calls {
            match self.execute_call(tenant_id, run_id, spec, ctx).await {
                Ok(outcome) => report.completed.push(outcome),
                Err(RunLoopError::ToolFailed(_)) => report.failed_calls += 1,
                Err(RunLoopError::BudgetExceeded { .. }) => {
                    report.stopped = Some(StopReason::BudgetExceeded);
                    break;
                }
                Err(RunLoopError::Cancelled { .. }) => {
                    report.stopped = Some(StopReason::Cancelled);
                    break;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(report)
    }

    /// Finalize a run: fingerprint its event log exactly once.
    ///
    /// # Errors
    ///
    /// Propagates run-store failures, including double finalization.
    pub fn finalize(&self, tenant_id: &str, run_id: &str) -> Result<String, RunLoopError> {
        Ok(self
            .runstore
            .finalize_run(tenant_id, run_id, &self.authority)?)
    }

    /// Cancel a run: refuse all further budget reservations. Durable
    /// state is left intact.
    pub fn cancel_run(&self, run_id: &str) {
        if let Some(controller) = self.budgets.get(run_id) {
            controller.pause();
        }
    }

    /// The digest authority this loop fingerprints with.
    #[must_use]
    pub fn authority(&self) -> &DigestAuthority {
        &self.authority
    }
}
