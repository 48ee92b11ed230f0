// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable-ordered dispatch decisions for leased jobs.
//!
//! [`decide`] is a pure function: given the same job list and caps it
//! returns the identical decision list, in the same order, with the same
//! reasons. Counters live only for the decision batch; durable state is
//! never touched here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_core::Job;
use serde::Serialize;
use std::collections::HashMap;

/// Concurrency caps applied during one decision batch. Zero disables a cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerLimits {
    /// Maximum jobs dispatched per session in one batch.
    pub per_session_budget: usize,
    /// Maximum jobs dispatched per node in one batch.
    pub per_node_capacity: usize,
}

/// Why a job was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// The job's session already used its budget for this batch.
    SessionBudget,
    /// The job's node already used its capacity for this batch.
    NodeCapacity,
}

/// The scheduler's verdict for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "reason")]
pub enum Action {
    /// Dispatch the job now.
    Run,
    /// Hold the job for a later batch.
    Defer(DeferReason),
}

/// One decision, in dispatch order.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    /// The job decided on.
    pub job_id: String,
    /// The verdict.
    pub action: Action,
}

/// Decide the dispatch order and caps for a batch of jobs.
///
/// Jobs are considered in (priority, tenant, session, id) ascending order;
/// the decision list comes back in that same order.
#[must_use]
pub fn decide(jobs: &[Job], limits: SchedulerLimits) -> Vec<Decision> {
    let mut ordered: Vec<&Job> = jobs.iter().collect();
    ordered.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.tenant_id.cmp(&b.tenant_id))
            .then_with(|| a.session_id.cmp(&b.session_id))
            .then_with(|| a.job_id.cmp(&b.job_id))
    });

    let mut session_counts: HashMap<&str, usize> = HashMap::new();
    let mut node_counts: HashMap<&str, usize> = HashMap::new();
    let mut decisions = Vec::with_capacity(ordered.len());

    for job in ordered {
        let action = decide_one(job, limits, &mut session_counts, &mut node_counts);
        decisions.push(Decision {
            job_id: job.job_id.clone(),
            action,
        });
    }
    decisions
}

fn decide_one<'a>(
    job: &'a Job,
    limits: SchedulerLimits,
    session_counts: &mut HashMap<&'a str, usize>,
    node_counts: &mut HashMap<&'a str, usize>,
) -> Action {
    if limits.per_session_budget > 0
        && let Some(session) = job.session_id.as_deref()
    {
        let used = session_counts.entry(session).or_insert(0);
        if *used >= limits.per_session_budget {
            return Action::Defer(DeferReason::SessionBudget);
        }
    }

    if limits.per_node_capacity > 0
        && let Some(node) = job.node_id.as_deref()
    {
        let used = node_counts.entry(node).or_insert(0);
        if *used >= limits.per_node_capacity {
            return Action::Defer(DeferReason::NodeCapacity);
        }
    }

    if let Some(session) = job.session_id.as_deref() {
        *session_counts.entry(session).or_insert(0) += 1;
    }
    if let Some(node) = job.node_id.as_deref() {
        *node_counts.entry(node).or_insert(0) += 1;
    }
    Action::Run
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::JobStatus;
    use chrono::{TimeZone, Utc};

    fn job(id: &str, priority: i64, session: Option<&str>, node: Option<&str>) -> Job {
        Job {
            job_id: id.into(),
            tenant_id: "t1".into(),
            run_id: "run-1".into(),
            session_id: session.map(Into::into),
            node_id: node.map(Into::into),
            job_type: "tool_call".into(),
            payload: serde_json::json!({}),
            idempotency_key: id.into(),
            priority,
            attempts: 0,
            max_attempts: 5,
            status: JobStatus::Leased,
            next_run_at: Utc.timestamp_opt(0, 0).unwrap(),
            lease_token: None,
            leased_until: None,
            last_error: None,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn orders_by_priority_then_id() {
        let jobs = vec![
            job("job-c", 50, None, None),
            job("job-a", 10, None, None),
            job("job-b", 50, None, None),
        ];
        let decisions = decide(&jobs, SchedulerLimits::default());
        let ids: Vec<&str> = decisions.iter().map(|d| d.job_id.as_str()).collect();
        assert_eq!(ids, ["job-a", "job-b", "job-c"]);
        assert!(decisions.iter().all(|d| d.action == Action::Run));
    }

    #[test]
    fn session_budget_defers_overflow() {
        let jobs = vec![
            job("job-1", 10, Some("sess"), None),
            job("job-2", 20, Some("sess"), None),
            job("job-3", 30, Some("sess"), None),
            job("job-4", 40, Some("other"), None),
        ];
        let decisions = decide(
            &jobs,
            SchedulerLimits {
                per_session_budget: 2,
                per_node_capacity: 0,
            },
        );
        assert_eq!(decisions[0].action, Action::Run);
        assert_eq!(decisions[1].action, Action::Run);
        assert_eq!(decisions[2].action, Action::Defer(DeferReason::SessionBudget));
        assert_eq!(decisions[3].action, Action::Run);
    }

    #[test]
    fn node_capacity_defers_overflow() {
        let jobs = vec![
            job("job-1", 10, None, Some("node-a")),
            job("job-2", 20, None, Some("node-a")),
            job("job-3", 30, None, Some("node-b")),
        ];
        let decisions = decide(
            &jobs,
            SchedulerLimits {
                per_session_budget: 0,
                per_node_capacity: 1,
            },
        );
        assert_eq!(decisions[0].action, Action::Run);
        assert_eq!(decisions[1].action, Action::Defer(DeferReason::NodeCapacity));
        assert_eq!(decisions[2].action, Action::Run);
    }

    #[test]
    fn session_cap_checked_before_node_cap() {
        let jobs = vec![
            job("job-1", 10, Some("sess"), Some("node-a")),
            job("job-2", 20, Some("sess"), Some("node-a")),
        ];
        let decisions = decide(
            &jobs,
            SchedulerLimits {
                per_session_budget: 1,
                per_node_capacity: 1,
            },
        );
        // Both caps are blown for job-2; the session reason wins.
        assert_eq!(decisions[1].action, Action::Defer(DeferReason::SessionBudget));
    }

    #[test]
    fn zero_caps_disable_limits() {
        let jobs: Vec<Job> = (0..10)
            .map(|i| job(&format!("job-{i}"), 10, Some("sess"), Some("node")))
            .collect();
        let decisions = decide(&jobs, SchedulerLimits::default());
        assert!(decisions.iter().all(|d| d.action == Action::Run));
    }

    #[test]
    fn jobs_without_scopes_are_never_deferred() {
        let jobs = vec![job("job-1", 10, None, None), job("job-2", 20, None, None)];
        let decisions = decide(
            &jobs,
            SchedulerLimits {
                per_session_budget: 1,
                per_node_capacity: 1,
            },
        );
        assert!(decisions.iter().all(|d| d.action == Action::Run));
    }

    #[test]
    fn decide_is_deterministic() {
        let jobs = vec![
            job("job-b", 10, Some("s1"), Some("n1")),
            job("job-a", 10, Some("s1"), Some("n2")),
            job("job-c", 5, Some("s2"), Some("n1")),
        ];
        let limits = SchedulerLimits {
            per_session_budget: 1,
            per_node_capacity: 1,
        };
        let first = decide(&jobs, limits);
        let second = decide(&jobs, limits);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.job_id, b.job_id);
            assert_eq!(a.action, b.action);
        }
    }
}
