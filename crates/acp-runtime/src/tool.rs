// SPDX-License-Identifier: MIT OR Apache-2.0
//! The tool-client seam.
//!
//! Tool execution is an external collaborator: the run loop only needs
//! `call(ctx, run_id, tool, inputs)` returning a result plus token usage,
//! or a classified error. Errors never affect fingerprints beyond being
//! reflected as `tool.error` events.

use crate::control::RunControl;
use async_trait::async_trait;
use serde_json::Value;

/// Per-call context handed to the tool client.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Execution control for the run; tool clients should race
    /// [`RunControl::stopped`] against their own work.
    pub control: RunControl,
    /// Node executing the call, when delegated.
    pub node_id: Option<String>,
}

impl CallContext {
    /// Local (non-delegated) context for a run.
    #[must_use]
    pub fn for_run(run_id: &str) -> Self {
        Self {
            control: RunControl::new(run_id),
            node_id: None,
        }
    }
}

/// Successful tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// The tool's JSON result.
    pub result: Value,
    /// Tokens consumed by the call.
    pub token_usage: u64,
}

/// Classified tool failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// The requested tool does not exist.
    #[error("unknown tool: {tool}")]
    UnknownTool {
        /// The tool that was requested.
        tool: String,
    },

    /// The tool ran and reported an error.
    #[error("tool '{tool}' failed: {message}")]
    Execution {
        /// The failing tool.
        tool: String,
        /// Tool-reported error message.
        message: String,
        /// Tokens consumed before the failure.
        token_usage: u64,
    },

    /// The call did not finish in time.
    #[error("tool '{tool}' timed out")]
    Timeout {
        /// The timed-out tool.
        tool: String,
    },

    /// The call was cancelled.
    #[error("tool '{tool}' cancelled")]
    Cancelled {
        /// The cancelled tool.
        tool: String,
    },
}

impl ToolError {
    /// Tokens consumed despite the failure, if known.
    #[must_use]
    pub fn token_usage(&self) -> u64 {
        match self {
            Self::Execution { token_usage, .. } => *token_usage,
            _ => 0,
        }
    }
}

/// Best-effort tool execution backend.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Invoke `tool` with `inputs` on behalf of `run_id`.
    async fn call(
        &self,
        ctx: &CallContext,
        run_id: &str,
        tool: &str,
        inputs: &Value,
    ) -> Result<ToolOutcome, ToolError>;
}
