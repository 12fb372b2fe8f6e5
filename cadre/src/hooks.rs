//! Lifecycle hooks for agent operations.
//!
//! [`AgentHooks`] follows the default-no-op pattern: implementors override
//! only the events they care about. Hooks observe the operation; they do
//! not modify its flow (that is what guardrails are for).
//!
//! Ordering per operation: `on_start`, then for each tool invocation
//! `on_tool_start`/`on_tool_end`, `on_handoff` per delegated sub-agent,
//! and exactly one `on_end` carrying the standardized outcome (output or
//! error, never both).

use async_trait::async_trait;
use serde_json::Value;

use crate::context::OperationContext;
use crate::error::{AgentError, Result};
use crate::usage::Usage;

/// The standardized terminal outcome handed to [`AgentHooks::on_end`].
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    /// The operation (= history entry) id.
    pub operation_id: String,
    /// Final output text on success.
    pub output: Option<String>,
    /// Terminal error on failure.
    pub error: Option<AgentError>,
    /// Accumulated token usage.
    pub usage: Usage,
}

impl OperationOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn success(operation_id: impl Into<String>, output: impl Into<String>, usage: Usage) -> Self {
        Self {
            operation_id: operation_id.into(),
            output: Some(output.into()),
            error: None,
            usage,
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failure(operation_id: impl Into<String>, error: AgentError, usage: Usage) -> Self {
        Self {
            operation_id: operation_id.into(),
            output: None,
            error: Some(error),
            usage,
        }
    }

    /// Returns `true` when the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-agent lifecycle hooks.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    /// Called when an operation begins.
    async fn on_start(&self, _ctx: &OperationContext) {}

    /// Called exactly once when an operation terminates.
    async fn on_end(&self, _ctx: &OperationContext, _outcome: &OperationOutcome) {}

    /// Called before a tool executes.
    async fn on_tool_start(&self, _ctx: &OperationContext, _tool_name: &str, _arguments: &Value) {}

    /// Called after a tool completes, successfully or not.
    async fn on_tool_end(
        &self,
        _ctx: &OperationContext,
        _tool_name: &str,
        _result: &Result<Value>,
    ) {
    }

    /// Called when work is delegated to a sub-agent.
    async fn on_handoff(&self, _ctx: &OperationContext, _from_agent: &str, _to_agent: &str) {}
}

/// Hooks implementation that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAgentHooks;

#[async_trait]
impl AgentHooks for NoopAgentHooks {}
