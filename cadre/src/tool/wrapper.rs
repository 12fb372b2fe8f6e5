//! The call-site tool wrapper.
//!
//! [`wrap_tools`] turns an agent's tools into [`ProviderTool`]s whose
//! execute path records the full tool lifecycle: a `tool:started` event
//! (tracked, so its status can be settled in place), an open tool span on
//! the operation context, the underlying execution, and the matching
//! `tool:completed`/`tool:failed` event and span close. Attaching the span
//! doubles as the at-most-once guard: a second invocation with the same
//! tool call id fails before the tool runs.

use std::sync::Arc;

use serde_json::Value;
use tracing::{Instrument, info_span, warn};
use uuid::Uuid;

use crate::context::OperationContext;
use crate::error::{AgentError, Result};
use crate::events::{BusEvent, EventBus};
use crate::history::{EventKind, HistoryManager, TimelineEvent, TimelineEventUpdate};
use crate::hooks::AgentHooks;
use crate::tool::{ProviderTool, Tool, ToolExecutionOptions};
use crate::trace::{SpanKind, SpanStatus, TraceContext};

/// Tool names reserved for reasoning; they require agent identity and a
/// known history entry in their execution options.
pub const RESERVED_REASONING_TOOLS: [&str; 2] = ["think", "analyze"];

/// Everything a wrapped tool needs to record its lifecycle.
pub struct ToolCallEnvironment {
    /// The operation context (spans, updaters, cancellation).
    pub ctx: Arc<OperationContext>,
    /// The process event bus.
    pub bus: Arc<EventBus>,
    /// The agent's history manager.
    pub history: HistoryManager,
    /// The agent's hooks.
    pub hooks: Arc<dyn AgentHooks>,
    /// Span factory for tool spans.
    pub trace: Arc<dyn TraceContext>,
    /// Id of the agent running the operation.
    pub agent_id: String,
    /// Display name of the agent.
    pub agent_name: String,
}

impl std::fmt::Debug for ToolCallEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCallEnvironment")
            .field("agent_id", &self.agent_id)
            .field("operation_id", &self.ctx.operation_id())
            .finish_non_exhaustive()
    }
}

impl ToolCallEnvironment {
    fn tool_event(&self, name: &str, status: &str, data: Value) -> BusEvent {
        BusEvent::new(name, EventKind::Tool, &self.agent_id, self.ctx.operation_id())
            .with_status(status)
            .with_parent(
                self.ctx.parent_agent_id().map(str::to_owned),
                self.ctx.parent_history_entry_id().map(str::to_owned),
            )
            .with_data(data)
    }
}

/// Wrap tools into provider-facing adapters.
#[must_use]
pub fn wrap_tools(tools: &[Arc<dyn Tool>], env: &Arc<ToolCallEnvironment>) -> Vec<ProviderTool> {
    tools
        .iter()
        .map(|tool| wrap_tool(Arc::clone(tool), Arc::clone(env)))
        .collect()
}

/// Wrap one tool into its call-site adapter.
#[must_use]
pub fn wrap_tool(tool: Arc<dyn Tool>, env: Arc<ToolCallEnvironment>) -> ProviderTool {
    let definition = tool.definition();
    ProviderTool::new(definition, move |supplied_id, arguments| {
        let tool = Arc::clone(&tool);
        let env = Arc::clone(&env);
        Box::pin(async move {
            let tool_call_id =
                supplied_id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
            let span = info_span!(
                "tool",
                tool.name = %tool.name(),
                tool.id = %tool_call_id,
                tool.success = tracing::field::Empty,
            );
            execute_wrapped(tool, env, tool_call_id, arguments)
                .instrument(span)
                .await
        })
    })
}

async fn execute_wrapped(
    tool: Arc<dyn Tool>,
    env: Arc<ToolCallEnvironment>,
    tool_call_id: String,
    arguments: Value,
) -> Result<Value> {
    let tool_name = tool.name().to_owned();
    let entry_id = env.ctx.operation_id().to_owned();

    if RESERVED_REASONING_TOOLS.contains(&tool_name.as_str()) {
        match env.history.get_entry(&entry_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(tool = %tool_name, entry_id, "reasoning tool invoked with unknown history entry");
            }
            Err(err) => {
                warn!(tool = %tool_name, error = %err, "could not verify history entry for reasoning tool");
            }
        }
    }

    env.hooks
        .on_tool_start(&env.ctx, &tool_name, &arguments)
        .await;

    // Tracked started event; the updater settles it after execution.
    let started = TimelineEvent::new("tool:started", EventKind::Tool)
        .tracked(&tool_call_id)
        .with_affected_node(&tool_name)
        .with_data(serde_json::json!({
            "tool_call_id": tool_call_id,
            "tool_name": tool_name,
            "arguments": arguments,
        }));
    env.history.record_event(&entry_id, started).await;
    env.bus.publish(&env.tool_event(
        "tool:started",
        "running",
        serde_json::json!({
            "tool_call_id": tool_call_id,
            "tool_name": tool_name,
            "arguments": arguments,
        }),
    ));

    {
        let history = env.history.clone();
        let entry_id = entry_id.clone();
        let tracked_id = tool_call_id.clone();
        env.ctx.register_event_updater(
            &tool_call_id,
            Box::new(move |update: TimelineEventUpdate| {
                let history = history.clone();
                let entry_id = entry_id.clone();
                let tracked_id = tracked_id.clone();
                Box::pin(async move {
                    if let Err(err) = history
                        .update_tracked_event(&entry_id, &tracked_id, update)
                        .await
                    {
                        warn!(tracked_id, error = %err, "failed to settle tool event");
                    }
                })
            }),
        );
    }

    let span = env.trace.child_span(
        &format!("tool.{tool_name}"),
        SpanKind::Client,
        serde_json::json!({
            "tool.name": tool_name,
            "tool.call_id": tool_call_id,
        }),
    );
    if let Err(err) = env.ctx.attach_tool_span(&tool_call_id, span) {
        // At-most-once guard tripped (or the operation is no longer
        // active): never run the tool a second time.
        warn!(tool = %tool_name, tool_call_id, error = %err, "refusing tool execution");
        if let Some(updater) = env.ctx.take_event_updater(&tool_call_id) {
            updater(
                TimelineEventUpdate::status("error")
                    .with_data(serde_json::json!({"error": err.to_string()})),
            )
            .await;
        }
        return Err(err);
    }

    let options = ToolExecutionOptions {
        tool_call_id: tool_call_id.clone(),
        agent_id: env.agent_id.clone(),
        agent_name: env.agent_name.clone(),
        history_entry_id: entry_id.clone(),
        user_context: env.ctx.user_context(),
        signal: env.ctx.cancellation().clone(),
    };
    let result = tool.execute(arguments, &options).await;

    tracing::Span::current().record("tool.success", result.is_ok());

    // Close and detach the span on both paths; detach is idempotent.
    if let Some(span) = env.ctx.detach_tool_span(&tool_call_id) {
        let status = if result.is_ok() {
            SpanStatus::Ok
        } else {
            SpanStatus::Error
        };
        span.end(status, None);
    }

    if let Some(updater) = env.ctx.take_event_updater(&tool_call_id) {
        let update = match &result {
            Ok(value) => TimelineEventUpdate::status("completed")
                .with_data(serde_json::json!({"result": value})),
            Err(err) => TimelineEventUpdate::status("error")
                .with_data(serde_json::json!({"error": err.to_string()})),
        };
        updater(update).await;
    }

    env.hooks.on_tool_end(&env.ctx, &tool_name, &result).await;

    match result {
        Ok(value) => {
            env.bus.publish(&env.tool_event(
                "tool:completed",
                "completed",
                serde_json::json!({
                    "tool_call_id": tool_call_id,
                    "tool_name": tool_name,
                    "result": value,
                }),
            ));
            Ok(value)
        }
        Err(err) => {
            env.bus.publish(&env.tool_event(
                "tool:failed",
                "error",
                serde_json::json!({
                    "tool_call_id": tool_call_id,
                    "tool_name": tool_name,
                    "error": err.to_string(),
                }),
            ));
            Err(AgentError::tool_execution(
                tool_call_id,
                tool_name,
                err.to_string(),
            ))
        }
    }
}
