//! The `delegate_task` tool.
//!
//! Exposed automatically when an agent has sub-agents. Each invocation
//! runs the task on one or more sub-agents under a fresh child operation
//! whose parent linkage points at the delegating operation, so the
//! sub-agents' events propagate up through the bus.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::agent::GenerateOptions;
use crate::context::OperationContext;
use crate::error::Result;
use crate::hooks::AgentHooks;
use crate::runtime::AgentRegistry;
use crate::tool::{Tool, ToolDefinition, ToolExecutionOptions};

/// Name of the delegation tool.
pub const DELEGATE_TOOL_NAME: &str = "delegate_task";

/// A sub-agent the delegator may target.
#[derive(Debug, Clone)]
pub struct SubAgentTarget {
    /// Sub-agent id (registry key).
    pub id: String,
    /// Display name, matchable in `target_agents`.
    pub name: String,
    /// One-line purpose shown to the model.
    pub purpose: String,
}

/// The definition `delegate_task` presents to the model.
#[must_use]
pub fn delegate_tool_definition(targets: &[SubAgentTarget]) -> ToolDefinition {
    let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
    ToolDefinition::new(
        DELEGATE_TOOL_NAME,
        format!(
            "Delegate a task to one or more sub-agents and collect their results. \
             Available sub-agents: {}.",
            names.join(", ")
        ),
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Detailed description of the task to delegate."
                },
                "target_agents": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Names of the sub-agents to involve. Defaults to all."
                },
                "context": {
                    "type": "object",
                    "description": "Extra context passed through to the sub-agents."
                }
            },
            "required": ["task"]
        }),
    )
}

#[derive(Debug, Deserialize)]
struct DelegateArgs {
    task: String,
    #[serde(default)]
    target_agents: Option<Vec<String>>,
    #[serde(default)]
    context: Option<serde_json::Map<String, Value>>,
}

/// Runs a task on the delegating agent's sub-agents.
///
/// Built per operation: it holds the delegating operation's context so the
/// child operations inherit its cancellation and parent linkage.
pub struct DelegateTool {
    registry: Arc<AgentRegistry>,
    targets: Vec<SubAgentTarget>,
    hooks: Arc<dyn AgentHooks>,
    ctx: Arc<OperationContext>,
    delegator_name: String,
    definition: ToolDefinition,
}

impl DelegateTool {
    /// Create the tool for one operation.
    #[must_use]
    pub fn new(
        registry: Arc<AgentRegistry>,
        targets: Vec<SubAgentTarget>,
        hooks: Arc<dyn AgentHooks>,
        ctx: Arc<OperationContext>,
        delegator_name: impl Into<String>,
    ) -> Self {
        let definition = delegate_tool_definition(&targets);
        Self {
            registry,
            targets,
            hooks,
            ctx,
            delegator_name: delegator_name.into(),
            definition,
        }
    }

    fn select_targets(&self, requested: Option<&[String]>) -> Vec<&SubAgentTarget> {
        match requested {
            None => self.targets.iter().collect(),
            Some(names) => self
                .targets
                .iter()
                .filter(|target| {
                    names
                        .iter()
                        .any(|name| name == &target.name || name == &target.id)
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for DelegateTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateTool")
            .field("delegator", &self.delegator_name)
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL_NAME
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters(&self) -> Value {
        self.definition.parameters.clone()
    }

    async fn execute(&self, arguments: Value, options: &ToolExecutionOptions) -> Result<Value> {
        let args: DelegateArgs = serde_json::from_value(arguments)
            .map_err(|err| crate::error::AgentError::tool_execution(
                options.tool_call_id.clone(),
                DELEGATE_TOOL_NAME,
                format!("invalid arguments: {err}"),
            ))?;

        let selected = self.select_targets(args.target_agents.as_deref());
        let mut results = Vec::with_capacity(selected.len());

        let task = match &args.context {
            Some(context) if !context.is_empty() => {
                let rendered = serde_json::to_string_pretty(context).unwrap_or_default();
                format!("{}\n\nAdditional context:\n{rendered}", args.task)
            }
            _ => args.task.clone(),
        };

        for target in selected {
            let Some(agent) = self.registry.get(&target.id) else {
                results.push(serde_json::json!({
                    "agent_name": target.name,
                    "status": "error",
                    "error": format!("sub-agent '{}' is not registered", target.name),
                }));
                continue;
            };

            info!(
                from_agent = %self.delegator_name,
                to_agent = %target.name,
                "delegating task to sub-agent",
            );
            self.hooks
                .on_handoff(&self.ctx, &self.delegator_name, &target.name)
                .await;

            let mut child_options = GenerateOptions::new()
                .parent(options.agent_id.clone(), options.history_entry_id.clone())
                .signal(options.signal.clone());
            for (key, value) in &options.user_context {
                child_options = child_options.context(key.clone(), value.clone());
            }

            match agent.generate_text(task.clone(), child_options).await {
                Ok(result) => results.push(serde_json::json!({
                    "agent_name": target.name,
                    "status": "completed",
                    "response": result.text,
                })),
                Err(err) => results.push(serde_json::json!({
                    "agent_name": target.name,
                    "status": "error",
                    "error": err.to_string(),
                })),
            }
        }

        Ok(Value::Array(results))
    }

    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }
}
