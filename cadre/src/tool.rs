//! Tools: the capabilities an agent can expose to the model.
//!
//! A [`Tool`] carries its identity (name, description, parameter schema)
//! and an `execute` function receiving the model-supplied arguments plus
//! injected [`ToolExecutionOptions`]. Before a tool reaches the provider it
//! is wrapped by [`wrapper`] into a [`ProviderTool`] (same identity,
//! replaced execute) which records events, opens a tool span, and enforces
//! at-most-once execution per tool call id.
//!
//! [`Toolkit`]s group related tools and may contribute an instruction
//! addendum to the system message.

pub mod delegate;
pub mod wrapper;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Definition of a tool as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name of the tool, unique within an agent.
    pub name: String,
    /// What the tool does; guides the model's tool choice.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Execution options injected into every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolExecutionOptions {
    /// Id of this tool call.
    pub tool_call_id: String,
    /// Id of the agent running the operation.
    pub agent_id: String,
    /// Display name of the agent.
    pub agent_name: String,
    /// The operation's history entry id.
    pub history_entry_id: String,
    /// Snapshot of the operation's user context map.
    pub user_context: HashMap<String, Value>,
    /// Cancellation token; long-running tools should watch it.
    pub signal: CancellationToken,
}

/// The core trait implemented by every tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name of the tool.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments.
    fn parameters(&self) -> Value;

    /// Execute the tool.
    async fn execute(&self, arguments: Value, options: &ToolExecutionOptions) -> Result<Value>;

    /// The definition presented to the model.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

/// A tool built from a closure, for hosts that don't want a struct per tool.
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    handler: Arc<
        dyn Fn(Value, ToolExecutionOptions) -> BoxFuture<'static, Result<Value>> + Send + Sync,
    >,
}

impl FunctionTool {
    /// Create a tool from an async closure.
    #[must_use]
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, ToolExecutionOptions) -> BoxFuture<'static, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, arguments: Value, options: &ToolExecutionOptions) -> Result<Value> {
        (self.handler)(arguments, options.clone()).await
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named group of tools with an optional instruction addendum.
#[derive(Clone)]
pub struct Toolkit {
    /// Toolkit name.
    pub name: String,
    /// The grouped tools.
    pub tools: Vec<Arc<dyn Tool>>,
    /// Text to append to the system message when `add_instructions` is set.
    pub instructions: Option<String>,
    /// Whether `instructions` joins the system message.
    pub add_instructions: bool,
}

impl Toolkit {
    /// Create an empty toolkit.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            instructions: None,
            add_instructions: false,
        }
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Set the instruction addendum and opt it into the system message.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self.add_instructions = true;
        self
    }
}

impl std::fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolkit")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .field("add_instructions", &self.add_instructions)
            .finish_non_exhaustive()
    }
}

/// A call-site adapter handed to the provider.
///
/// Same identity as the wrapped [`Tool`], but `invoke` goes through the
/// wrapper's bookkeeping (events, spans, at-most-once). Providers call
/// [`invoke`](Self::invoke) with the tool call id they assigned, or `None`
/// to have one minted.
#[derive(Clone)]
pub struct ProviderTool {
    definition: ToolDefinition,
    handler: Arc<
        dyn Fn(Option<String>, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync,
    >,
}

impl ProviderTool {
    /// Create a provider tool from a definition and an invoke handler.
    #[must_use]
    pub fn new<F>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Option<String>, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        Self {
            definition,
            handler: Arc::new(handler),
        }
    }

    /// The tool's definition.
    #[must_use]
    pub const fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// The tool's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Invoke the tool through the wrapper.
    pub async fn invoke(&self, tool_call_id: Option<String>, arguments: Value) -> Result<Value> {
        (self.handler)(tool_call_id, arguments).await
    }
}

impl std::fmt::Debug for ProviderTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTool")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}
