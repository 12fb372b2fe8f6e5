//! Builder for [`Agent`].

use std::sync::Arc;

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::guardrail::{InputGuardrail, OutputGuardrail};
use crate::hooks::{AgentHooks, NoopAgentHooks};
use crate::memory::MemoryBackend;
use crate::memory::in_memory::InMemoryBackend;
use crate::provider::ModelProvider;
use crate::retriever::Retriever;
use crate::runtime::Runtime;
use crate::tool::{Tool, Toolkit};
use crate::trace::{NoopTraceContext, TraceContext};
use uuid::Uuid;

/// Builder for [`Agent`]; obtained from [`Agent::builder`].
///
/// The provider is the only required piece. Storage defaults to a fresh
/// in-memory backend shared by history and conversation memory, and the
/// runtime defaults to a private bus/registry pair; pass a shared
/// [`Runtime`] when agents should see each other.
pub struct AgentBuilder {
    pub(crate) id: Option<String>,
    pub(crate) name: String,
    pub(crate) purpose: Option<String>,
    pub(crate) instructions: String,
    pub(crate) provider: Option<Arc<dyn ModelProvider>>,
    pub(crate) store: Option<Arc<dyn MemoryBackend>>,
    pub(crate) conversation_memory: bool,
    pub(crate) runtime: Option<Runtime>,
    pub(crate) tools: Vec<Arc<dyn Tool>>,
    pub(crate) toolkits: Vec<Toolkit>,
    pub(crate) retriever: Option<Arc<dyn Retriever>>,
    pub(crate) hooks: Arc<dyn AgentHooks>,
    pub(crate) trace: Arc<dyn TraceContext>,
    pub(crate) input_guardrails: Vec<Arc<dyn InputGuardrail>>,
    pub(crate) output_guardrails: Vec<Arc<dyn OutputGuardrail>>,
    pub(crate) markdown: bool,
    pub(crate) max_steps: usize,
    pub(crate) max_history_entries: usize,
}

impl AgentBuilder {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            purpose: None,
            instructions: String::new(),
            provider: None,
            store: None,
            conversation_memory: true,
            runtime: None,
            tools: Vec::new(),
            toolkits: Vec::new(),
            retriever: None,
            hooks: Arc::new(NoopAgentHooks),
            trace: Arc::new(NoopTraceContext),
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
            markdown: false,
            max_steps: 25,
            max_history_entries: 100,
        }
    }

    /// Override the generated agent id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the purpose string shown to supervisors; falls back to the
    /// instructions when absent.
    #[must_use]
    pub fn purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    /// Set the base instructions.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Set the model provider.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the storage backend for history and conversation memory.
    #[must_use]
    pub fn memory(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.store = Some(backend);
        self
    }

    /// Disable conversation memory (history is still recorded).
    #[must_use]
    pub const fn disable_memory(mut self) -> Self {
        self.conversation_memory = false;
        self
    }

    /// Attach the shared runtime (event bus + agent registry).
    #[must_use]
    pub fn runtime(mut self, runtime: &Runtime) -> Self {
        self.runtime = Some(runtime.clone());
        self
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Add several tools.
    #[must_use]
    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Add a toolkit.
    #[must_use]
    pub fn toolkit(mut self, toolkit: Toolkit) -> Self {
        self.toolkits.push(toolkit);
        self
    }

    /// Set the retriever.
    #[must_use]
    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Set the lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the trace context used for operation and tool spans.
    #[must_use]
    pub fn trace(mut self, trace: Arc<dyn TraceContext>) -> Self {
        self.trace = trace;
        self
    }

    /// Add an input guardrail (runs in declaration order).
    #[must_use]
    pub fn input_guardrail(mut self, guardrail: Arc<dyn InputGuardrail>) -> Self {
        self.input_guardrails.push(guardrail);
        self
    }

    /// Add an output guardrail (runs in declaration order).
    #[must_use]
    pub fn output_guardrail(mut self, guardrail: Arc<dyn OutputGuardrail>) -> Self {
        self.output_guardrails.push(guardrail);
        self
    }

    /// Append the markdown directive to the system message.
    #[must_use]
    pub const fn markdown(mut self, markdown: bool) -> Self {
        self.markdown = markdown;
        self
    }

    /// Default cap on provider rounds (overridable per call).
    #[must_use]
    pub const fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Cap on retained history entries; zero keeps everything.
    #[must_use]
    pub const fn max_history_entries(mut self, max_history_entries: usize) -> Self {
        self.max_history_entries = max_history_entries;
        self
    }

    /// Build the agent and register it in the runtime's registry.
    ///
    /// # Errors
    ///
    /// [`AgentError::Configuration`] when no provider is set or the name
    /// is empty.
    pub fn build(mut self) -> Result<Arc<Agent>> {
        if self.name.is_empty() {
            return Err(AgentError::configuration("agent name must not be empty"));
        }
        if self.provider.is_none() {
            return Err(AgentError::configuration(format!(
                "agent '{}' has no provider configured",
                self.name
            )));
        }
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
        if self.store.is_none() {
            self.store = Some(Arc::new(InMemoryBackend::new()));
        }
        let runtime = self.runtime.take().unwrap_or_default();

        let agent = Arc::new(Agent::from_builder(self, &runtime));
        runtime.registry().register(Arc::clone(&agent));
        Ok(agent)
    }
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}
