//! Per-operation options.
//!
//! [`GenerateOptions`] configures one call to any of the four agent
//! operations: conversation ownership, sub-agent linkage, context-window
//! size, the user context map, the step cap, cancellation, per-call
//! provider options, and the observer callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::engine::{ChunkHook, StepHook};
use crate::error::AgentError;
use crate::history::Step;
use crate::hooks::OperationOutcome;
use crate::stream::StreamChunk;

/// Observer invoked once with the terminal outcome of a successful
/// operation.
pub type FinishHook = Arc<dyn Fn(&OperationOutcome) + Send + Sync>;

/// Observer invoked once with the terminal error of a failed operation.
pub type ErrorHook = Arc<dyn Fn(&AgentError) + Send + Sync>;

/// Options for a single agent operation.
#[derive(Clone, Default)]
pub struct GenerateOptions {
    /// Conversation ownership key; memory is skipped when absent.
    pub user_id: Option<String>,
    /// Conversation to continue; a fresh one is created when absent.
    pub conversation_id: Option<String>,
    /// Parent agent id, when running as a sub-agent.
    pub parent_agent_id: Option<String>,
    /// Parent history entry id, when running as a sub-agent.
    pub parent_history_entry_id: Option<String>,
    /// Maximum prior messages loaded into the prompt (default 10).
    pub context_limit: usize,
    /// Arbitrary map propagated into events and tool execution options.
    pub user_context: HashMap<String, Value>,
    /// Cap on provider rounds; the agent's default applies when absent.
    pub max_steps: Option<usize>,
    /// Caller-supplied cancellation handle.
    pub signal: Option<CancellationToken>,
    /// Provider-specific per-call options, treated opaquely by the core.
    pub provider_options: Value,
    /// Called after each recorded step.
    pub on_step_finish: Option<StepHook>,
    /// Called for each emitted stream chunk.
    pub on_chunk: Option<ChunkHook>,
    /// Called once on successful termination.
    pub on_finish: Option<FinishHook>,
    /// Called once on failed termination.
    pub on_error: Option<ErrorHook>,
}

impl GenerateOptions {
    /// Create options with defaults (context limit 10, no memory key).
    #[must_use]
    pub fn new() -> Self {
        Self {
            context_limit: 10,
            provider_options: Value::Null,
            ..Self::default()
        }
    }

    /// Set the conversation ownership key.
    #[must_use]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Continue an existing conversation.
    #[must_use]
    pub fn conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Set sub-agent linkage for event propagation.
    #[must_use]
    pub fn parent(
        mut self,
        parent_agent_id: impl Into<String>,
        parent_history_entry_id: impl Into<String>,
    ) -> Self {
        self.parent_agent_id = Some(parent_agent_id.into());
        self.parent_history_entry_id = Some(parent_history_entry_id.into());
        self
    }

    /// Set the context-window size.
    #[must_use]
    pub const fn context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    /// Add one user-context entry.
    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.user_context.insert(key.into(), value);
        self
    }

    /// Replace the user-context map.
    #[must_use]
    pub fn with_user_context(mut self, user_context: HashMap<String, Value>) -> Self {
        self.user_context = user_context;
        self
    }

    /// Cap the provider rounds for this call.
    #[must_use]
    pub const fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Attach a cancellation handle.
    #[must_use]
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Set provider-specific per-call options.
    #[must_use]
    pub fn provider_options(mut self, options: Value) -> Self {
        self.provider_options = options;
        self
    }

    /// Observe each recorded step.
    #[must_use]
    pub fn on_step_finish(mut self, hook: impl Fn(&Step) + Send + Sync + 'static) -> Self {
        self.on_step_finish = Some(Arc::new(hook));
        self
    }

    /// Observe each emitted stream chunk.
    #[must_use]
    pub fn on_chunk(mut self, hook: impl Fn(&StreamChunk) + Send + Sync + 'static) -> Self {
        self.on_chunk = Some(Arc::new(hook));
        self
    }

    /// Observe the successful terminal outcome.
    #[must_use]
    pub fn on_finish(mut self, hook: impl Fn(&OperationOutcome) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(hook));
        self
    }

    /// Observe the failed terminal outcome.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&AgentError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for GenerateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateOptions")
            .field("user_id", &self.user_id)
            .field("conversation_id", &self.conversation_id)
            .field("context_limit", &self.context_limit)
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let options = GenerateOptions::new();
        assert_eq!(options.context_limit, 10);
        assert!(options.user_id.is_none());
        assert!(options.max_steps.is_none());
        assert_eq!(options.provider_options, Value::Null);
    }

    #[test]
    fn builder_chain() {
        let options = GenerateOptions::new()
            .user_id("user-1")
            .conversation_id("conv-1")
            .parent("parent-agent", "parent-entry")
            .context_limit(5)
            .context("tenant", serde_json::json!("acme"))
            .max_steps(3);

        assert_eq!(options.user_id.as_deref(), Some("user-1"));
        assert_eq!(options.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(options.parent_agent_id.as_deref(), Some("parent-agent"));
        assert_eq!(options.context_limit, 5);
        assert_eq!(options.max_steps, Some(3));
        assert_eq!(options.user_context.len(), 1);
    }
}
