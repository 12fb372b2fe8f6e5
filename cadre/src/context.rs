//! Per-operation execution context.
//!
//! An [`OperationContext`] is created by the orchestrator at request start
//! and carries everything a single operation's collaborators need to share:
//! identifiers, parent-agent linkage, the user context map, the cancellation
//! token, the open tool spans, and the registered tracked-event updaters.
//!
//! The context is single-writer by construction: only the task driving the
//! request mutates it, and the generation engine guarantees step callbacks
//! run serially per request. The interior mutexes exist so the context can
//! be shared as `Arc<OperationContext>` across the tool wrapper and engine,
//! not to support concurrent writers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::history::TimelineEventUpdate;
use crate::trace::TraceSpan;

/// An async closure applying an update to a tracked timeline event.
pub type EventUpdater = Box<dyn Fn(TimelineEventUpdate) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-request mutable state shared across one operation's collaborators.
pub struct OperationContext {
    operation_id: String,
    agent_id: String,
    start_time: DateTime<Utc>,
    parent_agent_id: Option<String>,
    parent_history_entry_id: Option<String>,
    user_context: Mutex<HashMap<String, Value>>,
    cancellation: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
    active: AtomicBool,
    tool_spans: Mutex<HashMap<String, Box<dyn TraceSpan>>>,
    event_updaters: Mutex<HashMap<String, EventUpdater>>,
}

impl OperationContext {
    /// Create a context for a new operation.
    ///
    /// The operation id doubles as the history entry id.
    #[must_use]
    pub fn new(operation_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            agent_id: agent_id.into(),
            start_time: Utc::now(),
            parent_agent_id: None,
            parent_history_entry_id: None,
            user_context: Mutex::new(HashMap::new()),
            cancellation: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            active: AtomicBool::new(true),
            tool_spans: Mutex::new(HashMap::new()),
            event_updaters: Mutex::new(HashMap::new()),
        }
    }

    /// Set the parent-agent linkage for sub-agent operations.
    #[must_use]
    pub fn with_parent(
        mut self,
        parent_agent_id: impl Into<String>,
        parent_history_entry_id: impl Into<String>,
    ) -> Self {
        self.parent_agent_id = Some(parent_agent_id.into());
        self.parent_history_entry_id = Some(parent_history_entry_id.into());
        self
    }

    /// Seed the user context map.
    #[must_use]
    pub fn with_user_context(self, user_context: HashMap<String, Value>) -> Self {
        *self.user_context.lock().expect("user context lock") = user_context;
        self
    }

    /// Chain this operation's cancellation to a caller-supplied token.
    ///
    /// Cancelling the parent token cancels this operation; cancelling this
    /// operation leaves the parent untouched.
    #[must_use]
    pub fn with_signal(mut self, signal: &CancellationToken) -> Self {
        self.cancellation = signal.child_token();
        self
    }

    /// The operation id (= history entry id).
    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Id of the agent executing this operation.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// When the operation started.
    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Id of the parent agent, when running as a sub-agent.
    #[must_use]
    pub fn parent_agent_id(&self) -> Option<&str> {
        self.parent_agent_id.as_deref()
    }

    /// The parent agent's history entry id, when running as a sub-agent.
    #[must_use]
    pub fn parent_history_entry_id(&self) -> Option<&str> {
        self.parent_history_entry_id.as_deref()
    }

    /// The cancellation token propagated into every suspension point.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the operation is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The reason recorded by the first `cancel` call, if any.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().expect("cancel reason lock").clone()
    }

    /// Read a value from the user context map.
    #[must_use]
    pub fn user_context_get(&self, key: &str) -> Option<Value> {
        self.user_context
            .lock()
            .expect("user context lock")
            .get(key)
            .cloned()
    }

    /// Insert a value into the user context map.
    pub fn user_context_set(&self, key: impl Into<String>, value: Value) {
        self.user_context
            .lock()
            .expect("user context lock")
            .insert(key.into(), value);
    }

    /// A snapshot of the user context map.
    #[must_use]
    pub fn user_context(&self) -> HashMap<String, Value> {
        self.user_context.lock().expect("user context lock").clone()
    }

    /// Register an open span for an in-flight tool call.
    ///
    /// # Errors
    ///
    /// [`AgentError::OperationInactive`] after cancellation,
    /// [`AgentError::DuplicateToolSpan`] if the id is already registered;
    /// the at-most-once execution guard for tool calls.
    pub fn attach_tool_span(
        &self,
        tool_call_id: impl Into<String>,
        span: Box<dyn TraceSpan>,
    ) -> Result<()> {
        if !self.is_active() {
            return Err(AgentError::OperationInactive {
                operation_id: self.operation_id.clone(),
            });
        }
        let tool_call_id = tool_call_id.into();
        let mut spans = self.tool_spans.lock().expect("tool spans lock");
        if spans.contains_key(&tool_call_id) {
            return Err(AgentError::DuplicateToolSpan { tool_call_id });
        }
        spans.insert(tool_call_id, span);
        Ok(())
    }

    /// Remove and return the span for a tool call. Idempotent.
    #[must_use]
    pub fn detach_tool_span(&self, tool_call_id: &str) -> Option<Box<dyn TraceSpan>> {
        self.tool_spans
            .lock()
            .expect("tool spans lock")
            .remove(tool_call_id)
    }

    /// Number of currently open tool spans.
    #[must_use]
    pub fn open_tool_spans(&self) -> usize {
        self.tool_spans.lock().expect("tool spans lock").len()
    }

    /// Register an updater for a tracked timeline event.
    pub fn register_event_updater(&self, tracked_event_id: impl Into<String>, updater: EventUpdater) {
        self.event_updaters
            .lock()
            .expect("event updaters lock")
            .insert(tracked_event_id.into(), updater);
    }

    /// Remove and return the updater for a tracked event. Idempotent.
    #[must_use]
    pub fn take_event_updater(&self, tracked_event_id: &str) -> Option<EventUpdater> {
        self.event_updaters
            .lock()
            .expect("event updaters lock")
            .remove(tracked_event_id)
    }

    /// Number of registered event updaters.
    #[must_use]
    pub fn pending_event_updaters(&self) -> usize {
        self.event_updaters.lock().expect("event updaters lock").len()
    }

    /// Remove and return every open tool span.
    ///
    /// The orchestrator drains leftovers at termination so spans opened by
    /// tool executions that were cut short (cancellation, provider abort)
    /// still get closed.
    #[must_use]
    pub fn take_all_tool_spans(&self) -> Vec<(String, Box<dyn TraceSpan>)> {
        self.tool_spans
            .lock()
            .expect("tool spans lock")
            .drain()
            .collect()
    }

    /// Remove and return every registered event updater.
    #[must_use]
    pub fn take_all_event_updaters(&self) -> Vec<(String, EventUpdater)> {
        self.event_updaters
            .lock()
            .expect("event updaters lock")
            .drain()
            .collect()
    }

    /// Cancel the operation cooperatively.
    ///
    /// The first caller wins and records the reason; later calls are no-ops.
    /// After cancellation no further tool spans may be attached.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut stored = self.cancel_reason.lock().expect("cancel reason lock");
        if stored.is_none() {
            let reason = reason.into();
            debug!(operation_id = %self.operation_id, %reason, "Operation cancelled");
            *stored = Some(reason);
        }
        drop(stored);
        self.active.store(false, Ordering::SeqCst);
        self.cancellation.cancel();
    }

    /// Mark the operation as finished, without signalling cancellation.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("operation_id", &self.operation_id)
            .field("agent_id", &self.agent_id)
            .field("parent_agent_id", &self.parent_agent_id)
            .field("active", &self.is_active())
            .field("open_tool_spans", &self.open_tool_spans())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::trace::{NoopTraceContext, SpanKind, TraceContext};

    fn span() -> Box<dyn TraceSpan> {
        NoopTraceContext.child_span("tool.test", SpanKind::Client, serde_json::json!({}))
    }

    mod tool_spans {
        use super::*;

        #[test]
        fn attach_then_detach_balances() {
            let ctx = OperationContext::new("op-1", "agent-1");
            ctx.attach_tool_span("call-1", span()).unwrap();
            assert_eq!(ctx.open_tool_spans(), 1);

            assert!(ctx.detach_tool_span("call-1").is_some());
            assert_eq!(ctx.open_tool_spans(), 0);
        }

        #[test]
        fn duplicate_attach_fails() {
            let ctx = OperationContext::new("op-1", "agent-1");
            ctx.attach_tool_span("call-1", span()).unwrap();
            let err = ctx.attach_tool_span("call-1", span()).unwrap_err();
            assert_eq!(err.code(), "DUPLICATE_TOOL_SPAN");
        }

        #[test]
        fn detach_is_idempotent() {
            let ctx = OperationContext::new("op-1", "agent-1");
            ctx.attach_tool_span("call-1", span()).unwrap();
            assert!(ctx.detach_tool_span("call-1").is_some());
            assert!(ctx.detach_tool_span("call-1").is_none());
        }

        #[test]
        fn attach_after_cancel_fails() {
            let ctx = OperationContext::new("op-1", "agent-1");
            ctx.cancel("user abort");
            let err = ctx.attach_tool_span("call-1", span()).unwrap_err();
            assert_eq!(err.code(), "OPERATION_INACTIVE");
        }
    }

    mod cancellation {
        use super::*;

        #[test]
        fn first_reason_wins() {
            let ctx = OperationContext::new("op-1", "agent-1");
            ctx.cancel("first");
            ctx.cancel("second");
            assert_eq!(ctx.cancel_reason().as_deref(), Some("first"));
            assert!(!ctx.is_active());
            assert!(ctx.cancellation().is_cancelled());
        }

        #[test]
        fn child_token_follows_parent() {
            let parent = CancellationToken::new();
            let ctx = OperationContext::new("op-1", "agent-1").with_signal(&parent);
            assert!(!ctx.cancellation().is_cancelled());
            parent.cancel();
            assert!(ctx.cancellation().is_cancelled());
        }

        #[test]
        fn cancelling_child_leaves_parent() {
            let parent = CancellationToken::new();
            let ctx = OperationContext::new("op-1", "agent-1").with_signal(&parent);
            ctx.cancel("done");
            assert!(!parent.is_cancelled());
        }
    }

    mod event_updaters {
        use super::*;

        #[test]
        fn register_take_balances() {
            let ctx = OperationContext::new("op-1", "agent-1");
            ctx.register_event_updater("ev-1", Box::new(|_| Box::pin(async {})));
            assert_eq!(ctx.pending_event_updaters(), 1);

            assert!(ctx.take_event_updater("ev-1").is_some());
            assert!(ctx.take_event_updater("ev-1").is_none());
            assert_eq!(ctx.pending_event_updaters(), 0);
        }
    }

    mod user_context {
        use super::*;

        #[test]
        fn seed_and_mutate() {
            let mut seed = HashMap::new();
            seed.insert("tenant".to_owned(), serde_json::json!("acme"));
            let ctx = OperationContext::new("op-1", "agent-1").with_user_context(seed);

            assert_eq!(ctx.user_context_get("tenant"), Some(serde_json::json!("acme")));
            ctx.user_context_set("step", serde_json::json!(2));
            assert_eq!(ctx.user_context().len(), 2);
        }
    }
}
