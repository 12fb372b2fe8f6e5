//! Conversation memory and the storage backend contract.
//!
//! The [`MemoryManager`] materializes a conversation window for the
//! generation engine and persists new turns as they happen. Storage itself
//! is behind the [`MemoryBackend`] trait, which also carries the history
//! rows the [`HistoryManager`](crate::history::HistoryManager) records
//! through; one backend owns both concerns so hosts plug in a single
//! store.
//!
//! Memory failures never fail generation: every storage error in this
//! module is degraded to a `warn` log plus a memory-kind event on the bus.

pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::context::OperationContext;
use crate::error::Result;
use crate::events::{BusEvent, EventBus};
use crate::history::{
    EntryUpdate, EventKind, HistoryEntry, Step, TimelineEvent, TimelineEventUpdate,
};
use crate::message::{Message, OperationInput, Role};

/// A grouping of messages under a `(user_id, conversation_id)` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id.
    pub id: String,
    /// Owning resource (= agent id).
    pub resource_id: String,
    /// Display title.
    pub title: String,
    /// Free-form metadata.
    pub metadata: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a conversation with a default title.
    #[must_use]
    pub fn new(id: impl Into<String>, resource_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            resource_id: resource_id.into(),
            title: format!("New Chat {}", now.format("%Y-%m-%d %H:%M:%S")),
            metadata: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kind of a stored memory message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Plain text turn.
    Text,
    /// A tool call issued by the assistant.
    ToolCall,
    /// A tool result fed back to the model.
    ToolResult,
}

/// One stored conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMessage {
    /// Message id.
    pub id: String,
    /// Role of the turn.
    pub role: Role,
    /// Content (text, or serialized call/result payload).
    pub content: String,
    /// Kind of the turn.
    pub kind: MessageKind,
    /// Creation time; messages are ordered by this, ascending.
    pub created_at: DateTime<Utc>,
}

impl MemoryMessage {
    /// Create a text message with a generated id.
    #[must_use]
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            kind: MessageKind::Text,
            created_at: Utc::now(),
        }
    }

    /// Convert into a provider-facing [`Message`].
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message::new(self.role, self.content.clone())
    }
}

/// Filter for [`MemoryBackend::get_messages`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Conversation ownership key.
    pub user_id: String,
    /// Conversation to read.
    pub conversation_id: String,
    /// Maximum number of most-recent messages to return.
    pub limit: Option<usize>,
}

/// Pluggable storage for conversations, messages, and history rows.
///
/// Implementations must be safe for concurrent access on distinct history
/// entries and for serialized access per entry; `get_messages` returns
/// messages ordered by `created_at` ascending. The store does not dedupe;
/// duplicate inserts within a conversation are acceptable.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Store one message under `(user_id, conversation_id)`.
    async fn add_message(
        &self,
        message: MemoryMessage,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<()>;

    /// Load messages matching the filter, oldest first.
    async fn get_messages(&self, filter: &MessageFilter) -> Result<Vec<MemoryMessage>>;

    /// Remove messages for a user, optionally scoped to one conversation.
    async fn clear_messages(&self, user_id: &str, conversation_id: Option<&str>) -> Result<()>;

    /// Create a conversation.
    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation>;

    /// Fetch a conversation by id.
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Update a conversation's title and/or metadata.
    async fn update_conversation(
        &self,
        id: &str,
        title: Option<String>,
        metadata: Option<Value>,
    ) -> Result<Conversation>;

    /// Delete a conversation and its messages.
    async fn delete_conversation(&self, id: &str) -> Result<()>;

    /// Append a history entry.
    async fn add_history_entry(&self, entry: HistoryEntry) -> Result<()>;

    /// Merge an update into a history entry, bumping its sequence number.
    async fn update_history_entry(&self, id: &str, update: EntryUpdate) -> Result<HistoryEntry>;

    /// Append a step to a history entry.
    async fn add_history_step(&self, entry_id: &str, step: Step) -> Result<()>;

    /// Append a timeline event to a history entry.
    async fn add_history_event(&self, entry_id: &str, event: TimelineEvent) -> Result<()>;

    /// Update a tracked timeline event in place.
    async fn update_history_event(
        &self,
        entry_id: &str,
        tracked_event_id: &str,
        update: TimelineEventUpdate,
    ) -> Result<()>;

    /// Fetch a history entry by id.
    async fn get_history_entry(&self, id: &str) -> Result<Option<HistoryEntry>>;

    /// All history entries for an agent, in creation order.
    async fn history_entries_for_agent(&self, agent_id: &str) -> Result<Vec<HistoryEntry>>;

    /// Delete one history entry (with its steps and events).
    async fn delete_history_entry(&self, id: &str) -> Result<()>;

    /// Delete all history entries for an agent (with steps and events).
    async fn delete_history_entries(&self, agent_id: &str) -> Result<()>;
}

/// Conversation-window preparation and step persistence for one agent.
#[derive(Clone)]
pub struct MemoryManager {
    backend: Option<Arc<dyn MemoryBackend>>,
    bus: Arc<EventBus>,
    agent_id: String,
}

impl MemoryManager {
    /// Create a manager; `backend: None` disables memory entirely.
    #[must_use]
    pub fn new(
        backend: Option<Arc<dyn MemoryBackend>>,
        bus: Arc<EventBus>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            bus,
            agent_id: agent_id.into(),
        }
    }

    /// Whether a backend is configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Materialize the conversation window and persist the new input.
    ///
    /// Returns the window of prior messages (oldest first, at most
    /// `context_limit`) and the effective conversation id. Without a
    /// backend or a `user_id`, memory is skipped and the window is empty.
    ///
    /// A missing conversation is created lazily; storage errors are
    /// degraded to memory events and an empty window.
    pub async fn prepare_context(
        &self,
        ctx: &OperationContext,
        input: &OperationInput,
        user_id: Option<&str>,
        conversation_id: Option<String>,
        context_limit: usize,
    ) -> (Vec<MemoryMessage>, Option<String>) {
        let (Some(backend), Some(user_id)) = (self.backend.as_deref(), user_id) else {
            return (Vec::new(), conversation_id);
        };

        let conversation_id =
            conversation_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Err(err) = self
            .ensure_conversation(backend, &conversation_id)
            .await
        {
            self.report_failure(ctx, "memory:prepare_failed", &err.to_string());
            return (Vec::new(), Some(conversation_id));
        }

        let filter = MessageFilter {
            user_id: user_id.to_owned(),
            conversation_id: conversation_id.clone(),
            limit: Some(context_limit),
        };
        let window = match backend.get_messages(&filter).await {
            Ok(messages) => messages,
            Err(err) => {
                self.report_failure(ctx, "memory:read_failed", &err.to_string());
                Vec::new()
            }
        };

        // Persist the new input after the window was captured, so the
        // window reflects only prior turns.
        let persisted = match input {
            OperationInput::Text(text) => {
                backend
                    .add_message(
                        MemoryMessage::text(Role::User, text.clone()),
                        user_id,
                        &conversation_id,
                    )
                    .await
            }
            OperationInput::Messages(messages) => {
                let mut result = Ok(());
                for message in messages {
                    let Some(content) = message.text() else {
                        continue;
                    };
                    result = backend
                        .add_message(
                            MemoryMessage::text(message.role, content),
                            user_id,
                            &conversation_id,
                        )
                        .await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
        };
        if let Err(err) = persisted {
            self.report_failure(ctx, "memory:persist_failed", &err.to_string());
        }

        (window, Some(conversation_id))
    }

    /// Build the per-operation step writer for the engine's step callback.
    #[must_use]
    pub fn step_writer(
        &self,
        ctx: &OperationContext,
        user_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> StepMemoryWriter {
        let backend = match (user_id, conversation_id) {
            (Some(_), Some(_)) => self.backend.clone(),
            _ => None,
        };
        StepMemoryWriter {
            backend,
            bus: Arc::clone(&self.bus),
            agent_id: self.agent_id.clone(),
            history_entry_id: ctx.operation_id().to_owned(),
            user_id: user_id.unwrap_or_default().to_owned(),
            conversation_id: conversation_id.unwrap_or_default().to_owned(),
        }
    }

    async fn ensure_conversation(
        &self,
        backend: &dyn MemoryBackend,
        conversation_id: &str,
    ) -> Result<()> {
        if backend.get_conversation(conversation_id).await?.is_none() {
            backend
                .create_conversation(Conversation::new(conversation_id, &self.agent_id))
                .await?;
        }
        Ok(())
    }

    fn report_failure(&self, ctx: &OperationContext, name: &str, message: &str) {
        warn!(agent_id = %self.agent_id, %message, "memory operation failed");
        self.bus.publish(
            &BusEvent::new(name, EventKind::Memory, &self.agent_id, ctx.operation_id())
                .with_status("error")
                .with_data(serde_json::json!({
                    "code": "MEMORY_PERSIST_FAILED",
                    "message": message,
                })),
        );
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("agent_id", &self.agent_id)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// Persists generation steps into conversation memory.
///
/// Returned by [`MemoryManager::step_writer`]; a no-op when memory is
/// disabled for the operation. Failures are reported as memory events and
/// swallowed so generation proceeds.
pub struct StepMemoryWriter {
    backend: Option<Arc<dyn MemoryBackend>>,
    bus: Arc<EventBus>,
    agent_id: String,
    history_entry_id: String,
    user_id: String,
    conversation_id: String,
}

impl StepMemoryWriter {
    /// Persist one step.
    pub async fn persist(&self, step: &Step) {
        let Some(backend) = self.backend.as_deref() else {
            return;
        };

        let message = match step {
            Step::Text { content } => MemoryMessage::text(Role::Assistant, content.clone()),
            Step::ToolCall {
                tool_call_id,
                tool_name,
                arguments,
            } => MemoryMessage {
                id: Uuid::new_v4().to_string(),
                role: Role::Assistant,
                content: serde_json::json!({
                    "tool_call_id": tool_call_id,
                    "tool_name": tool_name,
                    "arguments": arguments,
                })
                .to_string(),
                kind: MessageKind::ToolCall,
                created_at: Utc::now(),
            },
            Step::ToolResult {
                tool_call_id,
                tool_name,
                result,
                is_error,
            } => MemoryMessage {
                id: Uuid::new_v4().to_string(),
                role: Role::Tool,
                content: serde_json::json!({
                    "tool_call_id": tool_call_id,
                    "tool_name": tool_name,
                    "result": result,
                    "is_error": is_error,
                })
                .to_string(),
                kind: MessageKind::ToolResult,
                created_at: Utc::now(),
            },
            Step::Message { role, content } => MemoryMessage::text(*role, content.clone()),
        };

        if let Err(err) = backend
            .add_message(message, &self.user_id, &self.conversation_id)
            .await
        {
            warn!(
                agent_id = %self.agent_id,
                conversation_id = %self.conversation_id,
                error = %err,
                "failed to persist step to memory",
            );
            self.bus.publish(
                &BusEvent::new(
                    "memory:persist_failed",
                    EventKind::Memory,
                    &self.agent_id,
                    &self.history_entry_id,
                )
                .with_status("error")
                .with_data(serde_json::json!({
                    "code": "MEMORY_PERSIST_FAILED",
                    "message": err.to_string(),
                })),
            );
        }
    }
}

impl std::fmt::Debug for StepMemoryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepMemoryWriter")
            .field("agent_id", &self.agent_id)
            .field("conversation_id", &self.conversation_id)
            .field("enabled", &self.backend.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::in_memory::InMemoryBackend;

    fn manager_with_backend() -> (MemoryManager, Arc<InMemoryBackend>, Arc<EventBus>) {
        let backend = Arc::new(InMemoryBackend::new());
        let bus = Arc::new(EventBus::new());
        let manager = MemoryManager::new(
            Some(Arc::clone(&backend) as Arc<dyn MemoryBackend>),
            Arc::clone(&bus),
            "agent-1",
        );
        (manager, backend, bus)
    }

    mod prepare_context {
        use super::*;

        #[tokio::test]
        async fn creates_conversation_lazily() {
            let (manager, backend, _) = manager_with_backend();
            let ctx = OperationContext::new("op-1", "agent-1");

            let (window, conversation_id) = manager
                .prepare_context(&ctx, &"hello".into(), Some("user-1"), None, 10)
                .await;

            assert!(window.is_empty());
            let conversation_id = conversation_id.unwrap();
            let conversation = backend
                .get_conversation(&conversation_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(conversation.resource_id, "agent-1");
            assert!(conversation.title.starts_with("New Chat"));
        }

        #[tokio::test]
        async fn window_excludes_current_input() {
            let (manager, _, _) = manager_with_backend();
            let ctx = OperationContext::new("op-1", "agent-1");

            let (_, conversation_id) = manager
                .prepare_context(&ctx, &"first".into(), Some("user-1"), None, 10)
                .await;
            let conversation_id = conversation_id.unwrap();

            let (window, _) = manager
                .prepare_context(
                    &ctx,
                    &"second".into(),
                    Some("user-1"),
                    Some(conversation_id),
                    10,
                )
                .await;

            assert_eq!(window.len(), 1);
            assert_eq!(window[0].content, "first");
            assert_eq!(window[0].role, Role::User);
        }

        #[tokio::test]
        async fn window_respects_context_limit() {
            let (manager, _, _) = manager_with_backend();
            let ctx = OperationContext::new("op-1", "agent-1");

            let (_, conversation_id) = manager
                .prepare_context(&ctx, &"m0".into(), Some("user-1"), None, 10)
                .await;
            let conversation_id = conversation_id.unwrap();
            for i in 1..5 {
                manager
                    .prepare_context(
                        &ctx,
                        &format!("m{i}").into(),
                        Some("user-1"),
                        Some(conversation_id.clone()),
                        10,
                    )
                    .await;
            }

            let (window, _) = manager
                .prepare_context(
                    &ctx,
                    &"latest".into(),
                    Some("user-1"),
                    Some(conversation_id),
                    2,
                )
                .await;

            // The two most recent prior turns, oldest first.
            let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, ["m3", "m4"]);
        }

        #[tokio::test]
        async fn skipped_without_user_id() {
            let (manager, backend, _) = manager_with_backend();
            let ctx = OperationContext::new("op-1", "agent-1");

            let (window, conversation_id) = manager
                .prepare_context(&ctx, &"hello".into(), None, None, 10)
                .await;

            assert!(window.is_empty());
            assert!(conversation_id.is_none());
            let filter = MessageFilter {
                user_id: String::new(),
                conversation_id: String::new(),
                limit: None,
            };
            assert!(backend.get_messages(&filter).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn message_list_inputs_are_persisted_in_order() {
            let (manager, backend, _) = manager_with_backend();
            let ctx = OperationContext::new("op-1", "agent-1");

            let input: OperationInput =
                vec![Message::system("rules"), Message::user("question")].into();
            let (_, conversation_id) = manager
                .prepare_context(&ctx, &input, Some("user-1"), None, 10)
                .await;

            let filter = MessageFilter {
                user_id: "user-1".into(),
                conversation_id: conversation_id.unwrap(),
                limit: None,
            };
            let stored = backend.get_messages(&filter).await.unwrap();
            assert_eq!(stored.len(), 2);
            assert_eq!(stored[0].role, Role::System);
            assert_eq!(stored[1].role, Role::User);
        }
    }

    mod step_writer {
        use super::*;

        #[tokio::test]
        async fn persists_text_and_tool_steps() {
            let (manager, backend, _) = manager_with_backend();
            let ctx = OperationContext::new("op-1", "agent-1");
            let writer = manager.step_writer(&ctx, Some("user-1"), Some("conv-1"));

            writer.persist(&Step::Text { content: "answer".into() }).await;
            writer
                .persist(&Step::ToolCall {
                    tool_call_id: "c1".into(),
                    tool_name: "search".into(),
                    arguments: serde_json::json!({"q": "x"}),
                })
                .await;
            writer
                .persist(&Step::ToolResult {
                    tool_call_id: "c1".into(),
                    tool_name: "search".into(),
                    result: serde_json::json!("found"),
                    is_error: false,
                })
                .await;

            let filter = MessageFilter {
                user_id: "user-1".into(),
                conversation_id: "conv-1".into(),
                limit: None,
            };
            let stored = backend.get_messages(&filter).await.unwrap();
            assert_eq!(stored.len(), 3);
            assert_eq!(stored[0].kind, MessageKind::Text);
            assert_eq!(stored[0].role, Role::Assistant);
            assert_eq!(stored[1].kind, MessageKind::ToolCall);
            assert_eq!(stored[2].kind, MessageKind::ToolResult);
            assert_eq!(stored[2].role, Role::Tool);
        }

        #[tokio::test]
        async fn disabled_writer_is_noop() {
            let bus = Arc::new(EventBus::new());
            let manager = MemoryManager::new(None, Arc::clone(&bus), "agent-1");
            let ctx = OperationContext::new("op-1", "agent-1");
            let writer = manager.step_writer(&ctx, Some("user-1"), Some("conv-1"));

            // Must not panic or publish failure events.
            writer.persist(&Step::Text { content: "x".into() }).await;
            assert_eq!(bus.emission_count("memory:persist_failed"), 0);
        }
    }
}
