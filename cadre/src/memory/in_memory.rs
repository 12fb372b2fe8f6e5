//! In-memory storage backend.
//!
//! [`InMemoryBackend`] keeps conversations, messages, and history entries
//! in `tokio::sync::RwLock`-guarded maps. Data is lost when the value is
//! dropped. Best suited for tests, single-run agents, and short-lived
//! conversations; durable deployments plug in their own
//! [`MemoryBackend`](crate::memory::MemoryBackend).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};
use crate::history::{EntryUpdate, HistoryEntry, Step, TimelineEvent, TimelineEventUpdate};
use crate::memory::{Conversation, MemoryBackend, MemoryMessage, MessageFilter};

/// Ephemeral backend storing everything in process memory.
///
/// Concurrent readers proceed in parallel; writers serialize per map.
/// History entries are kept in insertion order, which is creation order.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    messages: RwLock<HashMap<(String, String), Vec<MemoryMessage>>>,
    conversations: RwLock<HashMap<String, Conversation>>,
    entries: RwLock<Vec<HistoryEntry>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn add_message(
        &self,
        message: MemoryMessage,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<()> {
        self.messages
            .write()
            .await
            .entry((user_id.to_owned(), conversation_id.to_owned()))
            .or_default()
            .push(message);
        Ok(())
    }

    async fn get_messages(&self, filter: &MessageFilter) -> Result<Vec<MemoryMessage>> {
        let map = self.messages.read().await;
        let key = (filter.user_id.clone(), filter.conversation_id.clone());
        let mut messages = map.get(&key).cloned().unwrap_or_default();
        messages.sort_by_key(|m| m.created_at);
        if let Some(limit) = filter.limit
            && messages.len() > limit
        {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    async fn clear_messages(&self, user_id: &str, conversation_id: Option<&str>) -> Result<()> {
        let mut map = self.messages.write().await;
        match conversation_id {
            Some(conversation_id) => {
                map.remove(&(user_id.to_owned(), conversation_id.to_owned()));
            }
            None => map.retain(|(user, _), _| user != user_id),
        }
        Ok(())
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(id).cloned())
    }

    async fn update_conversation(
        &self,
        id: &str,
        title: Option<String>,
        metadata: Option<Value>,
    ) -> Result<Conversation> {
        let mut map = self.conversations.write().await;
        let conversation = map.get_mut(id).ok_or_else(|| AgentError::EntryNotFound {
            entry_id: id.to_owned(),
        })?;
        if let Some(title) = title {
            conversation.title = title;
        }
        if let Some(metadata) = metadata {
            conversation.metadata = metadata;
        }
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.conversations.write().await.remove(id);
        self.messages
            .write()
            .await
            .retain(|(_, conversation), _| conversation != id);
        Ok(())
    }

    async fn add_history_entry(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(AgentError::DuplicateEntryId { entry_id: entry.id });
        }
        entries.push(entry);
        Ok(())
    }

    async fn update_history_entry(&self, id: &str, update: EntryUpdate) -> Result<HistoryEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AgentError::EntryNotFound {
                entry_id: id.to_owned(),
            })?;
        if let Some(status) = update.status {
            entry.status = status;
        }
        if let Some(output) = update.output {
            entry.output = output;
        }
        if let Some(usage) = update.usage {
            entry.usage = usage;
        }
        entry.updated_at = Utc::now();
        entry.sequence_number += 1;
        Ok(entry.clone())
    }

    async fn add_history_step(&self, entry_id: &str, step: Step) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| AgentError::EntryNotFound {
                entry_id: entry_id.to_owned(),
            })?;
        entry.steps.push(step);
        entry.updated_at = Utc::now();
        entry.sequence_number += 1;
        Ok(())
    }

    async fn add_history_event(&self, entry_id: &str, event: TimelineEvent) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| AgentError::EntryNotFound {
                entry_id: entry_id.to_owned(),
            })?;
        entry.events.push(event);
        entry.updated_at = Utc::now();
        entry.sequence_number += 1;
        Ok(())
    }

    async fn update_history_event(
        &self,
        entry_id: &str,
        tracked_event_id: &str,
        update: TimelineEventUpdate,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| AgentError::EntryNotFound {
                entry_id: entry_id.to_owned(),
            })?;
        let event = entry
            .events
            .iter_mut()
            .find(|e| e.matches_tracked(tracked_event_id))
            .ok_or_else(|| AgentError::TrackedEventNotFound {
                tracked_event_id: tracked_event_id.to_owned(),
            })?;
        event.apply(&update);
        entry.updated_at = Utc::now();
        entry.sequence_number += 1;
        Ok(())
    }

    async fn get_history_entry(&self, id: &str) -> Result<Option<HistoryEntry>> {
        Ok(self.entries.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn history_entries_for_agent(&self, agent_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn delete_history_entry(&self, id: &str) -> Result<()> {
        self.entries.write().await.retain(|e| e.id != id);
        Ok(())
    }

    async fn delete_history_entries(&self, agent_id: &str) -> Result<()> {
        self.entries.write().await.retain(|e| e.agent_id != agent_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::message::Role;

    fn sample_messages(n: usize) -> Vec<MemoryMessage> {
        (0..n)
            .map(|i| match i % 2 {
                0 => MemoryMessage::text(Role::User, format!("user-{i}")),
                _ => MemoryMessage::text(Role::Assistant, format!("assistant-{i}")),
            })
            .collect()
    }

    mod messages {
        use super::*;

        #[tokio::test]
        async fn stored_per_user_and_conversation() {
            let backend = InMemoryBackend::new();
            for message in sample_messages(3) {
                backend.add_message(message, "u1", "c1").await.unwrap();
            }
            backend
                .add_message(MemoryMessage::text(Role::User, "other"), "u2", "c1")
                .await
                .unwrap();

            let filter = MessageFilter {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                limit: None,
            };
            assert_eq!(backend.get_messages(&filter).await.unwrap().len(), 3);
        }

        #[tokio::test]
        async fn limit_keeps_most_recent() {
            let backend = InMemoryBackend::new();
            for message in sample_messages(5) {
                backend.add_message(message, "u1", "c1").await.unwrap();
            }

            let filter = MessageFilter {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                limit: Some(2),
            };
            let messages = backend.get_messages(&filter).await.unwrap();
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].content, "assistant-3");
            assert_eq!(messages[1].content, "user-4");
        }

        #[tokio::test]
        async fn duplicates_are_not_deduped() {
            let backend = InMemoryBackend::new();
            let message = MemoryMessage::text(Role::User, "same");
            backend
                .add_message(message.clone(), "u1", "c1")
                .await
                .unwrap();
            backend.add_message(message, "u1", "c1").await.unwrap();

            let filter = MessageFilter {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                limit: None,
            };
            assert_eq!(backend.get_messages(&filter).await.unwrap().len(), 2);
        }

        #[tokio::test]
        async fn clear_scoped_to_conversation() {
            let backend = InMemoryBackend::new();
            backend
                .add_message(MemoryMessage::text(Role::User, "a"), "u1", "c1")
                .await
                .unwrap();
            backend
                .add_message(MemoryMessage::text(Role::User, "b"), "u1", "c2")
                .await
                .unwrap();

            backend.clear_messages("u1", Some("c1")).await.unwrap();

            let c1 = MessageFilter {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                limit: None,
            };
            let c2 = MessageFilter {
                user_id: "u1".into(),
                conversation_id: "c2".into(),
                limit: None,
            };
            assert!(backend.get_messages(&c1).await.unwrap().is_empty());
            assert_eq!(backend.get_messages(&c2).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn clear_all_for_user() {
            let backend = InMemoryBackend::new();
            backend
                .add_message(MemoryMessage::text(Role::User, "a"), "u1", "c1")
                .await
                .unwrap();
            backend
                .add_message(MemoryMessage::text(Role::User, "b"), "u1", "c2")
                .await
                .unwrap();
            backend
                .add_message(MemoryMessage::text(Role::User, "keep"), "u2", "c3")
                .await
                .unwrap();

            backend.clear_messages("u1", None).await.unwrap();

            let kept = MessageFilter {
                user_id: "u2".into(),
                conversation_id: "c3".into(),
                limit: None,
            };
            assert_eq!(backend.get_messages(&kept).await.unwrap().len(), 1);
        }
    }

    mod conversations {
        use super::*;

        #[tokio::test]
        async fn create_get_update_delete() {
            let backend = InMemoryBackend::new();
            let conversation = Conversation::new("c1", "agent-1");
            backend.create_conversation(conversation).await.unwrap();

            let fetched = backend.get_conversation("c1").await.unwrap().unwrap();
            assert_eq!(fetched.resource_id, "agent-1");

            let updated = backend
                .update_conversation("c1", Some("Renamed".into()), None)
                .await
                .unwrap();
            assert_eq!(updated.title, "Renamed");
            assert!(updated.updated_at >= fetched.updated_at);

            backend.delete_conversation("c1").await.unwrap();
            assert!(backend.get_conversation("c1").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn delete_removes_messages() {
            let backend = InMemoryBackend::new();
            backend
                .create_conversation(Conversation::new("c1", "agent-1"))
                .await
                .unwrap();
            backend
                .add_message(MemoryMessage::text(Role::User, "x"), "u1", "c1")
                .await
                .unwrap();

            backend.delete_conversation("c1").await.unwrap();

            let filter = MessageFilter {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                limit: None,
            };
            assert!(backend.get_messages(&filter).await.unwrap().is_empty());
        }
    }

    mod concurrency {
        use super::*;

        #[tokio::test]
        async fn concurrent_writers_all_land() {
            let backend = Arc::new(InMemoryBackend::new());

            let handles: Vec<_> = (0..50)
                .map(|i| {
                    let backend = Arc::clone(&backend);
                    tokio::spawn(async move {
                        backend
                            .add_message(
                                MemoryMessage::text(Role::User, format!("msg-{i}")),
                                "u1",
                                "c1",
                            )
                            .await
                            .unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            let filter = MessageFilter {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                limit: None,
            };
            assert_eq!(backend.get_messages(&filter).await.unwrap().len(), 50);
        }

        #[tokio::test]
        async fn concurrent_appends_on_distinct_entries() {
            use crate::history::{EntryStatus, HistoryEntry};
            use crate::usage::Usage;

            let backend = Arc::new(InMemoryBackend::new());
            for id in ["e1", "e2"] {
                backend
                    .add_history_entry(HistoryEntry {
                        id: id.to_owned(),
                        agent_id: "agent-1".to_owned(),
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                        status: EntryStatus::Working,
                        input: "x".into(),
                        output: String::new(),
                        usage: Usage::zero(),
                        steps: Vec::new(),
                        events: Vec::new(),
                        parent_agent_id: None,
                        parent_history_entry_id: None,
                        user_context: Value::Null,
                        sequence_number: 0,
                    })
                    .await
                    .unwrap();
            }

            let handles: Vec<_> = (0..20)
                .map(|i| {
                    let backend = Arc::clone(&backend);
                    let entry_id = if i % 2 == 0 { "e1" } else { "e2" };
                    tokio::spawn(async move {
                        backend
                            .add_history_step(
                                entry_id,
                                Step::Text {
                                    content: format!("s{i}"),
                                },
                            )
                            .await
                            .unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            let e1 = backend.get_history_entry("e1").await.unwrap().unwrap();
            let e2 = backend.get_history_entry("e2").await.unwrap().unwrap();
            assert_eq!(e1.steps.len() + e2.steps.len(), 20);
        }
    }
}
