//! Interaction history: entries, steps, and timeline events.
//!
//! Every operation owns exactly one [`HistoryEntry`], the durable record of
//! the request. The entry accumulates [`Step`]s (model/tool turns, in
//! provider-emission order) and [`TimelineEvent`]s (observable transitions,
//! in publish order). A timeline event carrying a tracked id can be updated
//! in place until it reaches a terminal status.
//!
//! Storage is delegated to the configured [`MemoryBackend`]; the
//! [`HistoryManager`] layers the per-agent view, sequence-number discipline,
//! and entry trimming on top. For a given entry, step and event appends are
//! serialized by the engine, so readers observe them in append order.
//!
//! [`MemoryBackend`]: crate::memory::MemoryBackend

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::MemoryBackend;
use crate::message::{OperationInput, Role};
use crate::usage::Usage;

/// Status of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Created but not yet running.
    Idle,
    /// The operation is in flight.
    Working,
    /// The operation completed successfully.
    Completed,
    /// The operation failed or was cancelled.
    Error,
}

impl EntryStatus {
    /// Returns the string representation of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Returns `true` once the entry can no longer change status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One turn of the model/tool interaction within an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Assistant text emitted by the model.
    Text {
        /// The emitted text.
        content: String,
    },
    /// The model called a tool.
    ToolCall {
        /// Tool call id.
        tool_call_id: String,
        /// Name of the tool.
        tool_name: String,
        /// Arguments the model supplied.
        arguments: Value,
    },
    /// A tool call produced a result (or an error).
    ToolResult {
        /// Tool call id this result pairs with.
        tool_call_id: String,
        /// Name of the tool.
        tool_name: String,
        /// The result value, or the error message when `is_error` is set.
        result: Value,
        /// Whether the tool failed.
        #[serde(default)]
        is_error: bool,
    },
    /// A system/user message recorded for replay.
    Message {
        /// Role of the recorded message.
        role: Role,
        /// Message content.
        content: String,
    },
}

impl Step {
    /// The tool call id, for tool-call and tool-result steps.
    #[must_use]
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { tool_call_id, .. } | Self::ToolResult { tool_call_id, .. } => {
                Some(tool_call_id)
            }
            _ => None,
        }
    }

    /// Returns `true` for assistant text steps.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }
}

/// Category of a timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Agent lifecycle transitions.
    Agent,
    /// Tool invocation transitions.
    Tool,
    /// Memory reads/writes.
    Memory,
    /// Retrieval transitions.
    Retriever,
}

/// An observable state transition attached to a history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Unique event id.
    pub id: String,
    /// Dotted `component:operation` name, e.g. `tool:started`.
    pub name: String,
    /// Category of the event.
    pub kind: EventKind,
    /// Current status, e.g. `running`, `completed`, `error`.
    pub status: String,
    /// When the event was first appended.
    pub timestamp: DateTime<Utc>,
    /// When the event was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Id of the node (tool, conversation, …) the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_node_id: Option<String>,
    /// Stable id allowing later in-place updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracked_id: Option<String>,
    /// Free-form payload.
    pub data: Value,
}

impl TimelineEvent {
    /// Create a new event with a generated id and `running` status.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: EventKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            status: "running".to_owned(),
            timestamp: now,
            updated_at: now,
            affected_node_id: None,
            tracked_id: None,
            data: Value::Null,
        }
    }

    /// Set the status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Set the affected node id.
    #[must_use]
    pub fn with_affected_node(mut self, node_id: impl Into<String>) -> Self {
        self.affected_node_id = Some(node_id.into());
        self
    }

    /// Mark the event as tracked so it can be updated in place later.
    #[must_use]
    pub fn tracked(mut self, tracked_id: impl Into<String>) -> Self {
        self.tracked_id = Some(tracked_id.into());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Returns `true` if this event is addressable by `tracked_event_id`.
    #[must_use]
    pub fn matches_tracked(&self, tracked_event_id: &str) -> bool {
        self.id == tracked_event_id || self.tracked_id.as_deref() == Some(tracked_event_id)
    }

    /// Apply an update in place: merge data, overwrite status, bump time.
    pub fn apply(&mut self, update: &TimelineEventUpdate) {
        if let Some(status) = &update.status {
            self.status.clone_from(status);
        }
        if let Some(data) = &update.data {
            merge_json(&mut self.data, data);
        }
        self.updated_at = Utc::now();
    }
}

/// A partial update applied to a tracked timeline event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineEventUpdate {
    /// New status, if changing.
    pub status: Option<String>,
    /// Data to merge into the event payload.
    pub data: Option<Value>,
}

impl TimelineEventUpdate {
    /// An update setting only the status.
    #[must_use]
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            data: None,
        }
    }

    /// Attach data to merge.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Shallow-merge `patch` into `target`; non-object targets are replaced.
fn merge_json(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target_map), Some(patch_map)) => {
            for (k, v) in patch_map {
                target_map.insert(k.clone(), v.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// The durable record of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Entry id (= operation id).
    pub id: String,
    /// Id of the agent that ran the operation.
    pub agent_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time; non-decreasing across updates.
    pub updated_at: DateTime<Utc>,
    /// Current status.
    pub status: EntryStatus,
    /// The operation input.
    pub input: OperationInput,
    /// Final output text (empty until finalization).
    #[serde(default)]
    pub output: String,
    /// Accumulated token usage.
    #[serde(default)]
    pub usage: Usage,
    /// Steps in provider-emission order.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Timeline events in publish order.
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
    /// Parent agent id, for sub-agent operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    /// Parent history entry id, for sub-agent operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_history_entry_id: Option<String>,
    /// Serialized user context.
    #[serde(default)]
    pub user_context: Value,
    /// Monotonic update counter; strictly increases per update.
    #[serde(default)]
    pub sequence_number: u64,
}

/// A partial update merged into a history entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryUpdate {
    /// New status, if changing.
    pub status: Option<EntryStatus>,
    /// Final output text.
    pub output: Option<String>,
    /// Accumulated usage.
    pub usage: Option<Usage>,
}

impl EntryUpdate {
    /// An update setting only the status.
    #[must_use]
    pub const fn status(status: EntryStatus) -> Self {
        Self {
            status: Some(status),
            output: None,
            usage: None,
        }
    }

    /// Set the output text.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Set the usage.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Per-agent facade over history storage.
///
/// Enforces the entry cap and provides the append/update operations the
/// engine and tool wrapper record through. Appends for the same entry are
/// issued serially by the engine; the backend must additionally be safe for
/// concurrent access across distinct entries.
#[derive(Clone)]
pub struct HistoryManager {
    backend: Arc<dyn MemoryBackend>,
    agent_id: String,
    max_entries: usize,
}

impl HistoryManager {
    /// Create a manager for one agent.
    ///
    /// `max_entries` of zero means unbounded.
    #[must_use]
    pub fn new(backend: Arc<dyn MemoryBackend>, agent_id: impl Into<String>, max_entries: usize) -> Self {
        Self {
            backend,
            agent_id: agent_id.into(),
            max_entries,
        }
    }

    /// Id of the agent this manager records for.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Append a new entry and trim beyond the configured cap.
    pub async fn add_entry(&self, entry: HistoryEntry) -> Result<HistoryEntry> {
        self.backend.add_history_entry(entry.clone()).await?;

        if self.max_entries > 0 {
            let existing = self.backend.history_entries_for_agent(&self.agent_id).await?;
            if existing.len() > self.max_entries {
                let excess = existing.len() - self.max_entries;
                for stale in existing.iter().take(excess) {
                    self.backend.delete_history_entry(&stale.id).await?;
                }
            }
        }

        Ok(entry)
    }

    /// Fetch an entry by id.
    pub async fn get_entry(&self, id: &str) -> Result<Option<HistoryEntry>> {
        self.backend.get_history_entry(id).await
    }

    /// Merge non-nil fields into an entry, bumping `updated_at` and the
    /// sequence number.
    pub async fn update_entry(&self, id: &str, update: EntryUpdate) -> Result<HistoryEntry> {
        self.backend.update_history_entry(id, update).await
    }

    /// Append a step to an entry.
    pub async fn append_step(&self, entry_id: &str, step: Step) -> Result<()> {
        self.backend.add_history_step(entry_id, step).await
    }

    /// Append a timeline event to an entry.
    pub async fn append_event(&self, entry_id: &str, event: TimelineEvent) -> Result<()> {
        self.backend.add_history_event(entry_id, event).await
    }

    /// Update a tracked event in place.
    ///
    /// The event is located by `event.id` or its tracked id, first match
    /// wins. Fails without mutating anything when no event matches.
    pub async fn update_tracked_event(
        &self,
        entry_id: &str,
        tracked_event_id: &str,
        update: TimelineEventUpdate,
    ) -> Result<()> {
        self.backend
            .update_history_event(entry_id, tracked_event_id, update)
            .await
    }

    /// All entries for this agent, in creation order.
    pub async fn entries(&self) -> Result<Vec<HistoryEntry>> {
        self.backend.history_entries_for_agent(&self.agent_id).await
    }

    /// Remove all of this agent's entries.
    ///
    /// Clearing cascades: the steps and timeline events stored with each
    /// entry are removed along with it.
    pub async fn clear(&self) -> Result<()> {
        self.backend.delete_history_entries(&self.agent_id).await
    }

    /// Append a step, degrading storage failures to a warning.
    ///
    /// Generation must not fail because history persistence failed; the
    /// engine records steps through this method.
    pub async fn record_step(&self, entry_id: &str, step: Step) {
        if let Err(err) = self.append_step(entry_id, step).await {
            warn!(entry_id, error = %err, "failed to persist history step");
        }
    }

    /// Append an event, degrading storage failures to a warning.
    pub async fn record_event(&self, entry_id: &str, event: TimelineEvent) {
        if let Err(err) = self.append_event(entry_id, event).await {
            warn!(entry_id, error = %err, "failed to persist timeline event");
        }
    }
}

impl std::fmt::Debug for HistoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryManager")
            .field("agent_id", &self.agent_id)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}
