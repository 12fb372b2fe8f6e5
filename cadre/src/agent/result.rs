//! Result types for agent operations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::history::EntryStatus;
use crate::stream::FinishReason;
use crate::usage::Usage;

/// Result of [`Agent::generate_text`](crate::agent::Agent::generate_text).
#[derive(Debug, Clone)]
pub struct TextResult {
    /// The operation (= history entry) id.
    pub operation_id: String,
    /// The conversation written to, when memory was enabled.
    pub conversation_id: Option<String>,
    /// Final text, after output guardrails.
    pub text: String,
    /// Token usage across all provider rounds.
    pub usage: Usage,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Raw provider response, for debugging.
    pub provider_response: Option<Value>,
}

/// Result of [`Agent::generate_object`](crate::agent::Agent::generate_object).
#[derive(Debug, Clone)]
pub struct ObjectResult<T> {
    /// The operation (= history entry) id.
    pub operation_id: String,
    /// The conversation written to, when memory was enabled.
    pub conversation_id: Option<String>,
    /// The schema-validated object.
    pub object: T,
    /// Token usage across all provider rounds.
    pub usage: Usage,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Raw provider response, for debugging.
    pub provider_response: Option<Value>,
}

/// Compact view of one past operation, used in [`AgentState`].
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    /// Entry id.
    pub id: String,
    /// Terminal (or current) status.
    pub status: EntryStatus,
    /// When the operation started.
    pub created_at: DateTime<Utc>,
    /// When the entry was last updated.
    pub updated_at: DateTime<Utc>,
    /// First 120 characters of the output.
    pub output_preview: String,
}

/// Snapshot of an agent for dashboards and debugging.
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    /// Agent id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Purpose string, when configured.
    pub purpose: Option<String>,
    /// Model identifier reported by the provider.
    pub model: String,
    /// `working` while operations are in flight, `idle` otherwise.
    pub status: String,
    /// Ids of the registered sub-agents.
    pub sub_agents: Vec<String>,
    /// Most recent operations, newest last.
    pub recent_operations: Vec<OperationSummary>,
}
