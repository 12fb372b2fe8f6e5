//! Error types for the cadre execution core.
//!
//! All failures surface through a single [`AgentError`] enum. Every variant
//! maps to a stable machine-readable [`code`](AgentError::code) and a
//! [`stage`](AgentError::stage) identifying where in the operation pipeline
//! the failure originated. Tool failures additionally carry the identity of
//! the offending call via [`ToolErrorInfo`].
//!
//! Recoverable failures (tool execution, memory/history persistence) are
//! captured close to where they occur and turned into events; the variants
//! here still exist so adapters and callers share one vocabulary. Terminal
//! failures (guardrail blocks, invalid model output, provider errors,
//! cancellation) propagate to the caller unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A type alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// The pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorStage {
    /// Operation context or history entry creation.
    Initialization,
    /// Input guardrail evaluation.
    InputGuardrail,
    /// Conversation memory load or persistence.
    Memory,
    /// Retrieval against a configured retriever.
    Retrieval,
    /// Model provider rounds.
    Generation,
    /// Tool dispatch and execution.
    ToolExecution,
    /// Output guardrail evaluation (terminal or streaming).
    OutputGuardrail,
    /// History entry finalization.
    Finalization,
}

impl ErrorStage {
    /// Returns the string representation of the stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::InputGuardrail => "input_guardrail",
            Self::Memory => "memory",
            Self::Retrieval => "retrieval",
            Self::Generation => "generation",
            Self::ToolExecution => "tool_execution",
            Self::OutputGuardrail => "output_guardrail",
            Self::Finalization => "finalization",
        }
    }
}

impl std::fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the tool call behind a [`AgentError::ToolExecution`] failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    /// The tool call id assigned by the provider (or minted by the wrapper).
    pub tool_call_id: String,
    /// Name of the tool that failed.
    pub tool_name: String,
}

/// The main error type for agent operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// An input guardrail blocked the operation before the model was called.
    #[error("Input blocked by guardrail '{guardrail_id}': {message}")]
    InputGuardrailBlocked {
        /// Id of the guardrail that blocked.
        guardrail_id: String,
        /// Human-readable reason supplied by the guardrail.
        message: String,
    },

    /// An output guardrail blocked the final output or aborted the stream.
    #[error("Output blocked by guardrail '{guardrail_id}': {message}")]
    OutputGuardrailBlocked {
        /// Id of the guardrail that blocked.
        guardrail_id: String,
        /// Human-readable reason supplied by the guardrail.
        message: String,
    },

    /// A tool raised during execution.
    #[error("Tool '{}' failed: {message}", info.tool_name)]
    ToolExecution {
        /// Identity of the failing tool call.
        info: ToolErrorInfo,
        /// The underlying error message.
        message: String,
    },

    /// The model's output did not satisfy the requested schema.
    #[error("Model output failed validation: {message}")]
    InvalidModelOutput {
        /// The validation/parse error message.
        message: String,
    },

    /// A failure reported by the model provider.
    #[error("Provider error: {message}")]
    Provider {
        /// The provider's error message.
        message: String,
        /// Provider-specific detail, passed through opaquely.
        metadata: Option<serde_json::Value>,
    },

    /// The operation was cancelled cooperatively.
    #[error("Operation cancelled: {reason}")]
    Cancelled {
        /// Reason recorded by the first caller of `cancel`.
        reason: String,
    },

    /// The memory backend failed while persisting a step or message.
    #[error("Memory persistence failed: {message}")]
    MemoryPersist {
        /// The underlying error message.
        message: String,
    },

    /// The history backend failed.
    #[error("History persistence failed: {message}")]
    HistoryPersist {
        /// The underlying error message.
        message: String,
    },

    /// A tool span was attached twice for the same tool call id.
    #[error("Tool span already registered for call '{tool_call_id}'")]
    DuplicateToolSpan {
        /// The offending tool call id.
        tool_call_id: String,
    },

    /// The operation context was used after cancellation or completion.
    #[error("Operation '{operation_id}' is no longer active")]
    OperationInactive {
        /// Id of the inactive operation.
        operation_id: String,
    },

    /// A history entry id was not found.
    #[error("History entry '{entry_id}' not found")]
    EntryNotFound {
        /// The missing entry id.
        entry_id: String,
    },

    /// A timeline event addressed by tracked id was not found.
    #[error("Tracked event '{tracked_event_id}' not found")]
    TrackedEventNotFound {
        /// The missing tracked event id.
        tracked_event_id: String,
    },

    /// A history entry with the same id already exists.
    #[error("Duplicate history entry id '{entry_id}'")]
    DuplicateEntryId {
        /// The duplicated entry id.
        entry_id: String,
    },

    /// The backing store is unavailable.
    #[error("Storage unavailable: {message}")]
    StorageUnavailable {
        /// The underlying error message.
        message: String,
    },

    /// Invalid agent or operation configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },
}

impl AgentError {
    /// Create an input-guardrail block error.
    #[must_use]
    pub fn input_blocked(guardrail_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InputGuardrailBlocked {
            guardrail_id: guardrail_id.into(),
            message: message.into(),
        }
    }

    /// Create an output-guardrail block error.
    #[must_use]
    pub fn output_blocked(guardrail_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OutputGuardrailBlocked {
            guardrail_id: guardrail_id.into(),
            message: message.into(),
        }
    }

    /// Create a tool execution error.
    #[must_use]
    pub fn tool_execution(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ToolExecution {
            info: ToolErrorInfo {
                tool_call_id: tool_call_id.into(),
                tool_name: tool_name.into(),
            },
            message: message.into(),
        }
    }

    /// Create an invalid-model-output error.
    #[must_use]
    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::InvalidModelOutput {
            message: message.into(),
        }
    }

    /// Create a provider error.
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            metadata: None,
        }
    }

    /// Create a provider error with provider-specific detail attached.
    #[must_use]
    pub fn provider_with_metadata(
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self::Provider {
            message: message.into(),
            metadata: Some(metadata),
        }
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a memory persistence error.
    #[must_use]
    pub fn memory_persist(message: impl Into<String>) -> Self {
        Self::MemoryPersist {
            message: message.into(),
        }
    }

    /// Create a history persistence error.
    #[must_use]
    pub fn history_persist(message: impl Into<String>) -> Self {
        Self::HistoryPersist {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InputGuardrailBlocked { .. } => "GUARDRAIL_INPUT_BLOCKED",
            Self::OutputGuardrailBlocked { .. } => "GUARDRAIL_OUTPUT_BLOCKED",
            Self::ToolExecution { .. } => "TOOL_EXECUTION_FAILED",
            Self::InvalidModelOutput { .. } => "MODEL_OUTPUT_INVALID",
            Self::Provider { .. } => "PROVIDER_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::MemoryPersist { .. } => "MEMORY_PERSIST_FAILED",
            Self::HistoryPersist { .. } => "HISTORY_PERSIST_FAILED",
            Self::DuplicateToolSpan { .. } => "DUPLICATE_TOOL_SPAN",
            Self::OperationInactive { .. } => "OPERATION_INACTIVE",
            Self::EntryNotFound { .. } => "HISTORY_ENTRY_NOT_FOUND",
            Self::TrackedEventNotFound { .. } => "TRACKED_EVENT_NOT_FOUND",
            Self::DuplicateEntryId { .. } => "DUPLICATE_HISTORY_ENTRY",
            Self::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
        }
    }

    /// The pipeline stage this error originated from.
    #[must_use]
    pub const fn stage(&self) -> ErrorStage {
        match self {
            Self::InputGuardrailBlocked { .. } => ErrorStage::InputGuardrail,
            Self::OutputGuardrailBlocked { .. } => ErrorStage::OutputGuardrail,
            Self::ToolExecution { .. } | Self::DuplicateToolSpan { .. } => {
                ErrorStage::ToolExecution
            }
            Self::InvalidModelOutput { .. } | Self::Provider { .. } | Self::Cancelled { .. } => {
                ErrorStage::Generation
            }
            Self::MemoryPersist { .. } => ErrorStage::Memory,
            Self::HistoryPersist { .. }
            | Self::EntryNotFound { .. }
            | Self::TrackedEventNotFound { .. }
            | Self::DuplicateEntryId { .. }
            | Self::StorageUnavailable { .. } => ErrorStage::Finalization,
            Self::OperationInactive { .. } | Self::Configuration { .. } => {
                ErrorStage::Initialization
            }
        }
    }

    /// Identity of the failing tool call, when this is a tool failure.
    #[must_use]
    pub const fn tool_error(&self) -> Option<&ToolErrorInfo> {
        match self {
            Self::ToolExecution { info, .. } => Some(info),
            _ => None,
        }
    }

    /// Returns `true` if this error terminates the operation.
    ///
    /// Tool and memory failures are recovered locally (an event is emitted
    /// and generation continues); everything else surfaces to the caller.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::ToolExecution { .. } | Self::MemoryPersist { .. } | Self::HistoryPersist { .. }
        )
    }

    /// Returns `true` if this error is a cooperative cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
