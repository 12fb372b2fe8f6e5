//! Convenient re-exports for common usage.
//!
//! ```rust,ignore
//! use cadre::prelude::*;
//! ```

pub use crate::agent::{
    Agent, AgentBuilder, AgentState, ErrorHook, FinishHook, GenerateOptions, ObjectResult,
    TextResult,
};
pub use crate::context::OperationContext;
pub use crate::engine::{ObjectOutcome, ObjectStream, StreamOutcome, TextStream};
pub use crate::error::{AgentError, ErrorStage, Result};
pub use crate::events::{BusEvent, EventBus, WILDCARD_TOPIC};
pub use crate::guardrail::builtins::{
    EmailRedactor, HtmlSanitizerGuardrail, MaxLengthGuardrail, MaxLengthMode,
    PhoneNumberRedactor, ProfanityGuardrail, ProfanityMode, PromptInjectionGuardrail,
    SensitiveNumberRedactor,
};
pub use crate::guardrail::{
    GuardrailState, InputGuardrail, InputVerdict, OutputGuardrail, OutputStreamPipeline,
    OutputVerdict, Severity, StreamControl, StreamGuardrail,
};
pub use crate::history::{
    EntryStatus, EventKind, HistoryEntry, HistoryManager, Step, TimelineEvent,
    TimelineEventUpdate,
};
pub use crate::hooks::{AgentHooks, NoopAgentHooks, OperationOutcome};
pub use crate::memory::in_memory::InMemoryBackend;
pub use crate::memory::{Conversation, MemoryBackend, MemoryManager, MemoryMessage, MessageFilter};
pub use crate::message::{Message, OperationInput, Role, ToolCall};
pub use crate::provider::mock::{MockProvider, MockTurn};
pub use crate::provider::{GenerateRequest, ModelProvider, StepCallback, TextGeneration};
pub use crate::retriever::Retriever;
pub use crate::runtime::{AgentRegistry, Runtime};
pub use crate::stream::{ChunkStream, FinishReason, StreamChunk};
pub use crate::tool::delegate::{DELEGATE_TOOL_NAME, DelegateTool};
pub use crate::tool::{FunctionTool, ProviderTool, Tool, ToolDefinition, ToolExecutionOptions, Toolkit};
pub use crate::trace::{NoopTraceContext, SpanKind, SpanStatus, TraceContext, TraceSpan};
pub use crate::usage::Usage;
