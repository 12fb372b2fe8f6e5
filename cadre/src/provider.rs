//! The model provider contract.
//!
//! A [`ModelProvider`] adapts one LLM API to the four core operations. The
//! provider owns the tool loop: when the model emits tool calls, the
//! provider invokes the wrapped [`ProviderTool`]s, feeds results back to
//! the model, and re-queries, up to [`GenerateRequest::max_steps`] rounds.
//! When the cap would be exceeded, the provider stops and reports a
//! `length` finish reason rather than failing.
//!
//! For every step it emits (assistant text, tool call, tool result) the
//! provider awaits the supplied [`StepCallback`] before continuing, which
//! serializes step handling per request. This is the invariant the operation
//! context's lock-free discipline rests on.
//!
//! [`MockProvider`](mock::MockProvider) is a scripted implementation used
//! throughout the test suite.

pub mod mock;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::history::Step;
use crate::message::Message;
use crate::stream::{ChunkStream, FinishReason};
use crate::tool::ProviderTool;
use crate::usage::Usage;

/// Serialized per-step callback; the provider awaits it for every step.
pub type StepCallback = Arc<dyn Fn(Step) -> BoxFuture<'static, ()> + Send + Sync>;

/// A request against a model provider.
#[derive(Clone)]
pub struct GenerateRequest {
    /// Full message list: system message, context window, user input.
    pub messages: Vec<Message>,
    /// Wrapped tools the model may call.
    pub tools: Vec<ProviderTool>,
    /// Cap on provider rounds.
    pub max_steps: usize,
    /// Provider-specific per-call options (temperature, …), opaque here.
    pub options: Value,
    /// Cancellation token; the provider should abort promptly when set.
    pub signal: CancellationToken,
}

impl GenerateRequest {
    /// Create a request with defaults (25 steps, no tools).
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            max_steps: 25,
            options: Value::Null,
            signal: CancellationToken::new(),
        }
    }

    /// Set the tools.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ProviderTool>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the step cap.
    #[must_use]
    pub const fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Find a tool by name.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&ProviderTool> {
        self.tools.iter().find(|t| t.name() == name)
    }
}

impl std::fmt::Debug for GenerateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateRequest")
            .field("messages", &self.messages.len())
            .field("tools", &self.tools.len())
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

/// Result of a completed text generation.
#[derive(Debug, Clone)]
pub struct TextGeneration {
    /// The final assistant text.
    pub text: String,
    /// Token usage across all rounds.
    pub usage: Usage,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Raw provider response, passed through for debugging.
    pub provider_response: Option<Value>,
}

/// Result of a completed object generation.
#[derive(Debug, Clone)]
pub struct ObjectGeneration {
    /// The generated object (schema conformance is validated by the engine).
    pub object: Value,
    /// Token usage across all rounds.
    pub usage: Usage,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Raw provider response, passed through for debugging.
    pub provider_response: Option<Value>,
}

/// Adapter to one model API.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Identifier of the model this provider targets (for history/state).
    fn model_identifier(&self) -> String;

    /// Run the generation loop to completion and return the final text.
    async fn generate_text(
        &self,
        request: GenerateRequest,
        on_step: StepCallback,
    ) -> Result<TextGeneration>;

    /// Run the generation loop, streaming typed chunks as they arrive.
    ///
    /// The stream ends with a [`Finish`](crate::stream::StreamChunk::Finish)
    /// chunk carrying the finish reason and usage; errors surface as an
    /// `Err` item (or an [`Error`](crate::stream::StreamChunk::Error)
    /// chunk for in-band provider errors).
    async fn stream_text(
        &self,
        request: GenerateRequest,
        on_step: StepCallback,
    ) -> Result<ChunkStream>;

    /// Generate a JSON value constrained by `schema`.
    async fn generate_object(
        &self,
        request: GenerateRequest,
        schema: Value,
    ) -> Result<ObjectGeneration>;

    /// Stream a schema-constrained JSON value as text deltas of its
    /// serialization, ending with a finish chunk.
    async fn stream_object(&self, request: GenerateRequest, schema: Value) -> Result<ChunkStream>;
}
