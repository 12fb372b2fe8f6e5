//! Scripted provider for testing.
//!
//! [`MockProvider`] consumes a queue of [`MockTurn`]s, one per operation.
//! A turn can carry a tool plan (the mock invokes the wrapped tools,
//! mirroring how a real provider drives the tool loop), a final text (or
//! explicit text chunks for streaming), an object payload, and the
//! reported usage and finish reason. Turns can also be scripted to fail,
//! for exercising provider-error paths.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt as _;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::history::Step;
use crate::provider::{
    GenerateRequest, ModelProvider, ObjectGeneration, StepCallback, TextGeneration,
};
use crate::stream::{ChunkStream, FinishReason, StreamChunk};
use crate::usage::Usage;

/// A tool call the mock issues before producing its text.
#[derive(Debug, Clone)]
pub struct PlannedToolCall {
    /// Tool call id; minted when `None`.
    pub id: Option<String>,
    /// Tool to invoke.
    pub name: String,
    /// Arguments to pass.
    pub arguments: Value,
}

/// One scripted provider response.
#[derive(Debug, Clone)]
pub struct MockTurn {
    text: String,
    text_chunks: Option<Vec<String>>,
    tool_calls: Vec<PlannedToolCall>,
    object: Option<Value>,
    usage: Usage,
    finish_reason: FinishReason,
    fail_with: Option<String>,
}

impl MockTurn {
    /// A turn producing final text.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            text_chunks: None,
            tool_calls: Vec::new(),
            object: None,
            usage: Usage::new(10, 5),
            finish_reason: FinishReason::Stop,
            fail_with: None,
        }
    }

    /// A turn producing an object (for the object operations).
    #[must_use]
    pub fn object(object: Value) -> Self {
        let mut turn = Self::text(object.to_string());
        turn.object = Some(object);
        turn
    }

    /// A turn that fails with a provider error.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        let mut turn = Self::text("");
        turn.fail_with = Some(message.into());
        turn
    }

    /// Add a tool call executed before the text is produced.
    #[must_use]
    pub fn with_tool_call(mut self, name: impl Into<String>, arguments: Value) -> Self {
        self.tool_calls.push(PlannedToolCall {
            id: None,
            name: name.into(),
            arguments,
        });
        self
    }

    /// Add a tool call with a fixed id.
    #[must_use]
    pub fn with_tool_call_id(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        self.tool_calls.push(PlannedToolCall {
            id: Some(id.into()),
            name: name.into(),
            arguments,
        });
        self
    }

    /// Override the streamed text chunking.
    #[must_use]
    pub fn with_text_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.text_chunks = Some(chunks.into_iter().map(Into::into).collect());
        self
    }

    /// Override the reported usage.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Override the reported finish reason.
    #[must_use]
    pub const fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }
}

/// A provider that replays scripted turns.
#[derive(Debug)]
pub struct MockProvider {
    model_id: String,
    turns: Mutex<VecDeque<MockTurn>>,
}

impl MockProvider {
    /// Create a provider that replays `turns` in order.
    #[must_use]
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            model_id: "mock-model".to_owned(),
            turns: Mutex::new(turns.into()),
        }
    }

    /// Override the model identifier.
    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    fn next_turn(&self) -> Result<MockTurn> {
        let turn = self.turns.lock().expect("turn lock").pop_front();
        let turn = turn.ok_or_else(|| AgentError::provider("mock provider has no scripted turns left"))?;
        if let Some(message) = turn.fail_with {
            return Err(AgentError::provider(message));
        }
        Ok(turn)
    }

    /// Run the turn's tool plan, emitting steps; returns tool chunks.
    async fn run_tool_plan(
        turn: &MockTurn,
        request: &GenerateRequest,
        on_step: &StepCallback,
    ) -> Result<Vec<StreamChunk>> {
        let mut chunks = Vec::new();
        for planned in &turn.tool_calls {
            if request.signal.is_cancelled() {
                return Err(AgentError::cancelled("provider aborted"));
            }

            let tool_call_id = planned
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));

            on_step(Step::ToolCall {
                tool_call_id: tool_call_id.clone(),
                tool_name: planned.name.clone(),
                arguments: planned.arguments.clone(),
            })
            .await;
            chunks.push(StreamChunk::ToolCall {
                id: tool_call_id.clone(),
                name: planned.name.clone(),
                arguments: planned.arguments.clone(),
            });

            let outcome = match request.tool(&planned.name) {
                Some(tool) => {
                    tool.invoke(Some(tool_call_id.clone()), planned.arguments.clone())
                        .await
                }
                None => Err(AgentError::tool_execution(
                    tool_call_id.clone(),
                    planned.name.clone(),
                    "tool not found",
                )),
            };
            // A real provider records the failure as the tool result and
            // lets the model decide how to proceed.
            let (result, is_error) = match outcome {
                Ok(value) => (value, false),
                Err(err) => (Value::String(err.to_string()), true),
            };

            on_step(Step::ToolResult {
                tool_call_id: tool_call_id.clone(),
                tool_name: planned.name.clone(),
                result: result.clone(),
                is_error,
            })
            .await;
            chunks.push(StreamChunk::ToolResult {
                id: tool_call_id,
                name: planned.name.clone(),
                result,
                is_error,
            });
        }
        Ok(chunks)
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn model_identifier(&self) -> String {
        self.model_id.clone()
    }

    async fn generate_text(
        &self,
        request: GenerateRequest,
        on_step: StepCallback,
    ) -> Result<TextGeneration> {
        let turn = self.next_turn()?;
        if request.signal.is_cancelled() {
            return Err(AgentError::cancelled("provider aborted"));
        }

        Self::run_tool_plan(&turn, &request, &on_step).await?;

        if !turn.text.is_empty() {
            on_step(Step::Text {
                content: turn.text.clone(),
            })
            .await;
        }

        Ok(TextGeneration {
            text: turn.text,
            usage: turn.usage,
            finish_reason: turn.finish_reason,
            provider_response: Some(serde_json::json!({"provider": "mock", "model": self.model_id})),
        })
    }

    async fn stream_text(
        &self,
        request: GenerateRequest,
        on_step: StepCallback,
    ) -> Result<ChunkStream> {
        let turn = self.next_turn()?;
        if request.signal.is_cancelled() {
            return Err(AgentError::cancelled("provider aborted"));
        }

        let mut chunks = Self::run_tool_plan(&turn, &request, &on_step).await?;

        let deltas = turn
            .text_chunks
            .clone()
            .unwrap_or_else(|| vec![turn.text.clone()]);
        chunks.push(StreamChunk::TextStart { id: "0".to_owned() });
        for delta in deltas {
            if !delta.is_empty() {
                chunks.push(StreamChunk::text_delta("0", delta));
            }
        }
        if !turn.text.is_empty() {
            on_step(Step::Text {
                content: turn.text.clone(),
            })
            .await;
        }
        chunks.push(StreamChunk::finish(turn.finish_reason, turn.usage));

        Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn generate_object(
        &self,
        request: GenerateRequest,
        _schema: Value,
    ) -> Result<ObjectGeneration> {
        let turn = self.next_turn()?;
        if request.signal.is_cancelled() {
            return Err(AgentError::cancelled("provider aborted"));
        }

        let object = match turn.object {
            Some(object) => object,
            None => serde_json::from_str(&turn.text)
                .map_err(|err| AgentError::provider(format!("mock turn is not JSON: {err}")))?,
        };
        Ok(ObjectGeneration {
            object,
            usage: turn.usage,
            finish_reason: turn.finish_reason,
            provider_response: Some(serde_json::json!({"provider": "mock", "model": self.model_id})),
        })
    }

    async fn stream_object(
        &self,
        request: GenerateRequest,
        _schema: Value,
    ) -> Result<ChunkStream> {
        let turn = self.next_turn()?;
        if request.signal.is_cancelled() {
            return Err(AgentError::cancelled("provider aborted"));
        }

        let serialized = match &turn.object {
            Some(object) => object.to_string(),
            None => turn.text.clone(),
        };
        let deltas = turn
            .text_chunks
            .clone()
            .unwrap_or_else(|| vec![serialized]);

        let mut chunks = vec![StreamChunk::TextStart { id: "0".to_owned() }];
        for delta in deltas {
            if !delta.is_empty() {
                chunks.push(StreamChunk::text_delta("0", delta));
            }
        }
        chunks.push(StreamChunk::finish(turn.finish_reason, turn.usage));

        Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}
