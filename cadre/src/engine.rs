//! The generation engine.
//!
//! [`GenerationEngine`] drives the four provider operations for one agent
//! and threads their side effects back into the core: every provider step
//! is recorded into history and conversation memory (serially, through the
//! provider's step callback), streamed text deltas pass through the
//! output-guardrail pipeline before re-emission, and terminal output
//! guardrails run once the model finishes.
//!
//! Cancellation is checked at every suspension point: the provider call is
//! raced against the operation's token, and the token is also handed to
//! the provider for cooperative abort.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{Stream, StreamExt as _};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::context::OperationContext;
use crate::error::{AgentError, Result};
use crate::guardrail::{OutputGuardrail, OutputStreamPipeline, run_output_guardrails};
use crate::history::{HistoryManager, Step};
use crate::memory::StepMemoryWriter;
use crate::provider::{GenerateRequest, ModelProvider, StepCallback};
use crate::stream::{ChunkStream, FinishReason, StreamChunk};
use crate::usage::Usage;

/// Synchronous observer invoked after each recorded step.
pub type StepHook = Arc<dyn Fn(&Step) + Send + Sync>;

/// Synchronous observer invoked for each emitted stream chunk.
pub type ChunkHook = Arc<dyn Fn(&StreamChunk) + Send + Sync>;

/// Async completion handler invoked exactly once when a stream terminates.
pub type CompletionHandler =
    Box<dyn FnOnce(Result<StreamOutcome>) -> BoxFuture<'static, ()> + Send>;

/// Per-operation wiring handed to the engine by the orchestrator.
pub struct EngineContext {
    /// The operation context.
    pub ctx: Arc<OperationContext>,
    /// History manager recording steps for this operation's entry.
    pub history: HistoryManager,
    /// Memory writer persisting steps as conversation turns.
    pub memory_writer: Arc<StepMemoryWriter>,
    /// Output guardrails (terminal + streaming).
    pub output_guardrails: Vec<Arc<dyn OutputGuardrail>>,
    /// Caller's per-step observer.
    pub on_step_finish: Option<StepHook>,
    /// Caller's per-chunk observer.
    pub on_chunk: Option<ChunkHook>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("operation_id", &self.ctx.operation_id())
            .field("output_guardrails", &self.output_guardrails.len())
            .finish_non_exhaustive()
    }
}

/// Result of a completed text generation, after output guardrails.
#[derive(Debug, Clone)]
pub struct EngineTextOutput {
    /// The sanitized final text.
    pub text: String,
    /// The pre-guardrail model output.
    pub original_text: String,
    /// Token usage across all rounds.
    pub usage: Usage,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Raw provider response.
    pub provider_response: Option<Value>,
}

/// Result of a completed object generation.
#[derive(Debug, Clone)]
pub struct EngineObjectOutput<T> {
    /// The validated object.
    pub object: T,
    /// The object as returned by the provider, for history recording.
    pub raw: Value,
    /// Token usage across all rounds.
    pub usage: Usage,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Raw provider response.
    pub provider_response: Option<Value>,
}

/// Terminal summary of a finished stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// The post-finalize sanitized text (serialized object for object
    /// streams).
    pub text: String,
    /// Token usage reported by the provider.
    pub usage: Usage,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

/// A live text stream returned by [`crate::agent::Agent::stream_text`].
///
/// Yields guardrail-sanitized [`StreamChunk`]s. [`finish`](Self::finish)
/// (or [`text`](Self::text)) drains the rest of the stream and returns the
/// terminal outcome; a guardrail abort or provider failure surfaces both
/// as an `Err` item and from the futures.
pub struct TextStream {
    pub(crate) operation_id: String,
    pub(crate) conversation_id: Option<String>,
    pub(crate) stream: ChunkStream,
    pub(crate) outcome: oneshot::Receiver<Result<StreamOutcome>>,
}

impl TextStream {
    /// The operation (= history entry) id.
    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// The conversation this operation wrote to, when memory is enabled.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Drain the stream and return the terminal outcome.
    pub async fn finish(mut self) -> Result<StreamOutcome> {
        while self.stream.next().await.is_some() {}
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(AgentError::provider(
                "stream ended without reporting an outcome",
            )),
        }
    }

    /// Drain the stream and return the final sanitized text.
    pub async fn text(self) -> Result<String> {
        Ok(self.finish().await?.text)
    }
}

impl Stream for TextStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for TextStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextStream")
            .field("operation_id", &self.operation_id)
            .finish_non_exhaustive()
    }
}

/// Terminal summary of a finished object stream.
#[derive(Debug, Clone)]
pub struct ObjectOutcome<T> {
    /// The validated object.
    pub object: T,
    /// Token usage reported by the provider.
    pub usage: Usage,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

/// A live object stream returned by
/// [`crate::agent::Agent::stream_object`].
///
/// Chunks carry the object's serialization as text deltas; the validated
/// object is available from [`finish`](Self::finish) once the stream ends.
pub struct ObjectStream<T> {
    pub(crate) operation_id: String,
    pub(crate) stream: ChunkStream,
    pub(crate) outcome: oneshot::Receiver<Result<ObjectOutcome<T>>>,
}

impl<T> ObjectStream<T> {
    /// The operation (= history entry) id.
    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Drain the stream and return the terminal outcome.
    pub async fn finish(mut self) -> Result<ObjectOutcome<T>> {
        while self.stream.next().await.is_some() {}
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(AgentError::provider(
                "stream ended without reporting an outcome",
            )),
        }
    }

    /// Drain the stream and return the validated object.
    pub async fn object(self) -> Result<T> {
        Ok(self.finish().await?.object)
    }
}

impl<T> Stream for ObjectStream<T> {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl<T> std::fmt::Debug for ObjectStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("operation_id", &self.operation_id)
            .finish_non_exhaustive()
    }
}

/// Derive the JSON Schema for `T`, dropping the `$schema` meta field.
#[must_use]
pub fn schema_for_type<T: schemars::JsonSchema>() -> Value {
    let root = schemars::schema_for!(T);
    let mut value = serde_json::to_value(&root).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("$schema");
    }
    value
}

/// Drives provider operations for one agent.
pub struct GenerationEngine {
    provider: Arc<dyn ModelProvider>,
}

impl GenerationEngine {
    /// Create an engine over a provider.
    #[must_use]
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    /// The provider's model identifier.
    #[must_use]
    pub fn model_identifier(&self) -> String {
        self.provider.model_identifier()
    }

    /// Build the serialized step callback recording into history, memory,
    /// and the caller's observer.
    ///
    /// Tool-call/tool-result pairing is checked here: a result whose call
    /// id was never observed is logged and recorded, never synthesized
    /// into a failure.
    fn step_callback(env: &EngineContext) -> StepCallback {
        let history = env.history.clone();
        let writer = Arc::clone(&env.memory_writer);
        let hook = env.on_step_finish.clone();
        let entry_id = env.ctx.operation_id().to_owned();
        let seen_calls: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        Arc::new(move |step: Step| {
            let history = history.clone();
            let writer = Arc::clone(&writer);
            let hook = hook.clone();
            let entry_id = entry_id.clone();
            let seen_calls = Arc::clone(&seen_calls);
            Box::pin(async move {
                match &step {
                    Step::ToolCall { tool_call_id, .. } => {
                        seen_calls
                            .lock()
                            .expect("seen calls lock")
                            .insert(tool_call_id.clone());
                    }
                    Step::ToolResult {
                        tool_call_id,
                        tool_name,
                        ..
                    } => {
                        if !seen_calls
                            .lock()
                            .expect("seen calls lock")
                            .contains(tool_call_id)
                        {
                            warn!(
                                tool_call_id,
                                tool = %tool_name,
                                "tool result without a matching in-flight tool call",
                            );
                        }
                    }
                    _ => {}
                }
                history.record_step(&entry_id, step.clone()).await;
                writer.persist(&step).await;
                if let Some(hook) = &hook {
                    hook(&step);
                }
            })
        })
    }

    fn cancellation_error(ctx: &OperationContext) -> AgentError {
        AgentError::cancelled(
            ctx.cancel_reason()
                .unwrap_or_else(|| "operation cancelled".to_owned()),
        )
    }

    /// Run a text generation to completion.
    ///
    /// The provider owns the tool loop; this method records its steps,
    /// races the call against cancellation, and applies the terminal
    /// output guardrails to the final text.
    pub async fn generate_text(
        &self,
        request: GenerateRequest,
        env: EngineContext,
    ) -> Result<EngineTextOutput> {
        let on_step = Self::step_callback(&env);
        let token = env.ctx.cancellation().clone();

        let generation = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Self::cancellation_error(&env.ctx)),
            result = self.provider.generate_text(request, on_step) => result?,
        };

        let text =
            run_output_guardrails(&env.output_guardrails, &generation.text, &env.ctx).await?;

        Ok(EngineTextOutput {
            text,
            original_text: generation.text,
            usage: generation.usage,
            finish_reason: generation.finish_reason,
            provider_response: generation.provider_response,
        })
    }

    /// Start a streaming text generation.
    ///
    /// Every text delta passes through the guardrail pipeline before being
    /// re-emitted; on the provider's finish chunk the pipeline finalizes,
    /// trailing text (held tails, terminal diff) is appended as synthetic
    /// deltas, and `on_complete` fires exactly once with the outcome.
    pub async fn stream_text(
        &self,
        request: GenerateRequest,
        env: EngineContext,
        conversation_id: Option<String>,
        on_complete: CompletionHandler,
    ) -> Result<TextStream> {
        let on_step = Self::step_callback(&env);
        let token = env.ctx.cancellation().clone();
        let operation_id = env.ctx.operation_id().to_owned();

        // `on_complete` must fire exactly once even when the stream cannot
        // be acquired, so the operation still terminates cleanly.
        let provider_stream = tokio::select! {
            biased;
            () = token.cancelled() => {
                let err = Self::cancellation_error(&env.ctx);
                on_complete(Err(err.clone())).await;
                return Err(err);
            }
            result = self.provider.stream_text(request, on_step) => match result {
                Ok(stream) => stream,
                Err(err) => {
                    on_complete(Err(err.clone())).await;
                    return Err(err);
                }
            },
        };

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let mut pipeline = OutputStreamPipeline::new(env.output_guardrails.clone());
        let ctx = Arc::clone(&env.ctx);
        let on_chunk = env.on_chunk.clone();

        let stream = Box::pin(async_stream::stream! {
            let mut inner = provider_stream;
            let mut failure: Option<AgentError> = None;
            let mut outcome: Option<StreamOutcome> = None;
            let mut text_id = String::from("0");

            loop {
                let item = tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        failure = Some(Self::cancellation_error(&ctx));
                        break;
                    }
                    item = inner.next() => item,
                };
                let Some(item) = item else { break };

                match item {
                    Ok(StreamChunk::TextDelta { id, delta }) => {
                        text_id.clone_from(&id);
                        match pipeline.process_part(&delta) {
                            Ok(Some(text)) if !text.is_empty() => {
                                let chunk = StreamChunk::TextDelta { id, delta: text };
                                if let Some(hook) = &on_chunk { hook(&chunk); }
                                yield Ok(chunk);
                            }
                            Ok(_) => {}
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                    Ok(StreamChunk::Finish { reason, usage }) => {
                        match pipeline.finalize(&ctx).await {
                            Ok(finalized) => {
                                for tail in finalized.trailing {
                                    let chunk = StreamChunk::TextDelta {
                                        id: text_id.clone(),
                                        delta: tail,
                                    };
                                    if let Some(hook) = &on_chunk { hook(&chunk); }
                                    yield Ok(chunk);
                                }
                                let chunk = StreamChunk::finish(reason, usage);
                                if let Some(hook) = &on_chunk { hook(&chunk); }
                                yield Ok(chunk);
                                outcome = Some(StreamOutcome {
                                    text: finalized.text,
                                    usage,
                                    finish_reason: reason,
                                });
                            }
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                    Ok(StreamChunk::Error { message }) => {
                        failure = Some(AgentError::provider(message));
                        break;
                    }
                    Ok(chunk) => {
                        if let StreamChunk::TextStart { id } = &chunk {
                            text_id.clone_from(id);
                        }
                        if let Some(hook) = &on_chunk { hook(&chunk); }
                        yield Ok(chunk);
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            let result = match (failure, outcome) {
                (Some(err), _) => Err(err),
                (None, Some(outcome)) => Ok(outcome),
                // Provider stream ended without a finish chunk; finalize
                // with what accumulated so the invariants still hold.
                (None, None) => pipeline.finalize(&ctx).await.map(|finalized| StreamOutcome {
                    text: finalized.text,
                    usage: Usage::zero(),
                    finish_reason: FinishReason::Stop,
                }),
            };

            on_complete(result.clone()).await;
            if let Err(err) = &result {
                yield Err(err.clone());
            }
            let _ = outcome_tx.send(result);
        });

        Ok(TextStream {
            operation_id,
            conversation_id,
            stream,
            outcome: outcome_rx,
        })
    }

    /// Run an object generation to completion.
    ///
    /// The model is constrained by the schema of `T`; the returned value
    /// is validated by deserializing into `T`, and a mismatch surfaces as
    /// `MODEL_OUTPUT_INVALID`. Output guardrails are text-oriented and do
    /// not run on object results.
    pub async fn generate_object<T>(
        &self,
        request: GenerateRequest,
        env: EngineContext,
    ) -> Result<EngineObjectOutput<T>>
    where
        T: DeserializeOwned + schemars::JsonSchema + Send,
    {
        let schema = schema_for_type::<T>();
        let on_step = Self::step_callback(&env);
        let token = env.ctx.cancellation().clone();

        let generation = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Self::cancellation_error(&env.ctx)),
            result = self.provider.generate_object(request, schema) => result?,
        };

        let object: T = serde_json::from_value(generation.object.clone())
            .map_err(|err| AgentError::invalid_output(err.to_string()))?;

        on_step(Step::Text {
            content: generation.object.to_string(),
        })
        .await;

        Ok(EngineObjectOutput {
            object,
            raw: generation.object,
            usage: generation.usage,
            finish_reason: generation.finish_reason,
            provider_response: generation.provider_response,
        })
    }

    /// Start a streaming object generation.
    ///
    /// Deltas carry the object's serialization and are passed through
    /// untouched (text guardrails would corrupt the JSON); on finish the
    /// accumulated text is validated against `T`.
    pub async fn stream_object<T>(
        &self,
        request: GenerateRequest,
        env: EngineContext,
        on_complete: CompletionHandler,
    ) -> Result<ObjectStream<T>>
    where
        T: DeserializeOwned + schemars::JsonSchema + Send + 'static,
    {
        let schema = schema_for_type::<T>();
        let on_step = Self::step_callback(&env);
        let token = env.ctx.cancellation().clone();
        let operation_id = env.ctx.operation_id().to_owned();

        let provider_stream = tokio::select! {
            biased;
            () = token.cancelled() => {
                let err = Self::cancellation_error(&env.ctx);
                on_complete(Err(err.clone())).await;
                return Err(err);
            }
            result = self.provider.stream_object(request, schema) => match result {
                Ok(stream) => stream,
                Err(err) => {
                    on_complete(Err(err.clone())).await;
                    return Err(err);
                }
            },
        };

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let ctx = Arc::clone(&env.ctx);
        let on_chunk = env.on_chunk.clone();
        let history = env.history.clone();
        let entry_id = env.ctx.operation_id().to_owned();

        let stream = Box::pin(async_stream::stream! {
            let mut inner = provider_stream;
            let mut accumulated = String::new();
            let mut failure: Option<AgentError> = None;
            let mut finish: Option<(FinishReason, Usage)> = None;

            loop {
                let item = tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        failure = Some(Self::cancellation_error(&ctx));
                        break;
                    }
                    item = inner.next() => item,
                };
                let Some(item) = item else { break };

                match item {
                    Ok(StreamChunk::TextDelta { id, delta }) => {
                        accumulated.push_str(&delta);
                        let chunk = StreamChunk::TextDelta { id, delta };
                        if let Some(hook) = &on_chunk { hook(&chunk); }
                        yield Ok(chunk);
                    }
                    Ok(StreamChunk::Finish { reason, usage }) => {
                        let chunk = StreamChunk::finish(reason, usage);
                        if let Some(hook) = &on_chunk { hook(&chunk); }
                        yield Ok(chunk);
                        finish = Some((reason, usage));
                    }
                    Ok(StreamChunk::Error { message }) => {
                        failure = Some(AgentError::provider(message));
                        break;
                    }
                    Ok(chunk) => {
                        if let Some(hook) = &on_chunk { hook(&chunk); }
                        yield Ok(chunk);
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            let result = match failure {
                Some(err) => Err(err),
                None => {
                    let (finish_reason, usage) =
                        finish.unwrap_or((FinishReason::Stop, Usage::zero()));
                    match serde_json::from_str::<T>(&accumulated) {
                        Ok(object) => {
                            history.record_step(&entry_id, Step::Text {
                                content: accumulated.clone(),
                            }).await;
                            Ok((object, usage, finish_reason))
                        }
                        Err(err) => Err(AgentError::invalid_output(err.to_string())),
                    }
                }
            };

            match result {
                Ok((object, usage, finish_reason)) => {
                    on_complete(Ok(StreamOutcome {
                        text: accumulated,
                        usage,
                        finish_reason,
                    }))
                    .await;
                    let _ = outcome_tx.send(Ok(ObjectOutcome {
                        object,
                        usage,
                        finish_reason,
                    }));
                }
                Err(err) => {
                    on_complete(Err(err.clone())).await;
                    yield Err(err.clone());
                    let _ = outcome_tx.send(Err(err));
                }
            }
        });

        Ok(ObjectStream {
            operation_id,
            stream,
            outcome: outcome_rx,
        })
    }
}

impl std::fmt::Debug for GenerationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationEngine")
            .field("model", &self.provider.model_identifier())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::guardrail::builtins::EmailRedactor;
    use crate::history::{EntryStatus, HistoryEntry};
    use crate::memory::MemoryManager;
    use crate::memory::in_memory::InMemoryBackend;
    use crate::provider::mock::{MockProvider, MockTurn};
    use chrono::Utc;

    async fn engine_context(guardrails: Vec<Arc<dyn OutputGuardrail>>) -> EngineContext {
        let backend = Arc::new(InMemoryBackend::new());
        let history = HistoryManager::new(backend, "agent-1", 0);
        history
            .add_entry(HistoryEntry {
                id: "op-1".into(),
                agent_id: "agent-1".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                status: EntryStatus::Working,
                input: "q".into(),
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

        let ctx = Arc::new(OperationContext::new("op-1", "agent-1"));
        let bus = Arc::new(EventBus::new());
        let memory = MemoryManager::new(None, bus, "agent-1");
        let writer = Arc::new(memory.step_writer(&ctx, None, None));
        EngineContext {
            ctx,
            history,
            memory_writer: writer,
            output_guardrails: guardrails,
            on_step_finish: None,
            on_chunk: None,
        }
    }

    fn noop_complete() -> CompletionHandler {
        Box::new(|_| Box::pin(async {}))
    }

    #[tokio::test]
    async fn generate_text_records_steps_and_applies_guardrails() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::text(
            "write to ops@example.com",
        )]));
        let engine = GenerationEngine::new(provider);
        let env = engine_context(vec![Arc::new(EmailRedactor::new())]).await;
        let history = env.history.clone();

        let output = engine
            .generate_text(GenerateRequest::new(vec![]), env)
            .await
            .unwrap();

        assert_eq!(output.text, "write to [redacted-email]");
        assert_eq!(output.original_text, "write to ops@example.com");

        let entry = history.get_entry("op-1").await.unwrap().unwrap();
        assert_eq!(entry.steps.len(), 1);
        assert!(entry.steps[0].is_text());
    }

    #[tokio::test]
    async fn stream_text_sanitizes_deltas_and_resolves_text() {
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::text("mail ops@example.com now")
                .with_text_chunks(["mail ops", "@example.", "com now"]),
        ]));
        let engine = GenerationEngine::new(provider);
        let env = engine_context(vec![Arc::new(EmailRedactor::new())]).await;

        let stream = engine
            .stream_text(GenerateRequest::new(vec![]), env, None, noop_complete())
            .await
            .unwrap();
        let outcome = stream.finish().await.unwrap();
        assert_eq!(outcome.text, "mail [redacted-email] now");
        assert!(!outcome.text.contains("ops@example.com"));
    }

    #[tokio::test]
    async fn cancellation_before_generation_surfaces_cancelled() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::text("never")]));
        let engine = GenerationEngine::new(provider);
        let env = engine_context(vec![]).await;
        env.ctx.cancel("caller went away");

        let err = engine
            .generate_text(GenerateRequest::new(vec![]), env)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert!(err.to_string().contains("caller went away"));
    }

    #[tokio::test]
    async fn generate_object_validates_against_schema() {
        #[derive(serde::Deserialize, schemars::JsonSchema)]
        struct Weather {
            temp: i64,
            condition: String,
        }

        let provider = Arc::new(MockProvider::new(vec![MockTurn::object(
            serde_json::json!({"temp": 68, "condition": "sunny"}),
        )]));
        let engine = GenerationEngine::new(provider);
        let env = engine_context(vec![]).await;

        let output = engine
            .generate_object::<Weather>(GenerateRequest::new(vec![]), env)
            .await
            .unwrap();
        assert_eq!(output.object.temp, 68);
        assert_eq!(output.object.condition, "sunny");
    }

    #[tokio::test]
    async fn schema_mismatch_is_model_output_invalid() {
        #[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
        struct Weather {
            #[allow(dead_code)]
            temp: i64,
        }

        let provider = Arc::new(MockProvider::new(vec![MockTurn::object(
            serde_json::json!({"temperature": "warm"}),
        )]));
        let engine = GenerationEngine::new(provider);
        let env = engine_context(vec![]).await;

        let err = engine
            .generate_object::<Weather>(GenerateRequest::new(vec![]), env)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MODEL_OUTPUT_INVALID");
    }

    #[tokio::test]
    async fn stream_object_parses_accumulated_json() {
        #[derive(serde::Deserialize, schemars::JsonSchema)]
        struct Point {
            x: i64,
            y: i64,
        }

        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::object(serde_json::json!({"x": 1, "y": 2}))
                .with_text_chunks([r#"{"x"#, r#"": 1, "y": 2}"#]),
        ]));
        let engine = GenerationEngine::new(provider);
        let env = engine_context(vec![]).await;

        let stream = engine
            .stream_object::<Point>(GenerateRequest::new(vec![]), env, noop_complete())
            .await
            .unwrap();
        let outcome = stream.finish().await.unwrap();
        assert_eq!(outcome.object.x, 1);
        assert_eq!(outcome.object.y, 2);
    }
}
