//! Guardrails: validation and transformation of inputs and outputs.
//!
//! - [`InputGuardrail`]s run in declaration order on the raw input before
//!   the model is called. Each may pass, replace the input, or block the
//!   operation (`GUARDRAIL_INPUT_BLOCKED`).
//! - [`OutputGuardrail`]s run on the accumulated output after the model
//!   finishes, receiving both the current (possibly already modified) text
//!   and the original pre-guardrail text. A block turns the operation into
//!   `GUARDRAIL_OUTPUT_BLOCKED`.
//! - Guardrails exposing a [`StreamGuardrail`] additionally process every
//!   streamed text chunk through [`OutputStreamPipeline`], with a
//!   persistent per-guardrail state bag and the ability to abort the
//!   stream.
//!
//! Chunk threading is sequential: each handler sees only the text produced
//! by earlier handlers, and a chunk dropped by one handler (`None`) is not
//! offered to later handlers. Built-in redactors keep a bounded hold
//! window in their state bag so patterns split across chunk boundaries are
//! still caught; held text is flushed at finalize.

pub mod builtins;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::OperationContext;
use crate::error::{AgentError, Result};
use crate::message::OperationInput;

/// Severity attached to a guardrail for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Default severity.
    #[default]
    Warning,
    /// Violations should page someone.
    Critical,
}

/// Decision returned by an input guardrail.
#[derive(Debug, Clone, PartialEq)]
pub enum InputVerdict {
    /// Continue with the input unchanged.
    Pass,
    /// Replace the input and continue with the next guardrail.
    Modify {
        /// The replacement input.
        input: OperationInput,
    },
    /// Stop immediately; the operation fails.
    Block {
        /// Reason attached to the error.
        message: String,
    },
}

/// Decision returned by an output guardrail's terminal handler.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputVerdict {
    /// Continue with the output unchanged.
    Pass,
    /// Replace the output and continue with the next guardrail.
    Modify {
        /// The replacement output.
        output: String,
    },
    /// The operation fails with `GUARDRAIL_OUTPUT_BLOCKED`.
    Block {
        /// Reason attached to the error.
        message: String,
    },
}

/// A validator/transformer over operation input.
#[async_trait]
pub trait InputGuardrail: Send + Sync {
    /// Stable identifier, attached to block errors.
    fn id(&self) -> &str;

    /// Display name; defaults to the id.
    fn name(&self) -> &str {
        self.id()
    }

    /// Severity for observability.
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Inspect (and possibly replace) the input.
    async fn check(&self, input: &OperationInput, ctx: &OperationContext) -> Result<InputVerdict>;
}

/// A validator/transformer over operation output.
#[async_trait]
pub trait OutputGuardrail: Send + Sync {
    /// Stable identifier, attached to block errors.
    fn id(&self) -> &str;

    /// Display name; defaults to the id.
    fn name(&self) -> &str {
        self.id()
    }

    /// Severity for observability.
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Terminal handler over the full accumulated output.
    ///
    /// `output` is the current text after earlier guardrails; `original`
    /// is the pre-guardrail model output.
    async fn check(
        &self,
        output: &str,
        original: &str,
        ctx: &OperationContext,
    ) -> Result<OutputVerdict>;

    /// Streaming handler, when this guardrail participates per-chunk.
    fn stream_handler(&self) -> Option<&dyn StreamGuardrail> {
        None
    }
}

/// Per-guardrail persistent state bag, scoped to one stream.
#[derive(Debug, Clone, Default)]
pub struct GuardrailState(HashMap<String, Value>);

impl GuardrailState {
    /// Creates an empty state bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Read a string value, defaulting to empty.
    #[must_use]
    pub fn get_string(&self, key: &str) -> String {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    }

    /// Read an unsigned integer value, defaulting to zero.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> u64 {
        self.0.get(key).and_then(Value::as_u64).unwrap_or(0)
    }

    /// Store a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }
}

/// Abort capability handed to streaming handlers.
#[derive(Debug, Default)]
pub struct StreamControl {
    abort_reason: Option<String>,
}

impl StreamControl {
    /// Mark the stream as failed with `GUARDRAIL_OUTPUT_BLOCKED`.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason.into());
        }
    }

    pub(crate) fn take_reason(&mut self) -> Option<String> {
        self.abort_reason.take()
    }
}

/// Per-chunk handler of a streaming output guardrail.
///
/// Handlers run synchronously per chunk; a slow handler slows the stream.
/// Returning `None` drops the chunk; no later handler sees it.
pub trait StreamGuardrail: Send + Sync {
    /// Process one chunk.
    fn process_chunk(
        &self,
        chunk: String,
        state: &mut GuardrailState,
        control: &mut StreamControl,
    ) -> Option<String>;

    /// Release any held tail when the stream finalizes.
    fn flush(&self, _state: &mut GuardrailState) -> Option<String> {
        None
    }
}

/// Result of finalizing an [`OutputStreamPipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedStream {
    /// The post-finalize sanitized text.
    pub text: String,
    /// Trailing text to append to the stream as synthetic chunks: held
    /// tails released by handlers plus any terminal-pass diff. Empty on a
    /// repeated finalize.
    pub trailing: Vec<String>,
}

/// Threads streamed text chunks through the output-guardrail chain.
///
/// One pipeline instance is scoped to one stream. After an abort, the
/// failed state is sticky: the aborting and every subsequent call returns
/// the same error.
pub struct OutputStreamPipeline {
    guardrails: Vec<Arc<dyn OutputGuardrail>>,
    states: Vec<GuardrailState>,
    raw: String,
    emitted: String,
    failure: Option<AgentError>,
    finalized: Option<String>,
}

impl OutputStreamPipeline {
    /// Create a pipeline over the declared output guardrails.
    #[must_use]
    pub fn new(guardrails: Vec<Arc<dyn OutputGuardrail>>) -> Self {
        let states = guardrails.iter().map(|_| GuardrailState::new()).collect();
        Self {
            guardrails,
            states,
            raw: String::new(),
            emitted: String::new(),
            failure: None,
            finalized: None,
        }
    }

    /// Whether any guardrail participates per-chunk.
    #[must_use]
    pub fn has_stream_handlers(&self) -> bool {
        self.guardrails
            .iter()
            .any(|g| g.stream_handler().is_some())
    }

    /// The text emitted so far, after guardrails.
    #[must_use]
    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    /// Process one incoming text chunk.
    ///
    /// Returns the (possibly modified) chunk to forward, or `None` when a
    /// handler filtered it out.
    ///
    /// # Errors
    ///
    /// Once any handler aborts, this and all subsequent calls return the
    /// same `GUARDRAIL_OUTPUT_BLOCKED` error.
    pub fn process_part(&mut self, chunk: &str) -> Result<Option<String>> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        self.raw.push_str(chunk);

        let forwarded = self.thread_chunk(chunk.to_owned(), 0)?;
        if let Some(text) = &forwarded {
            self.emitted.push_str(text);
        }
        Ok(forwarded)
    }

    /// Thread a chunk through handlers starting at `from`, recording aborts.
    fn thread_chunk(&mut self, chunk: String, from: usize) -> Result<Option<String>> {
        let mut current = Some(chunk);
        for index in from..self.guardrails.len() {
            let Some(text) = current.take() else { break };
            let Some(handler) = self.guardrails[index].stream_handler() else {
                current = Some(text);
                continue;
            };
            let mut control = StreamControl::default();
            let produced = handler.process_chunk(text, &mut self.states[index], &mut control);
            if let Some(reason) = control.take_reason() {
                let err = AgentError::output_blocked(self.guardrails[index].id(), reason);
                self.failure = Some(err.clone());
                return Err(err);
            }
            current = produced;
        }
        Ok(current)
    }

    /// Finalize the stream.
    ///
    /// Flushes every handler's held tail through the downstream handlers,
    /// then replays the full original output through the terminal handlers
    /// and surfaces any divergence from the streamed text as a trailing
    /// diff. Idempotent: a second call returns the cached text and emits
    /// no extra chunks.
    ///
    /// # Errors
    ///
    /// Returns the sticky abort error if the stream was aborted, or a
    /// block raised by a terminal handler.
    pub async fn finalize(&mut self, ctx: &OperationContext) -> Result<FinalizedStream> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if let Some(text) = &self.finalized {
            return Ok(FinalizedStream {
                text: text.clone(),
                trailing: Vec::new(),
            });
        }

        let mut trailing = Vec::new();

        // Release held tails, threading each through the handlers after it.
        for index in 0..self.guardrails.len() {
            let Some(handler) = self.guardrails[index].stream_handler() else {
                continue;
            };
            let Some(tail) = handler.flush(&mut self.states[index]) else {
                continue;
            };
            if tail.is_empty() {
                continue;
            }
            if let Some(text) = self.thread_chunk(tail, index + 1)?
                && !text.is_empty()
            {
                self.emitted.push_str(&text);
                trailing.push(text);
            }
        }

        // Replay the full output through the terminal handlers. When the
        // streamed text is a prefix of the terminal result, the remainder
        // is surfaced as a trailing diff; when the two diverge mid-text,
        // the streamed form wins (the stream already left the process).
        let terminal = run_output_guardrails(&self.guardrails, &self.raw, ctx).await;
        let terminal = match terminal {
            Ok(text) => text,
            Err(err) => {
                self.failure = Some(err.clone());
                return Err(err);
            }
        };

        let text = if terminal == self.emitted {
            self.emitted.clone()
        } else if let Some(diff) = terminal.strip_prefix(self.emitted.as_str()) {
            if !diff.is_empty() {
                trailing.push(diff.to_owned());
            }
            terminal
        } else {
            debug!("terminal guardrail pass diverged from streamed text; keeping streamed form");
            self.emitted.clone()
        };

        self.finalized = Some(text.clone());
        Ok(FinalizedStream { text, trailing })
    }
}

impl std::fmt::Debug for OutputStreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStreamPipeline")
            .field("guardrails", &self.guardrails.len())
            .field("emitted_len", &self.emitted.len())
            .field("failed", &self.failure.is_some())
            .field("finalized", &self.finalized.is_some())
            .finish_non_exhaustive()
    }
}

/// Run input guardrails in declaration order.
///
/// Returns the (possibly replaced) input.
///
/// # Errors
///
/// `GUARDRAIL_INPUT_BLOCKED` on a block decision, or when a guardrail
/// replaces a message-list input with an incompatible plain string.
pub async fn run_input_guardrails(
    guardrails: &[Arc<dyn InputGuardrail>],
    input: OperationInput,
    ctx: &OperationContext,
) -> Result<OperationInput> {
    let mut current = input;
    for guardrail in guardrails {
        match guardrail.check(&current, ctx).await? {
            InputVerdict::Pass => {}
            InputVerdict::Modify { input: replacement } => {
                if !current.is_text() && replacement.is_text() {
                    // A plain-string replacement cannot stand in for a
                    // message list; treat the modify as a block.
                    return Err(AgentError::input_blocked(
                        guardrail.id(),
                        "guardrail returned an incompatible replacement for a message list",
                    ));
                }
                current = replacement;
            }
            InputVerdict::Block { message } => {
                return Err(AgentError::input_blocked(guardrail.id(), message));
            }
        }
    }
    Ok(current)
}

/// Run the terminal output handlers in declaration order.
///
/// Every guardrail receives the current text and the original pre-guardrail
/// output.
///
/// # Errors
///
/// `GUARDRAIL_OUTPUT_BLOCKED` on a block decision.
pub async fn run_output_guardrails(
    guardrails: &[Arc<dyn OutputGuardrail>],
    output: &str,
    ctx: &OperationContext,
) -> Result<String> {
    let mut current = output.to_owned();
    for guardrail in guardrails {
        match guardrail.check(&current, output, ctx).await? {
            OutputVerdict::Pass => {}
            OutputVerdict::Modify { output: replacement } => current = replacement,
            OutputVerdict::Block { message } => {
                return Err(AgentError::output_blocked(guardrail.id(), message));
            }
        }
    }
    Ok(current)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ctx() -> OperationContext {
        OperationContext::new("op-1", "agent-1")
    }

    /// Output guardrail replacing every occurrence of a needle, both
    /// terminally and per-chunk (no hold window; test helper only).
    struct Replace {
        id: &'static str,
        needle: &'static str,
        replacement: &'static str,
    }

    #[async_trait]
    impl OutputGuardrail for Replace {
        fn id(&self) -> &str {
            self.id
        }

        async fn check(
            &self,
            output: &str,
            _original: &str,
            _ctx: &OperationContext,
        ) -> Result<OutputVerdict> {
            Ok(OutputVerdict::Modify {
                output: output.replace(self.needle, self.replacement),
            })
        }

        fn stream_handler(&self) -> Option<&dyn StreamGuardrail> {
            Some(self)
        }
    }

    impl StreamGuardrail for Replace {
        fn process_chunk(
            &self,
            chunk: String,
            _state: &mut GuardrailState,
            _control: &mut StreamControl,
        ) -> Option<String> {
            Some(chunk.replace(self.needle, self.replacement))
        }
    }

    /// Stream-only guardrail that aborts on a needle.
    struct AbortOn {
        id: &'static str,
        needle: &'static str,
        reason: &'static str,
    }

    #[async_trait]
    impl OutputGuardrail for AbortOn {
        fn id(&self) -> &str {
            self.id
        }

        async fn check(
            &self,
            output: &str,
            _original: &str,
            _ctx: &OperationContext,
        ) -> Result<OutputVerdict> {
            if output.contains(self.needle) {
                Ok(OutputVerdict::Block {
                    message: self.reason.to_owned(),
                })
            } else {
                Ok(OutputVerdict::Pass)
            }
        }

        fn stream_handler(&self) -> Option<&dyn StreamGuardrail> {
            Some(self)
        }
    }

    impl StreamGuardrail for AbortOn {
        fn process_chunk(
            &self,
            chunk: String,
            _state: &mut GuardrailState,
            control: &mut StreamControl,
        ) -> Option<String> {
            if chunk.contains(self.needle) {
                control.abort(self.reason);
                return None;
            }
            Some(chunk)
        }
    }

    mod input_phase {
        use super::*;
        use crate::message::Message;

        struct Upper;

        #[async_trait]
        impl InputGuardrail for Upper {
            fn id(&self) -> &str {
                "upper"
            }

            async fn check(
                &self,
                input: &OperationInput,
                _ctx: &OperationContext,
            ) -> Result<InputVerdict> {
                Ok(InputVerdict::Modify {
                    input: input.as_text().to_uppercase().into(),
                })
            }
        }

        struct BlockAll;

        #[async_trait]
        impl InputGuardrail for BlockAll {
            fn id(&self) -> &str {
                "block-all"
            }

            async fn check(
                &self,
                _input: &OperationInput,
                _ctx: &OperationContext,
            ) -> Result<InputVerdict> {
                Ok(InputVerdict::Block {
                    message: "nope".to_owned(),
                })
            }
        }

        #[tokio::test]
        async fn modify_replaces_input_for_later_guardrails() {
            let guardrails: Vec<Arc<dyn InputGuardrail>> = vec![Arc::new(Upper)];
            let result = run_input_guardrails(&guardrails, "hello".into(), &ctx())
                .await
                .unwrap();
            assert_eq!(result.as_text(), "HELLO");
        }

        #[tokio::test]
        async fn block_carries_guardrail_id() {
            let guardrails: Vec<Arc<dyn InputGuardrail>> = vec![Arc::new(BlockAll)];
            let err = run_input_guardrails(&guardrails, "hello".into(), &ctx())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "GUARDRAIL_INPUT_BLOCKED");
            assert!(err.to_string().contains("block-all"));
        }

        #[tokio::test]
        async fn string_modify_on_message_list_is_a_block() {
            let guardrails: Vec<Arc<dyn InputGuardrail>> = vec![Arc::new(Upper)];
            let input: OperationInput = vec![Message::user("hi")].into();
            let err = run_input_guardrails(&guardrails, input, &ctx())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "GUARDRAIL_INPUT_BLOCKED");
        }
    }

    mod terminal_phase {
        use super::*;

        #[tokio::test]
        async fn guardrails_thread_sequentially_and_see_original() {
            struct AssertOriginal;

            #[async_trait]
            impl OutputGuardrail for AssertOriginal {
                fn id(&self) -> &str {
                    "assert-original"
                }

                async fn check(
                    &self,
                    output: &str,
                    original: &str,
                    _ctx: &OperationContext,
                ) -> Result<OutputVerdict> {
                    // Runs second: sees the first guardrail's replacement
                    // as `output` but the untouched text as `original`.
                    assert_eq!(output, "b");
                    assert_eq!(original, "a");
                    Ok(OutputVerdict::Pass)
                }
            }

            let guardrails: Vec<Arc<dyn OutputGuardrail>> = vec![
                Arc::new(Replace {
                    id: "a-to-b",
                    needle: "a",
                    replacement: "b",
                }),
                Arc::new(AssertOriginal),
            ];
            let result = run_output_guardrails(&guardrails, "a", &ctx()).await.unwrap();
            assert_eq!(result, "b");
        }

        #[tokio::test]
        async fn block_surfaces_output_blocked() {
            let guardrails: Vec<Arc<dyn OutputGuardrail>> = vec![Arc::new(AbortOn {
                id: "banned",
                needle: "secret",
                reason: "contains a secret",
            })];
            let err = run_output_guardrails(&guardrails, "the secret", &ctx())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "GUARDRAIL_OUTPUT_BLOCKED");
        }
    }

    mod streaming_phase {
        use super::*;

        #[tokio::test]
        async fn chunks_thread_through_handlers_in_order() {
            let mut pipeline = OutputStreamPipeline::new(vec![
                Arc::new(Replace {
                    id: "a-to-b",
                    needle: "a",
                    replacement: "b",
                }),
                Arc::new(Replace {
                    id: "b-to-c",
                    needle: "b",
                    replacement: "c",
                }),
            ]);

            let out = pipeline.process_part("aaa").unwrap();
            // First handler rewrites a→b, second rewrites those b's to c.
            assert_eq!(out.as_deref(), Some("ccc"));
            assert_eq!(pipeline.emitted(), "ccc");
        }

        #[tokio::test]
        async fn abort_is_sticky() {
            let mut pipeline = OutputStreamPipeline::new(vec![Arc::new(AbortOn {
                id: "abort",
                needle: "bad",
                reason: "blocked",
            })]);

            assert!(pipeline.process_part("fine ").is_ok());
            let err = pipeline.process_part("bad stuff").unwrap_err();
            assert_eq!(err.code(), "GUARDRAIL_OUTPUT_BLOCKED");

            // Subsequent calls and finalize return the same error.
            let again = pipeline.process_part("anything").unwrap_err();
            assert_eq!(again.code(), "GUARDRAIL_OUTPUT_BLOCKED");
            let fin = pipeline.finalize(&ctx()).await.unwrap_err();
            assert_eq!(fin.code(), "GUARDRAIL_OUTPUT_BLOCKED");
        }

        #[tokio::test]
        async fn terminal_only_guardrail_surfaces_as_trailing_diff() {
            struct Suffix;

            #[async_trait]
            impl OutputGuardrail for Suffix {
                fn id(&self) -> &str {
                    "suffix"
                }

                async fn check(
                    &self,
                    output: &str,
                    _original: &str,
                    _ctx: &OperationContext,
                ) -> Result<OutputVerdict> {
                    Ok(OutputVerdict::Modify {
                        output: format!("{output} [end]"),
                    })
                }
            }

            let mut pipeline = OutputStreamPipeline::new(vec![Arc::new(Suffix)]);
            pipeline.process_part("body").unwrap();

            let finalized = pipeline.finalize(&ctx()).await.unwrap();
            assert_eq!(finalized.text, "body [end]");
            assert_eq!(finalized.trailing, vec![" [end]".to_owned()]);
        }

        #[tokio::test]
        async fn finalize_is_idempotent() {
            let mut pipeline = OutputStreamPipeline::new(vec![Arc::new(Replace {
                id: "a-to-b",
                needle: "a",
                replacement: "b",
            })]);
            pipeline.process_part("abc").unwrap();

            let first = pipeline.finalize(&ctx()).await.unwrap();
            let second = pipeline.finalize(&ctx()).await.unwrap();
            assert_eq!(first.text, second.text);
            assert!(second.trailing.is_empty());
        }

        #[tokio::test]
        async fn dropped_chunk_skips_later_handlers() {
            struct DropAll;

            #[async_trait]
            impl OutputGuardrail for DropAll {
                fn id(&self) -> &str {
                    "drop-all"
                }

                async fn check(
                    &self,
                    _output: &str,
                    _original: &str,
                    _ctx: &OperationContext,
                ) -> Result<OutputVerdict> {
                    Ok(OutputVerdict::Modify {
                        output: String::new(),
                    })
                }

                fn stream_handler(&self) -> Option<&dyn StreamGuardrail> {
                    Some(self)
                }
            }

            impl StreamGuardrail for DropAll {
                fn process_chunk(
                    &self,
                    _chunk: String,
                    _state: &mut GuardrailState,
                    _control: &mut StreamControl,
                ) -> Option<String> {
                    None
                }
            }

            struct Panicky;

            #[async_trait]
            impl OutputGuardrail for Panicky {
                fn id(&self) -> &str {
                    "panicky"
                }

                async fn check(
                    &self,
                    _output: &str,
                    _original: &str,
                    _ctx: &OperationContext,
                ) -> Result<OutputVerdict> {
                    Ok(OutputVerdict::Pass)
                }

                fn stream_handler(&self) -> Option<&dyn StreamGuardrail> {
                    Some(self)
                }
            }

            impl StreamGuardrail for Panicky {
                fn process_chunk(
                    &self,
                    _chunk: String,
                    _state: &mut GuardrailState,
                    _control: &mut StreamControl,
                ) -> Option<String> {
                    panic!("must not run for a dropped chunk");
                }
            }

            let mut pipeline =
                OutputStreamPipeline::new(vec![Arc::new(DropAll), Arc::new(Panicky)]);
            let out = pipeline.process_part("anything").unwrap();
            assert!(out.is_none());
            assert_eq!(pipeline.emitted(), "");
        }
    }
}
