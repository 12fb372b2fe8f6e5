//! Streaming chunk types for model operations.
//!
//! Providers deliver streamed output as a sequence of typed [`StreamChunk`]s.
//! The generation engine threads text deltas through the output-guardrail
//! pipeline before re-emitting them, passes tool chunks through unchanged,
//! and folds the whole sequence with a [`StreamAggregator`] to reconstruct
//! the final response.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::usage::Usage;

/// A boxed stream of chunk results, as returned by providers.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Reason why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum FinishReason {
    /// Natural stop (end of response).
    #[default]
    Stop,
    /// Maximum token or step limit reached.
    Length,
    /// Model stopped to call tools.
    ToolCalls,
    /// Content was filtered by the provider's safety systems.
    ContentFilter,
    /// The stream terminated with an error.
    Error,
}

impl FinishReason {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool-calls",
            Self::ContentFilter => "content-filter",
            Self::Error => "error",
        }
    }

    /// Parse a provider-reported finish reason (case-insensitive).
    ///
    /// Accepts the common spellings across providers: `stop`/`end_turn`,
    /// `length`/`max_tokens`, `tool_calls`/`tool-calls`/`tool_use`,
    /// `content_filter`/`content-filter`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "length" | "max_tokens" => Self::Length,
            "tool-calls" | "tool_calls" | "tool_use" => Self::ToolCalls,
            "content-filter" | "content_filter" => Self::ContentFilter,
            "error" => Self::Error,
            _ => Self::Stop,
        }
    }

    /// Returns `true` if the model was cut off by a limit.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self, Self::Length)
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed chunk of a streamed model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum StreamChunk {
    /// A new text block has started.
    TextStart {
        /// Identifier of the text block.
        id: String,
    },

    /// Incremental text content.
    TextDelta {
        /// Identifier of the text block this delta belongs to.
        id: String,
        /// The text fragment.
        delta: String,
    },

    /// The model issued a tool call.
    ToolCall {
        /// Tool call id.
        id: String,
        /// Name of the tool being called.
        name: String,
        /// Arguments for the call.
        arguments: serde_json::Value,
    },

    /// A tool call completed and its result was fed back to the model.
    ToolResult {
        /// Tool call id this result belongs to.
        id: String,
        /// Name of the tool.
        name: String,
        /// Result value, or the error message when `is_error` is set.
        result: serde_json::Value,
        /// Whether the tool failed.
        #[serde(default)]
        is_error: bool,
    },

    /// The stream finished.
    Finish {
        /// Why the model stopped.
        reason: FinishReason,
        /// Token usage for the whole operation.
        usage: Usage,
    },

    /// An error occurred mid-stream.
    Error {
        /// The error message.
        message: String,
    },
}

impl StreamChunk {
    /// Creates a text delta chunk.
    #[must_use]
    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    /// Creates a finish chunk.
    #[must_use]
    pub const fn finish(reason: FinishReason, usage: Usage) -> Self {
        Self::Finish { reason, usage }
    }

    /// Returns the delta text if this is a text-delta chunk.
    #[must_use]
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::TextDelta { delta, .. } => Some(delta),
            _ => None,
        }
    }

    /// Returns `true` if this is a text-delta chunk.
    #[must_use]
    pub const fn is_text_delta(&self) -> bool {
        matches!(self, Self::TextDelta { .. })
    }

    /// Returns `true` if this is a finish chunk.
    #[must_use]
    pub const fn is_finish(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

/// Aggregator folding stream chunks into the final response parts.
#[derive(Debug, Clone, Default)]
pub struct StreamAggregator {
    text: String,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
    tool_call_ids: Vec<String>,
}

impl StreamAggregator {
    /// Creates a new aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a stream chunk to the aggregator.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::TextDelta { delta, .. } => self.text.push_str(delta),
            StreamChunk::ToolCall { id, .. } => self.tool_call_ids.push(id.clone()),
            StreamChunk::Finish { reason, usage } => {
                self.finish_reason = Some(*reason);
                self.usage = Some(*usage);
            }
            StreamChunk::TextStart { .. }
            | StreamChunk::ToolResult { .. }
            | StreamChunk::Error { .. } => {}
        }
    }

    /// The accumulated text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The reported usage, if a finish chunk was seen.
    #[must_use]
    pub const fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// The reported finish reason, if a finish chunk was seen.
    #[must_use]
    pub const fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Tool call ids observed in the stream, in arrival order.
    #[must_use]
    pub fn tool_call_ids(&self) -> &[String] {
        &self.tool_call_ids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    mod finish_reason {
        use super::*;

        #[test]
        fn parse_common_spellings() {
            assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
            assert_eq!(FinishReason::parse("end_turn"), FinishReason::Stop);
            assert_eq!(FinishReason::parse("length"), FinishReason::Length);
            assert_eq!(FinishReason::parse("max_tokens"), FinishReason::Length);
            assert_eq!(FinishReason::parse("tool_calls"), FinishReason::ToolCalls);
            assert_eq!(FinishReason::parse("tool_use"), FinishReason::ToolCalls);
            assert_eq!(
                FinishReason::parse("content_filter"),
                FinishReason::ContentFilter
            );
        }

        #[test]
        fn unknown_defaults_to_stop() {
            assert_eq!(FinishReason::parse("whatever"), FinishReason::Stop);
        }

        #[test]
        fn serde_uses_kebab_case() {
            let json = serde_json::to_string(&FinishReason::ToolCalls).unwrap();
            assert_eq!(json, r#""tool-calls""#);
        }

        #[test]
        fn truncation() {
            assert!(FinishReason::Length.is_truncated());
            assert!(!FinishReason::Stop.is_truncated());
        }
    }

    mod stream_chunk {
        use super::*;

        #[test]
        fn text_delta_accessors() {
            let chunk = StreamChunk::text_delta("t0", "Hello");
            assert!(chunk.is_text_delta());
            assert_eq!(chunk.as_text_delta(), Some("Hello"));
            assert!(!chunk.is_finish());
        }

        #[test]
        fn serde_tags_are_kebab_case() {
            let json = serde_json::to_string(&StreamChunk::TextStart { id: "t0".into() }).unwrap();
            assert!(json.contains(r#""type":"text-start""#));

            let json = serde_json::to_string(&StreamChunk::text_delta("t0", "x")).unwrap();
            assert!(json.contains(r#""type":"text-delta""#));

            let json = serde_json::to_string(&StreamChunk::ToolResult {
                id: "c1".into(),
                name: "t".into(),
                result: serde_json::json!(1),
                is_error: false,
            })
            .unwrap();
            assert!(json.contains(r#""type":"tool-result""#));
        }

        #[test]
        fn serde_roundtrip() {
            let chunk = StreamChunk::finish(FinishReason::Stop, Usage::new(5, 3));
            let json = serde_json::to_string(&chunk).unwrap();
            let parsed: StreamChunk = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, chunk);
        }
    }

    mod aggregator {
        use super::*;

        #[test]
        fn accumulates_text_in_order() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::TextStart { id: "t0".into() });
            agg.apply(&StreamChunk::text_delta("t0", "Hello "));
            agg.apply(&StreamChunk::text_delta("t0", "World"));
            assert_eq!(agg.text(), "Hello World");
        }

        #[test]
        fn finish_records_usage_and_reason() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::finish(FinishReason::Length, Usage::new(9, 4)));
            assert_eq!(agg.finish_reason(), Some(FinishReason::Length));
            assert_eq!(agg.usage().unwrap().total_tokens, 13);
        }

        #[test]
        fn tracks_tool_call_ids() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::ToolCall {
                id: "c1".into(),
                name: "search".into(),
                arguments: serde_json::json!({}),
            });
            agg.apply(&StreamChunk::ToolResult {
                id: "c1".into(),
                name: "search".into(),
                result: serde_json::json!("ok"),
                is_error: false,
            });
            assert_eq!(agg.tool_call_ids(), ["c1"]);
        }
    }
}
