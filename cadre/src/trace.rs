//! Trace context seam for span export.
//!
//! The core opens a span per tool invocation and (through the orchestrator)
//! per operation, but it never talks to an exporter directly. Host code
//! supplies a [`TraceContext`] implementation; the default
//! [`NoopTraceContext`] discards everything and is used when tracing export
//! is not configured. Structured logging via `tracing` happens regardless.

use serde_json::Value;

/// Outcome recorded when a span ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    /// The spanned work completed normally.
    Ok,
    /// The spanned work failed.
    Error,
}

/// Kind of a span, mirroring the usual client/internal distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanKind {
    /// Work internal to the process (operation lifecycle).
    #[default]
    Internal,
    /// An outbound call (tool execution, provider round).
    Client,
}

/// An open span handle.
///
/// Spans are created by [`TraceContext::child_span`] and must be ended
/// exactly once; the tool wrapper guarantees this on both success and error
/// paths. Dropping an unended span is an exporter-defined behavior.
pub trait TraceSpan: Send + Sync {
    /// End the span with a status and optional structured data.
    fn end(&self, status: SpanStatus, data: Option<Value>);
}

/// Factory for spans tied to one operation.
pub trait TraceContext: Send + Sync {
    /// Create a child span under this operation's root.
    fn child_span(&self, name: &str, kind: SpanKind, attributes: Value) -> Box<dyn TraceSpan>;
}

/// A trace context that discards all spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceContext;

struct NoopSpan;

impl TraceSpan for NoopSpan {
    fn end(&self, _status: SpanStatus, _data: Option<Value>) {}
}

impl TraceContext for NoopTraceContext {
    fn child_span(&self, _name: &str, _kind: SpanKind, _attributes: Value) -> Box<dyn TraceSpan> {
        Box::new(NoopSpan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A span implementation that counts `end` calls, for wrapper tests.
    pub(crate) struct CountingSpan(pub Arc<AtomicUsize>);

    impl TraceSpan for CountingSpan {
        fn end(&self, _status: SpanStatus, _data: Option<Value>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_span_ends_quietly() {
        let ctx = NoopTraceContext;
        let span = ctx.child_span("tool.search", SpanKind::Client, serde_json::json!({}));
        span.end(SpanStatus::Ok, None);
    }

    #[test]
    fn counting_span_records_end() {
        let counter = Arc::new(AtomicUsize::new(0));
        let span = CountingSpan(Arc::clone(&counter));
        span.end(SpanStatus::Error, Some(serde_json::json!({"error": "x"})));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
