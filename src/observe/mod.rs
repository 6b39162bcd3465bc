//! Abstract observability sink. The core emits spans for each
//! conversation, turn and adapter call plus policy-decision events;
//! exporters live outside the crate.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Key/value attributes attached to spans, events and metrics.
pub type Attrs<'a> = &'a [(&'a str, String)];

pub trait ObservabilitySink: Send + Sync {
    fn start_span(&self, name: &str, parent: Option<SpanHandle>, attrs: Attrs<'_>) -> SpanHandle;
    fn add_event(&self, span: SpanHandle, name: &str, attrs: Attrs<'_>);
    fn end_span(&self, span: SpanHandle, status: SpanStatus);
    fn record_metric(&self, name: &str, value: f64, attrs: Attrs<'_>);
    fn log(&self, level: LogLevel, message: &str, attrs: Attrs<'_>);
}

/// Sink that drops everything; the default when no exporter is wired in.
#[derive(Default)]
pub struct NoopSink {
    next_id: AtomicU64,
}

impl NoopSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObservabilitySink for NoopSink {
    fn start_span(&self, _name: &str, _parent: Option<SpanHandle>, _attrs: Attrs<'_>) -> SpanHandle {
        SpanHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn add_event(&self, _span: SpanHandle, _name: &str, _attrs: Attrs<'_>) {}

    fn end_span(&self, _span: SpanHandle, _status: SpanStatus) {}

    fn record_metric(&self, _name: &str, _value: f64, _attrs: Attrs<'_>) {}

    fn log(&self, _level: LogLevel, _message: &str, _attrs: Attrs<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink_hands_out_distinct_handles() {
        let sink = NoopSink::new();
        let a = sink.start_span("conversation", None, &[]);
        let b = sink.start_span("turn", Some(a), &[]);
        assert_ne!(a, b);
        sink.end_span(b, SpanStatus::Ok);
        sink.end_span(a, SpanStatus::Error);
    }
}
