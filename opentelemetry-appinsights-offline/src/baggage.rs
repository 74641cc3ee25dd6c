//! Span enrichment from context-scoped baggage.

use opentelemetry::baggage::BaggageExt;
use opentelemetry::trace::{Span as _, TraceResult};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::trace::{Span, SpanProcessor};

/// Copies baggage entries from the active context onto every span as it
/// starts.
///
/// Baggage stays local to the process: this processor is the only point
/// where it becomes visible to the pipeline, and it is never injected into
/// outgoing requests.
#[derive(Debug, Default)]
pub struct BaggageSpanProcessor;

impl BaggageSpanProcessor {
    pub fn new() -> Self {
        BaggageSpanProcessor
    }
}

impl SpanProcessor for BaggageSpanProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        for (key, (value, _metadata)) in cx.baggage().iter() {
            span.set_attribute(KeyValue::new(key.clone(), value.clone()));
        }
    }

    fn on_end(&self, _span: SpanData) {}

    fn force_flush(&self) -> TraceResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> TraceResult<()> {
        Ok(())
    }
}
