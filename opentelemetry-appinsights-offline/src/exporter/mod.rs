//! Span exporter that persists batches to the disk queue.

use crate::storage::Queue;
use crate::{attributes, convert, models, Error};
use futures_core::future::BoxFuture;
use opentelemetry::otel_debug;
use opentelemetry::trace::{SpanId, TraceError};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use opentelemetry_sdk::Resource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Transient filesystem errors around process exit are absorbed by a short,
/// immediate retry; there is no uploader to come back for a lost batch.
const ENQUEUE_ATTEMPTS: u32 = 3;

/// Converts finished spans into ingestion envelopes and enqueues the
/// serialized batch for the out-of-band uploader.
///
/// The exporter does not own the queue; it shares the handle with the
/// uploader.
#[derive(Debug)]
pub struct QueueExporter {
    queue: Arc<Queue>,
    instrumentation_key: String,
    resource: Resource,
    exported: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl QueueExporter {
    pub fn new(queue: Arc<Queue>, instrumentation_key: impl Into<String>) -> Self {
        QueueExporter {
            queue,
            instrumentation_key: instrumentation_key.into(),
            resource: Resource::empty(),
            exported: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Token checked between span conversions, so a host that is bailing out
    /// early can abandon a long batch.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Shared one-shot "anything exported?" signal. Flips true on the first
    /// successful enqueue and stays readable after the exporter moves into a
    /// provider.
    pub fn export_probe(&self) -> ExportProbe {
        ExportProbe(self.exported.clone())
    }

    fn export_batch(&self, batch: Vec<SpanData>) -> ExportResult {
        let global = attributes::global_snapshot();
        let usage = attributes::usage_snapshot();

        let mut envelopes = Vec::with_capacity(batch.len());
        for mut span in batch {
            if self.cancel.is_cancelled() {
                return Err(TraceError::from("span export cancelled"));
            }
            span.attributes.extend(global.iter().cloned());
            if span.parent_span_id == SpanId::INVALID {
                span.attributes.extend(usage.iter().cloned());
            }
            let mut envelope = convert::span_to_envelope(span, &self.resource);
            envelope.i_key = self.instrumentation_key.clone();
            envelopes.push(envelope);
        }
        if envelopes.is_empty() {
            return Ok(());
        }

        let payload = models::serialize_envelopes(&envelopes);

        let mut last_err = None;
        for _ in 0..ENQUEUE_ATTEMPTS {
            match self.queue.enqueue(&payload) {
                Ok(()) => {
                    self.exported.store(true, Ordering::Relaxed);
                    otel_debug!(
                        name: "QueueExporter.BatchEnqueued",
                        envelopes = envelopes.len() as i64
                    );
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
        }
        let err = last_err.expect("at least one enqueue attempt ran");
        Err(Error::Storage(err).into())
    }
}

/// One-shot "anything exported?" signal shared with the supervisor.
#[derive(Clone, Debug)]
pub struct ExportProbe(Arc<AtomicBool>);

impl ExportProbe {
    pub fn has_exported(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl SpanExporter for QueueExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        // Conversion and the disk write are synchronous; the future is
        // already resolved when it is returned.
        let result = self.export_batch(batch);
        Box::pin(async move { result })
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.resource = resource.clone();
    }
}
