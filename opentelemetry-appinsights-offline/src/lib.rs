//! An offline-first Application Insights span exporter for [OpenTelemetry
//! Rust], built for short-lived CLI processes.
//!
//! [OpenTelemetry Rust]: https://github.com/open-telemetry/opentelemetry-rust
//!
//! Nothing is posted while the user waits. Each exported batch is converted
//! into ingestion envelopes and persisted to a disk-backed FIFO queue; a
//! background pass (usually on a later invocation) drains the queue against
//! the ingestion endpoint with retry, partial-success, and throttling
//! semantics. Batches survive crashes and offline machines: enqueueing is an
//! atomic temp-file-plus-rename publish, and items stay visible for the
//! 48-hour ingestion window.
//!
//! # Usage
//!
//! Initialize the pipeline once, trace through the returned tracer, flush on
//! exit, and give the uploader a chance to run:
//!
//! ```no_run
//! use opentelemetry::trace::Tracer as _;
//! use opentelemetry_appinsights_offline::{get_telemetry_system, TelemetryConfig, TelemetrySystem};
//! use opentelemetry_http::HttpClient;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn upload(system: &TelemetrySystem, client: Arc<dyn HttpClient>) {
//!     // No-op when another process already holds the upload lock.
//!     let _ = system
//!         .run_background_upload(client, CancellationToken::new(), false)
//!         .await;
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::new(true, "/var/lib/mycli/telemetry");
//!     if let Some(system) = get_telemetry_system(config) {
//!         system.tracer().in_span("cmd run", |_cx| {
//!             // command executes here
//!         });
//!         let _ = system.shutdown();
//!     }
//! }
//! ```
//!
//! The HTTP client is host-provided via [`opentelemetry_http::HttpClient`],
//! so the exporter works with whatever runtime and TLS stack the host
//! already ships. Enable the **reqwest-client** feature for the
//! [`reqwest`](https://crates.io/crates/reqwest) implementation.
#![warn(missing_debug_implementations, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod attributes;
mod baggage;
mod clock;
mod connection_string;
mod convert;
mod exporter;
mod models;
mod storage;
mod supervisor;
mod transmitter;
mod uploader;

pub use baggage::BaggageSpanProcessor;
pub use clock::{Clock, SystemClock};
pub use connection_string::{parse as parse_connection_string, ConnectionConfig, ParseError};
pub use exporter::{ExportProbe, QueueExporter};
pub use models::{
    context_tags, deserialize_envelopes, serialize_envelopes, Data, Envelope, RequestData,
};
pub use storage::{Queue, StoredItem};
pub use supervisor::{
    get_telemetry_system, TelemetryConfig, TelemetrySystem, COLLECT_TELEMETRY_ENV,
};
pub use transmitter::{BackendResponse, ItemError, TransmissionResult, Transmitter};
pub use uploader::Uploader;

use opentelemetry::trace::ExportError;

/// Errors surfaced by the offline pipeline.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The connection string could not be parsed.
    #[error(transparent)]
    ConnectionString(#[from] connection_string::ParseError),

    /// Queue storage failed past its local retry budget.
    #[error("queue storage failed: {0}")]
    Storage(#[from] std::io::Error),

    /// Compressing the outgoing payload failed.
    #[error("gzip encoding failed: {0}")]
    Compress(std::io::Error),

    /// The outgoing request could not be constructed.
    #[error("building ingestion request failed: {0}")]
    BuildRequest(#[from] http::Error),

    /// The ingestion endpoint URL is invalid.
    #[error("invalid ingestion endpoint: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The HTTP round-trip failed before a response was read.
    #[error("ingestion request failed: {0}")]
    Transport(opentelemetry_http::HttpError),

    /// The operation was cancelled by the host.
    #[error("upload cancelled")]
    Cancelled,

    /// The underlying trace pipeline reported an error.
    #[error("trace pipeline error: {0}")]
    Trace(#[from] opentelemetry::trace::TraceError),
}

impl ExportError for Error {
    fn exporter_name(&self) -> &'static str {
        "appinsights-offline"
    }
}
