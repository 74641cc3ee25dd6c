//! Process-wide initialization and the background upload/cleanup pass.

use crate::baggage::BaggageSpanProcessor;
use crate::connection_string;
use crate::exporter::{ExportProbe, QueueExporter};
use crate::storage::Queue;
use crate::transmitter::Transmitter;
use crate::uploader::Uploader;
use crate::Error;
use fs2::FileExt;
use http::Uri;
use once_cell::sync::OnceCell;
use opentelemetry::{otel_debug, otel_warn};
use opentelemetry_http::HttpClient;
use opentelemetry_sdk::trace::{Config, Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Environment variable that disables telemetry when set to the literal
/// `"no"`; any other value, or unset, leaves it enabled.
pub const COLLECT_TELEMETRY_ENV: &str = "COLLECT_TELEMETRY";

/// Advisory lock that keeps uploads single-consumer across processes.
const UPLOAD_LOCK_FILE: &str = "upload.lock";

/// How long cleanup may keep running after the upload finishes.
const CLEANUP_GRACE: Duration = Duration::from_secs(5);

/// Connection string used by development builds.
const DEV_CONNECTION_STRING: &str =
    "InstrumentationKey=a9e43b31-5d44-4c92-bc9e-5d7c87f0c6e8";
/// Connection string used by release builds.
const PROD_CONNECTION_STRING: &str = "InstrumentationKey=0f2f7474-4b3a-4d0e-b7f5-6b2a77fb9c2d;IngestionEndpoint=https://dc.applicationinsights.azure.com/";

static SYSTEM: OnceCell<Option<TelemetrySystem>> = OnceCell::new();

/// Host-supplied startup configuration.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    collect_telemetry: bool,
    storage_directory: PathBuf,
    resource: Resource,
    connection_string: Option<String>,
}

impl TelemetryConfig {
    /// `collect_telemetry` is the host's resolved opt-in flag;
    /// `storage_directory` is the queue directory shared by every process on
    /// the machine.
    pub fn new(collect_telemetry: bool, storage_directory: impl Into<PathBuf>) -> Self {
        TelemetryConfig {
            collect_telemetry,
            storage_directory: storage_directory.into(),
            resource: Resource::empty(),
            connection_string: None,
        }
    }

    /// Resource attributes probed by the host at startup (OS version,
    /// machine id, application version, …).
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = resource;
        self
    }

    /// Override the build-dependent connection string.
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }
}

/// Handle to the process-wide telemetry pipeline: the shared queue, the
/// provider wired to the queue exporter, and the upload entry point.
#[derive(Debug)]
pub struct TelemetrySystem {
    queue: Arc<Queue>,
    provider: TracerProvider,
    probe: ExportProbe,
    endpoint: Uri,
    storage_directory: PathBuf,
    export_cancel: CancellationToken,
}

/// One-time initialization of the process-wide telemetry system.
///
/// Returns `None` when the host flag is off, `COLLECT_TELEMETRY=no`, or
/// initialization fails; callers treat `None` as "telemetry disabled".
/// Later calls return the first result regardless of their arguments.
///
/// Must be called from within a Tokio runtime: the batch span processor
/// spawns its worker on it.
pub fn get_telemetry_system(config: TelemetryConfig) -> Option<&'static TelemetrySystem> {
    SYSTEM
        .get_or_init(|| {
            if !config.collect_telemetry || !collection_enabled() {
                otel_debug!(name: "Supervisor.TelemetryDisabled");
                return None;
            }
            match TelemetrySystem::initialize(config) {
                Ok(system) => Some(system),
                Err(err) => {
                    otel_warn!(
                        name: "Supervisor.InitFailed",
                        reason = format!("{err}")
                    );
                    None
                }
            }
        })
        .as_ref()
}

fn collection_enabled() -> bool {
    env::var(COLLECT_TELEMETRY_ENV).map_or(true, |value| value != "no")
}

fn default_connection_string() -> &'static str {
    if cfg!(debug_assertions) {
        DEV_CONNECTION_STRING
    } else {
        PROD_CONNECTION_STRING
    }
}

impl TelemetrySystem {
    /// Build a standalone telemetry system. Most hosts want the
    /// [`get_telemetry_system`] singleton instead.
    pub fn initialize(config: TelemetryConfig) -> Result<Self, Error> {
        let connection = connection_string::parse(
            config
                .connection_string
                .as_deref()
                .unwrap_or_else(|| default_connection_string()),
        )?;
        let queue = Arc::new(Queue::open(&config.storage_directory)?);
        let export_cancel = CancellationToken::new();
        let exporter = QueueExporter::new(queue.clone(), connection.instrumentation_key)
            .with_cancellation(export_cancel.clone());
        let probe = exporter.export_probe();
        let provider = TracerProvider::builder()
            .with_config(Config::default().with_resource(config.resource))
            .with_span_processor(BaggageSpanProcessor::new())
            .with_batch_exporter(exporter, runtime::Tokio)
            .build();

        Ok(TelemetrySystem {
            queue,
            provider,
            probe,
            endpoint: connection.endpoint_url.parse()?,
            storage_directory: config.storage_directory,
            export_cancel,
        })
    }

    /// Tracer for the host's instrumentation.
    pub fn tracer(&self) -> Tracer {
        use opentelemetry::trace::TracerProvider as _;
        self.provider.tracer("opentelemetry-appinsights-offline")
    }

    /// The provider backing [`tracer`](Self::tracer), for hosts that install
    /// it globally.
    pub fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    /// Shared queue handle; the exporter and uploader reference the same
    /// instance.
    pub fn queue(&self) -> Arc<Queue> {
        self.queue.clone()
    }

    /// True once any span batch reached the queue in this process.
    pub fn has_exported(&self) -> bool {
        self.probe.has_exported()
    }

    /// Token that aborts in-flight batch conversion, for hosts that must
    /// exit before a flush can finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.export_cancel.clone()
    }

    /// Upload queued batches and sweep the queue directory.
    ///
    /// Returns immediately with `Ok` when another process already holds the
    /// upload lock. Cleanup runs concurrently with the upload and gets a
    /// bounded grace period once the upload finishes; after that its token
    /// is cancelled.
    pub async fn run_background_upload(
        &self,
        client: Arc<dyn HttpClient>,
        cancel: CancellationToken,
        debug: bool,
    ) -> Result<(), Error> {
        let Some(lock) = try_lock_upload(&self.storage_directory)? else {
            otel_debug!(name: "Supervisor.UploadLockHeld");
            return Ok(());
        };

        let transmitter = Transmitter::new(client, self.endpoint.clone());
        let uploader = Uploader::new(self.queue.clone(), transmitter).with_debug(debug);

        let cleanup_cancel = CancellationToken::new();
        let cleanup = {
            let queue = self.queue.clone();
            let cancel = cleanup_cancel.clone();
            tokio::task::spawn_blocking(move || queue.cleanup(&cancel))
        };

        let result = uploader.upload(&cancel).await;

        if tokio::time::timeout(CLEANUP_GRACE, cleanup).await.is_err() {
            cleanup_cancel.cancel();
        }

        if let Err(err) = lock.unlock() {
            otel_debug!(
                name: "Supervisor.UnlockFailed",
                reason = format!("{err}")
            );
        }
        result
    }

    /// Flush buffered spans through the exporter into the queue and stop the
    /// provider. Enqueue failures surface here.
    pub fn shutdown(&self) -> Result<(), Error> {
        for result in self.provider.force_flush() {
            result?;
        }
        self.provider.shutdown()?;
        Ok(())
    }
}

/// Non-blocking acquisition of the advisory upload lock. `None` means some
/// other process holds it.
fn try_lock_upload(directory: &Path) -> Result<Option<File>, Error> {
    let path = directory.join(UPLOAD_LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(Error::Storage)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(Error::Storage(err)),
    }
}
