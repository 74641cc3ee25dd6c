//! Disk-backed FIFO queue for serialized telemetry batches.
//!
//! Each item is one file. The committed name encodes the ready time, the
//! retry count, and a unique suffix: `YYYYMMDDThhmmss_R_SUFFIX.trn`. Writers
//! stage payloads in a `.tmp` file and publish with an atomic rename, so a
//! crash mid-enqueue never leaves a partially visible item. Multiple
//! producers are safe; the upload lock keeps consumers single.

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, NaiveDateTime, Utc};
use opentelemetry::{otel_debug, otel_warn};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

const DEFAULT_EXTENSION: &str = "trn";
const TEMP_EXTENSION: &str = "tmp";
const STAGE_PREFIX: &str = "stage-";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// How long a staged `.tmp` file may sit before cleanup deletes it.
const TEMP_FILE_TTL: Duration = Duration::from_secs(5 * 60);

/// Ingestion window: items older than this are dropped, the service would
/// reject them anyway.
const ITEM_MAX_TIME_KEPT: Duration = Duration::from_secs(48 * 60 * 60);

/// Handle to a committed queue item returned by [`Queue::peek`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredItem {
    retry_count: u32,
    message: Vec<u8>,
    file_name: PathBuf,
}

impl StoredItem {
    /// Number of transmission attempts already charged to this item.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// The serialized batch carried by the item.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Absolute path of the backing file.
    pub fn file_name(&self) -> &Path {
        &self.file_name
    }
}

/// Parsed committed file name: `timestamp_retries_suffix.ext`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ItemName {
    ready_time: SystemTime,
    retry_count: u32,
}

/// Disk-backed multi-producer / single-consumer FIFO queue.
#[derive(Clone, Debug)]
pub struct Queue {
    directory: PathBuf,
    extension: &'static str,
    item_max_time_kept: Duration,
    temp_file_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl Queue {
    /// Open the queue at `directory`, creating the directory if missing.
    pub fn open(directory: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_clock(directory, Arc::new(SystemClock))
    }

    pub(crate) fn with_clock(
        directory: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let directory = directory.into();
        create_queue_directory(&directory)?;
        Ok(Queue {
            directory,
            extension: DEFAULT_EXTENSION,
            item_max_time_kept: ITEM_MAX_TIME_KEPT,
            temp_file_ttl: TEMP_FILE_TTL,
            clock,
        })
    }

    /// Enqueue a message, visible immediately.
    pub fn enqueue(&self, message: &[u8]) -> io::Result<()> {
        self.enqueue_with_delay(message, Duration::ZERO, 0)
    }

    /// Enqueue a message that becomes visible after `delay`, carrying a
    /// pre-existing retry count. Used by the uploader when requeueing.
    ///
    /// The payload is written to a uniquely named `.tmp` file first; the
    /// rename onto the committed name is the atomic publish point. The
    /// committed suffix is derived from the staged file's generated name, so
    /// concurrent producers cannot collide.
    pub fn enqueue_with_delay(
        &self,
        message: &[u8],
        delay: Duration,
        retry_count: u32,
    ) -> io::Result<()> {
        let mut staged = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .suffix(&format!(".{TEMP_EXTENSION}"))
            .tempfile_in(&self.directory)?;
        staged.write_all(message)?;

        let suffix = staged
            .path()
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.trim_start_matches(STAGE_PREFIX).to_owned())
            .unwrap_or_default();
        let ready_time = self.clock.now() + delay;
        let committed = self.directory.join(format!(
            "{}_{}_{}.{}",
            format_timestamp(ready_time),
            retry_count,
            suffix,
            self.extension
        ));
        staged.persist(committed).map_err(|err| err.error)?;
        Ok(())
    }

    /// Return the oldest visible item, or `None` when nothing is ready.
    ///
    /// Visibility requires `ready_time <= now < ready_time +
    /// item_max_time_kept`. Among visible items the earliest file
    /// modification time wins, which preserves commit order for items whose
    /// names carry the same ready time. The directory is scanned in native
    /// iteration order; name order would sort by ready time instead of
    /// commit time.
    pub fn peek(&self) -> io::Result<Option<StoredItem>> {
        let now = self.clock.now();
        let mut candidate: Option<(SystemTime, PathBuf, u32)> = None;

        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(parsed) = parse_item_name(name, self.extension) else {
                continue;
            };
            let Ok(age) = now.duration_since(parsed.ready_time) else {
                continue; // not ready yet
            };
            if age >= self.item_max_time_kept {
                continue; // expired, cleanup will take it
            }
            let Ok(metadata) = entry.metadata() else {
                continue; // raced with a concurrent remove
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let replace = match &candidate {
                Some((current, _, _)) => modified < *current,
                None => true,
            };
            if replace {
                candidate = Some((modified, entry.path(), parsed.retry_count));
            }
        }

        match candidate {
            Some((_, path, retry_count)) => {
                let message = fs::read(&path)?;
                Ok(Some(StoredItem {
                    retry_count,
                    message,
                    file_name: path,
                }))
            }
            None => Ok(None),
        }
    }

    /// Delete an item's backing file. A missing file is not an error, so a
    /// retried remove stays idempotent.
    pub fn remove(&self, item: &StoredItem) -> io::Result<()> {
        match fs::remove_file(&item.file_name) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Sweep the queue directory: stale staged files, committed files with
    /// unparseable names, and items past their visibility window are
    /// deleted; everything else is left untouched. Checks `cancel` between
    /// entries.
    pub fn cleanup(&self, cancel: &CancellationToken) {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) => {
                otel_warn!(
                    name: "Storage.Cleanup.ScanFailed",
                    reason = format!("{err}")
                );
                return;
            }
        };

        let now = self.clock.now();
        for entry in entries {
            if cancel.is_cancelled() {
                otel_debug!(name: "Storage.Cleanup.Cancelled");
                return;
            }
            let Ok(entry) = entry else {
                continue;
            };
            if let Some(reason) = self.removal_reason(&entry, now) {
                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        otel_debug!(
                            name: "Storage.Cleanup.Removed",
                            file = entry.file_name().to_string_lossy().into_owned(),
                            reason = reason
                        );
                    }
                    Err(err) if err.kind() != io::ErrorKind::NotFound => {
                        otel_warn!(
                            name: "Storage.Cleanup.RemoveFailed",
                            file = entry.file_name().to_string_lossy().into_owned(),
                            reason = format!("{err}")
                        );
                    }
                    Err(_) => {}
                }
            }
        }
    }

    fn removal_reason(&self, entry: &fs::DirEntry, now: SystemTime) -> Option<&'static str> {
        let file_name = entry.file_name();
        let name = file_name.to_str()?;

        if name.ends_with(&format!(".{TEMP_EXTENSION}")) {
            let modified = entry.metadata().ok()?.modified().ok()?;
            let stale = now
                .duration_since(modified)
                .map(|age| age >= self.temp_file_ttl)
                .unwrap_or(false);
            return stale.then_some("stale staged file");
        }

        if !name.ends_with(&format!(".{}", self.extension)) {
            return None;
        }

        match parse_item_name(name, self.extension) {
            None => Some("unparseable item name"),
            Some(parsed) => now
                .duration_since(parsed.ready_time)
                .ok()
                .filter(|age| *age >= self.item_max_time_kept)
                .map(|_| "expired item"),
        }
    }
}

/// The directory is shared by every telemetry-emitting process on the
/// machine, so it is world-readable but owner-writable.
#[cfg(unix)]
fn create_queue_directory(directory: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(directory)
}

#[cfg(not(unix))]
fn create_queue_directory(directory: &Path) -> io::Result<()> {
    fs::create_dir_all(directory)
}

fn format_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(stamp: &str) -> Option<SystemTime> {
    let parsed = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some(SystemTime::from(parsed.and_utc()))
}

fn parse_item_name(file_name: &str, extension: &str) -> Option<ItemName> {
    let stem = file_name.strip_suffix(&format!(".{extension}"))?;
    let mut parts = stem.splitn(3, '_');
    let stamp = parts.next()?;
    let retries = parts.next()?;
    let suffix = parts.next()?;
    if suffix.is_empty() || suffix.contains('_') {
        return None;
    }
    Some(ItemName {
        ready_time: parse_timestamp(stamp)?,
        retry_count: retries.parse().ok()?,
    })
}
