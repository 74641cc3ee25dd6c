//! Queue-draining upload loop.

use crate::clock::{Clock, SystemClock};
use crate::models;
use crate::storage::{Queue, StoredItem};
use crate::transmitter::Transmitter;
use crate::Error;
use opentelemetry::{otel_debug, otel_info, otel_warn};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

/// Highest retry count an item may reach; one past it the item is dropped,
/// so an item is transmitted at most `MAX_RETRY_COUNT + 1` times.
const MAX_RETRY_COUNT: u32 = 3;
/// Delay before the first retransmission attempt.
const FIRST_TRANSMIT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Delay before later retransmission attempts and after transport errors.
const DEFAULT_TRANSMIT_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Local peek/remove retry budget.
const STORAGE_RETRY_ATTEMPTS: u32 = 5;
const STORAGE_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Drains the queue against the ingestion endpoint, one batch at a time.
///
/// The uploader shares the queue handle with the exporter; the supervisor's
/// filesystem lock keeps it the only consumer across processes.
#[derive(Debug)]
pub struct Uploader {
    queue: Arc<Queue>,
    transmitter: Transmitter,
    clock: Arc<dyn Clock>,
    debug: bool,
}

impl Uploader {
    pub fn new(queue: Arc<Queue>, transmitter: Transmitter) -> Self {
        Self::with_clock(queue, transmitter, Arc::new(SystemClock))
    }

    pub(crate) fn with_clock(
        queue: Arc<Queue>,
        transmitter: Transmitter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Uploader {
            queue,
            transmitter,
            clock,
            debug: false,
        }
    }

    /// Deserialize failed payloads for richer diagnostics. Control flow is
    /// unchanged.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Run until the queue has no visible items, `cancel` fires, or storage
    /// keeps failing past its local retry budget.
    pub async fn upload(&self, cancel: &CancellationToken) -> Result<(), Error> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(item) = self.peek_with_retry(cancel).await? else {
                otel_debug!(name: "Uploader.Drained");
                return Ok(());
            };
            self.transmit_item(&item, cancel).await?;
            self.remove_with_retry(&item, cancel).await?;
        }
    }

    async fn transmit_item(
        &self,
        item: &StoredItem,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        match self.transmitter.transmit(item.message()).await {
            Ok(result) if result.is_success() => {
                otel_debug!(name: "Uploader.TransmitSucceeded");
                Ok(())
            }
            Ok(result) if result.can_retry() => {
                if result.is_throttled() {
                    if let Some(retry_after) = result.retry_after {
                        self.wait_until(retry_after, cancel).await?;
                    }
                }
                let delay = match result.retry_after {
                    Some(retry_after) => self.remaining(retry_after),
                    None if item.retry_count() == 0 => FIRST_TRANSMIT_RETRY_DELAY,
                    None => DEFAULT_TRANSMIT_RETRY_DELAY,
                };
                if result.is_partial_success() {
                    let items = models::deserialize_envelopes(item.message());
                    let (payload, retry_items) = result.get_retry_items(item.message(), items);
                    if payload.is_empty() {
                        return Ok(());
                    }
                    otel_debug!(
                        name: "Uploader.RequeuePartial",
                        retriable = retry_items.len() as i64
                    );
                    self.requeue(item, &payload, delay)
                } else {
                    self.requeue(item, item.message(), delay)
                }
            }
            Ok(result) => {
                self.drop_payload(item, "rejected by ingestion service", Some(result.status_code));
                Ok(())
            }
            Err(err) => {
                otel_warn!(
                    name: "Uploader.TransmitFailed",
                    reason = format!("{err}")
                );
                self.requeue(item, item.message(), DEFAULT_TRANSMIT_RETRY_DELAY)
            }
        }
    }

    /// Requeue a payload with its retry count incremented, or drop it once
    /// the budget is spent. Requeue failures are fatal for the session.
    fn requeue(&self, item: &StoredItem, payload: &[u8], delay: Duration) -> Result<(), Error> {
        let retry_count = item.retry_count() + 1;
        if retry_count > MAX_RETRY_COUNT {
            self.drop_payload(item, "retry budget exhausted", None);
            return Ok(());
        }
        self.queue
            .enqueue_with_delay(payload, delay, retry_count)
            .map_err(Error::Storage)
    }

    fn drop_payload(&self, item: &StoredItem, reason: &'static str, status: Option<u16>) {
        otel_warn!(
            name: "Uploader.PayloadDropped",
            reason = reason,
            retry_count = item.retry_count() as i64,
            status_code = status.map(i64::from).unwrap_or(-1)
        );
        if self.debug {
            for envelope in models::deserialize_envelopes(item.message()) {
                otel_debug!(
                    name: "Uploader.DroppedEnvelope",
                    operation_id = envelope
                        .tags
                        .get(models::context_tags::OPERATION_ID)
                        .cloned()
                        .unwrap_or_default(),
                    request_name = envelope.data.base_data.name
                );
            }
        }
    }

    fn remaining(&self, deadline: SystemTime) -> Duration {
        deadline
            .duration_since(self.clock.now())
            .unwrap_or(Duration::ZERO)
    }

    async fn wait_until(
        &self,
        deadline: SystemTime,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let wait = self.remaining(deadline);
        if wait.is_zero() {
            return Ok(());
        }
        otel_info!(
            name: "Uploader.Throttled",
            wait_ms = wait.as_millis() as i64
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    async fn peek_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredItem>, Error> {
        let mut last_err = None;
        for attempt in 0..STORAGE_RETRY_ATTEMPTS {
            if attempt > 0 {
                self.storage_backoff(cancel).await?;
            }
            match self.queue.peek() {
                Ok(item) => return Ok(item),
                Err(err) => last_err = Some(err),
            }
        }
        Err(Error::Storage(last_err.expect("peek attempted at least once")))
    }

    async fn remove_with_retry(
        &self,
        item: &StoredItem,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut last_err = None;
        for attempt in 0..STORAGE_RETRY_ATTEMPTS {
            if attempt > 0 {
                self.storage_backoff(cancel).await?;
            }
            match self.queue.remove(item) {
                Ok(()) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
        }
        Err(Error::Storage(last_err.expect("remove attempted at least once")))
    }

    async fn storage_backoff(&self, cancel: &CancellationToken) -> Result<(), Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(STORAGE_RETRY_DELAY) => Ok(()),
        }
    }
}
