//! HTTP transmission of serialized batches and interpretation of the
//! composite ingestion response.

use crate::models::Envelope;
use crate::Error;
use chrono::DateTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{header, Method, Request, Uri};
use opentelemetry::otel_debug;
use opentelemetry_http::HttpClient;
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use std::time::SystemTime;

const CONTENT_TYPE_JSON_STREAM: &str = "application/x-json-stream";

/// Statuses that merit a retry of the whole batch.
const RETRYABLE_STATUS_CODES: [u16; 6] = [206, 408, 429, 439, 500, 503];
/// Statuses that merit a retry of an individual item.
const RETRYABLE_ITEM_STATUS_CODES: [u16; 5] = [408, 429, 439, 500, 503];

/// Decoded ingestion-service response body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendResponse {
    pub items_received: u32,
    pub items_accepted: u32,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

/// Per-item rejection reported inside a partial-success response.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub index: usize,
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

/// Outcome of one transmission attempt.
#[derive(Clone, Debug)]
pub struct TransmissionResult {
    /// HTTP status of the ingestion response.
    pub status_code: u16,
    /// Parsed `Retry-After` header, when present and RFC1123-valid.
    pub retry_after: Option<SystemTime>,
    /// Decoded response body; `None` when absent or unparseable.
    pub response: Option<BackendResponse>,
}

impl TransmissionResult {
    /// Everything was accepted.
    pub fn is_success(&self) -> bool {
        self.status_code == 200
            || (self.status_code == 206
                && self
                    .response
                    .as_ref()
                    .is_some_and(|response| response.items_received == response.items_accepted))
    }

    /// The batch was not (fully) accepted.
    pub fn is_failure(&self) -> bool {
        self.status_code != 200 && self.status_code != 206
    }

    /// A later attempt may succeed, for at least part of the batch.
    pub fn can_retry(&self) -> bool {
        !self.is_success()
            && (self.retry_after.is_some() || RETRYABLE_STATUS_CODES.contains(&self.status_code))
    }

    /// Some items were accepted, some rejected.
    pub fn is_partial_success(&self) -> bool {
        self.status_code == 206
            && self
                .response
                .as_ref()
                .is_some_and(|response| response.items_received != response.items_accepted)
    }

    /// The service asked for backpressure.
    pub fn is_throttled(&self) -> bool {
        self.status_code == 429 || self.status_code == 439 || self.retry_after.is_some()
    }

    /// Whether an individual item rejection is worth retrying.
    pub fn can_retry_item(item: &ItemError) -> bool {
        RETRYABLE_ITEM_STATUS_CODES.contains(&item.status_code)
    }

    /// Extract the retriable remainder of a transmitted payload.
    ///
    /// On a partial success with a decoded body, the retriable lines are
    /// copied out byte for byte (with their parallel item handles) so the
    /// requeued payload is exactly what the service saw. A fully retriable
    /// failure passes the input through unchanged; anything else drops it.
    pub fn get_retry_items(
        &self,
        payload: &[u8],
        items: Vec<Envelope>,
    ) -> (Vec<u8>, Vec<Envelope>) {
        if self.status_code == 206 {
            if let Some(response) = &self.response {
                let mut errors: Vec<&ItemError> = response
                    .errors
                    .iter()
                    .filter(|error| Self::can_retry_item(error))
                    .collect();
                errors.sort_by_key(|error| error.index);

                let lines: Vec<&[u8]> = payload
                    .split(|byte| *byte == b'\n')
                    .filter(|line| !line.is_empty())
                    .collect();

                let mut retry_payload = Vec::new();
                let mut retry_items = Vec::new();
                for error in errors {
                    let Some(line) = lines.get(error.index) else {
                        otel_debug!(
                            name: "Transmitter.RetryIndexOutOfRange",
                            index = error.index as i64
                        );
                        continue;
                    };
                    retry_payload.extend_from_slice(line);
                    retry_payload.push(b'\n');
                    if let Some(item) = items.get(error.index) {
                        retry_items.push(item.clone());
                    }
                }
                return (retry_payload, retry_items);
            }
        }

        if self.can_retry() {
            return (payload.to_vec(), items);
        }

        (Vec::new(), Vec::new())
    }
}

/// Posts gzip-compressed batches to the ingestion endpoint.
///
/// Holds no state beyond the endpoint and the host-provided client; safe to
/// share across tasks.
#[derive(Clone, Debug)]
pub struct Transmitter {
    client: Arc<dyn HttpClient>,
    endpoint: Uri,
}

impl Transmitter {
    pub fn new(client: Arc<dyn HttpClient>, endpoint: Uri) -> Self {
        Transmitter { client, endpoint }
    }

    /// Send one serialized batch and interpret the response.
    ///
    /// Transport-level failures (compression, request building, dispatch)
    /// surface as errors; any HTTP response, success or not, produces a
    /// [`TransmissionResult`].
    pub async fn transmit(&self, payload: &[u8]) -> Result<TransmissionResult, Error> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).map_err(Error::Compress)?;
        let body = encoder.finish().map_err(Error::Compress)?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON_STREAM)
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::ACCEPT_ENCODING, "gzip, deflate")
            .body(body)?;

        let response = self
            .client
            .send(request)
            .await
            .map_err(Error::Transport)?;

        let status_code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);

        let body = response.into_body();
        let response = if body.is_empty() {
            None
        } else {
            match serde_json::from_slice(&body) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    otel_debug!(
                        name: "Transmitter.ResponseBodyUnparseable",
                        reason = format!("{err}")
                    );
                    None
                }
            }
        };

        Ok(TransmissionResult {
            status_code,
            retry_after,
            response,
        })
    }
}

/// Parse an RFC1123 `Retry-After` value, e.g. `Wed, 21 Oct 2015 07:28:00 GMT`.
fn parse_retry_after(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value).ok().map(SystemTime::from)
}
