//! Wire contract of the ingestion service: envelope records and the
//! newline-delimited JSON batch codec.

mod envelope;

pub use envelope::{Data, Envelope, RequestData};
pub(crate) use envelope::{REQUEST_BASE_TYPE, REQUEST_ENVELOPE_NAME};

use opentelemetry::{otel_debug, otel_warn};

/// Context-tag keys recognized on the envelope `tags` map.
pub mod context_tags {
    pub const OPERATION_ID: &str = "operationId";
    pub const OPERATION_PARENT_ID: &str = "operationParentId";
    pub const OPERATION_NAME: &str = "operationName";
    pub const APPLICATION_VERSION: &str = "application_Version";
    pub const USER_AUTHENTICATED_ID: &str = "user_AuthenticatedId";
    pub const USER_ID: &str = "user_Id";
    pub const USER_ACCOUNT_ID: &str = "user_AccountId";
    pub const SESSION_ID: &str = "session_Id";
    pub const SESSION_IS_FIRST: &str = "session_IsFirst";
}

/// Serialize a batch as newline-delimited JSON, one envelope per line.
///
/// An envelope that fails to encode is dropped: the buffer rolls back to its
/// pre-write length and the remaining envelopes still serialize.
pub fn serialize_envelopes(envelopes: &[Envelope]) -> Vec<u8> {
    let mut buf = Vec::new();
    for envelope in envelopes {
        let rollback = buf.len();
        match serde_json::to_writer(&mut buf, envelope) {
            Ok(()) => buf.push(b'\n'),
            Err(err) => {
                buf.truncate(rollback);
                otel_warn!(
                    name: "BatchCodec.EnvelopeDropped",
                    reason = format!("{err}")
                );
            }
        }
    }
    buf
}

/// Deserialize a newline-delimited batch. Lines that fail to parse are
/// skipped with a diagnostic and do not abort the rest of the batch.
pub fn deserialize_envelopes(payload: &[u8]) -> Vec<Envelope> {
    payload
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_slice(line) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                otel_debug!(
                    name: "BatchCodec.LineSkipped",
                    reason = format!("{err}")
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    pub(crate) fn sample_envelope(name: &str) -> Envelope {
        Envelope {
            ver: 1,
            name: REQUEST_ENVELOPE_NAME.to_owned(),
            time: "2006-01-02T15:04:05.000000000Z".to_owned(),
            sample_rate: 100.0,
            i_key: "key".to_owned(),
            tags: HashMap::from([(context_tags::OPERATION_ID.to_owned(), "trace".to_owned())]),
            data: Data {
                base_type: REQUEST_BASE_TYPE.to_owned(),
                base_data: RequestData {
                    ver: 2,
                    id: "span".to_owned(),
                    name: name.to_owned(),
                    duration: "0.00:00:01.0000000".to_owned(),
                    response_code: "Success".to_owned(),
                    success: true,
                    properties: HashMap::new(),
                    measurements: HashMap::new(),
                },
            },
        }
    }
}
