//! Span snapshot to envelope conversion.

use crate::models::{context_tags, Data, Envelope, RequestData, REQUEST_BASE_TYPE, REQUEST_ENVELOPE_NAME};
use chrono::{DateTime, SecondsFormat, Utc};
use opentelemetry::trace::Status;
use opentelemetry::{otel_debug, Array, KeyValue, Value};
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

const RESPONSE_CODE_SUCCESS: &str = "Success";
const RESPONSE_CODE_UNKNOWN_FAILURE: &str = "UnknownFailure";

/// Resource attributes routed to context tags instead of properties.
const RESOURCE_CONTEXT_TAG_KEYS: [&str; 1] = [context_tags::APPLICATION_VERSION];

/// Span attributes routed to context tags instead of properties.
const SPAN_CONTEXT_TAG_KEYS: [&str; 5] = [
    context_tags::USER_AUTHENTICATED_ID,
    context_tags::USER_ID,
    context_tags::USER_ACCOUNT_ID,
    context_tags::SESSION_ID,
    context_tags::SESSION_IS_FIRST,
];

/// Convert one finished span into an ingestion envelope.
///
/// The instrumentation key is left empty; the exporter stamps it before
/// serialization.
pub(crate) fn span_to_envelope(span: SpanData, resource: &Resource) -> Envelope {
    let mut tags = HashMap::new();
    tags.insert(
        context_tags::OPERATION_ID.to_owned(),
        span.span_context.trace_id().to_string(),
    );
    tags.insert(
        context_tags::OPERATION_PARENT_ID.to_owned(),
        span.parent_span_id.to_string(),
    );
    tags.insert(
        context_tags::OPERATION_NAME.to_owned(),
        span.name.clone().into_owned(),
    );

    for (key, value) in resource.iter() {
        if RESOURCE_CONTEXT_TAG_KEYS.contains(&key.as_str()) {
            tags.insert(key.as_str().to_owned(), value.to_string());
        }
    }

    let mut properties = HashMap::new();
    let mut measurements = HashMap::new();
    for attribute in &span.attributes {
        if SPAN_CONTEXT_TAG_KEYS.contains(&attribute.key.as_str()) {
            tags.insert(
                attribute.key.as_str().to_owned(),
                attribute.value.to_string(),
            );
        } else {
            set_property_or_measurement(&mut properties, &mut measurements, attribute);
        }
    }

    let (success, response_code) = match &span.status {
        Status::Error { description } => {
            let code = if description.is_empty() {
                RESPONSE_CODE_UNKNOWN_FAILURE.to_owned()
            } else {
                description.clone().into_owned()
            };
            (false, code)
        }
        _ => (true, RESPONSE_CODE_SUCCESS.to_owned()),
    };

    let duration = span
        .end_time
        .duration_since(span.start_time)
        .unwrap_or_default();

    Envelope {
        ver: 1,
        name: REQUEST_ENVELOPE_NAME.to_owned(),
        time: time_to_string(span.start_time),
        sample_rate: 100.0,
        i_key: String::new(),
        tags,
        data: Data {
            base_type: REQUEST_BASE_TYPE.to_owned(),
            base_data: RequestData {
                ver: 2,
                id: span.span_context.span_id().to_string(),
                name: span.name.into_owned(),
                duration: duration_to_string(duration),
                response_code,
                success,
                properties,
                measurements,
            },
        },
    }
}

/// Bucket an attribute by value type: bools and strings become properties,
/// numbers become measurements, and homogeneous arrays are JSON-encoded into
/// properties.
fn set_property_or_measurement(
    properties: &mut HashMap<String, String>,
    measurements: &mut HashMap<String, f64>,
    attribute: &KeyValue,
) {
    let key = attribute.key.as_str().to_owned();
    match &attribute.value {
        Value::Bool(value) => {
            properties.insert(key, value.to_string());
        }
        Value::String(value) => {
            properties.insert(key, value.to_string());
        }
        Value::I64(value) => {
            measurements.insert(key, *value as f64);
        }
        Value::F64(value) => {
            measurements.insert(key, *value);
        }
        Value::Array(array) => match array_to_json(array) {
            Ok(json) => {
                properties.insert(key, json);
            }
            Err(err) => {
                otel_debug!(
                    name: "Convert.AttributeDropped",
                    key = attribute.key.as_str().to_owned(),
                    reason = format!("{err}")
                );
            }
        },
        _ => {
            otel_debug!(
                name: "Convert.AttributeDropped",
                key = attribute.key.as_str().to_owned(),
                reason = "unsupported attribute value type"
            );
        }
    }
}

fn array_to_json(array: &Array) -> serde_json::Result<String> {
    match array {
        Array::Bool(values) => serde_json::to_string(values),
        Array::I64(values) => serde_json::to_string(values),
        Array::F64(values) => serde_json::to_string(values),
        Array::String(values) => {
            let values: Vec<&str> = values.iter().map(|value| value.as_str()).collect();
            serde_json::to_string(&values)
        }
        _ => Ok(String::from("[]")),
    }
}

/// Render a duration as `D.HH:MM:SS.TTTTTTT` where the fraction is in
/// 100-nanosecond ticks.
pub(crate) fn duration_to_string(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    let ticks = (nanos / 100) % 10_000_000;
    let seconds = (nanos / 1_000_000_000) % 60;
    let minutes = (nanos / 60_000_000_000) % 60;
    let hours = (nanos / 3_600_000_000_000) % 24;
    let days = nanos / 86_400_000_000_000;
    format!("{days}.{hours:02}:{minutes:02}:{seconds:02}.{ticks:07}")
}

pub(crate) fn time_to_string(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanContext, SpanId, SpanKind, TraceFlags, TraceId, TraceState};
    use opentelemetry::StringValue;
    use opentelemetry_sdk::trace::{SpanEvents, SpanLinks};
    use std::borrow::Cow;

    pub(crate) fn span_data(attributes: Vec<KeyValue>) -> SpanData {
        let start_time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_136_214_245);
        SpanData {
            span_context: SpanContext::new(
                TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
                SpanId::from(0x00f0_67aa_0ba9_02b7),
                TraceFlags::SAMPLED,
                false,
                TraceState::default(),
            ),
            parent_span_id: SpanId::from(0x00f0_67aa_0ba9_02b8),
            span_kind: SpanKind::Internal,
            name: Cow::Borrowed("cmd run"),
            start_time,
            end_time: start_time + Duration::from_secs(10),
            attributes,
            dropped_attributes_count: 0,
            events: SpanEvents::default(),
            links: SpanLinks::default(),
            status: Status::Unset,
            instrumentation_scope: Default::default(),
        }
    }

    #[test]
    fn maps_identity_and_timing() {
        let envelope = span_to_envelope(span_data(Vec::new()), &Resource::empty());

        assert_eq!(
            envelope.tags[context_tags::OPERATION_ID],
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(
            envelope.tags[context_tags::OPERATION_PARENT_ID],
            "00f067aa0ba902b8"
        );
        assert_eq!(envelope.tags[context_tags::OPERATION_NAME], "cmd run");
        assert_eq!(envelope.data.base_data.id, "00f067aa0ba902b7");
        assert_eq!(envelope.data.base_data.name, "cmd run");
        assert_eq!(envelope.data.base_data.duration, "0.00:00:10.0000000");
        assert_eq!(envelope.time, "2006-01-02T15:04:05.000000000Z");
        assert_eq!(envelope.i_key, "");
    }

    #[test]
    fn unset_status_maps_to_success() {
        let envelope = span_to_envelope(span_data(Vec::new()), &Resource::empty());
        assert!(envelope.data.base_data.success);
        assert_eq!(envelope.data.base_data.response_code, "Success");
    }

    #[test]
    fn error_status_uses_description_as_response_code() {
        let mut span = span_data(Vec::new());
        span.status = Status::error("quota exceeded");
        let envelope = span_to_envelope(span, &Resource::empty());
        assert!(!envelope.data.base_data.success);
        assert_eq!(envelope.data.base_data.response_code, "quota exceeded");
    }

    #[test]
    fn empty_error_description_maps_to_unknown_failure() {
        let mut span = span_data(Vec::new());
        span.status = Status::error("");
        let envelope = span_to_envelope(span, &Resource::empty());
        assert_eq!(envelope.data.base_data.response_code, "UnknownFailure");
    }

    #[test]
    fn attributes_bucket_by_value_type() {
        let attributes = vec![
            KeyValue::new("flag", true),
            KeyValue::new("mode", "incremental"),
            KeyValue::new("files", 42_i64),
            KeyValue::new("elapsed", 1.5_f64),
            KeyValue::new(
                "stages",
                Value::Array(Array::String(vec![
                    StringValue::from("restore"),
                    StringValue::from("build"),
                ])),
            ),
            KeyValue::new("retries", Value::Array(Array::I64(vec![1, 2, 3]))),
        ];
        let envelope = span_to_envelope(span_data(attributes), &Resource::empty());
        let data = &envelope.data.base_data;

        assert_eq!(data.properties["flag"], "true");
        assert_eq!(data.properties["mode"], "incremental");
        assert_eq!(data.measurements["files"], 42.0);
        assert_eq!(data.measurements["elapsed"], 1.5);
        assert_eq!(data.properties["stages"], r#"["restore","build"]"#);
        assert_eq!(data.properties["retries"], "[1,2,3]");
        assert!(!data.properties.contains_key("files"));
        assert!(!data.measurements.contains_key("mode"));
    }

    #[test]
    fn recognized_span_attributes_become_context_tags() {
        let attributes = vec![
            KeyValue::new(context_tags::USER_ID, "machine-1"),
            KeyValue::new(context_tags::SESSION_ID, "session-1"),
            KeyValue::new("other", "stays"),
        ];
        let envelope = span_to_envelope(span_data(attributes), &Resource::empty());

        assert_eq!(envelope.tags[context_tags::USER_ID], "machine-1");
        assert_eq!(envelope.tags[context_tags::SESSION_ID], "session-1");
        assert!(!envelope.data.base_data.properties.contains_key(context_tags::USER_ID));
        assert_eq!(envelope.data.base_data.properties["other"], "stays");
    }

    #[test]
    fn recognized_resource_attributes_become_context_tags() {
        let resource = Resource::new([
            KeyValue::new(context_tags::APPLICATION_VERSION, "1.2.3"),
            KeyValue::new("os.type", "linux"),
        ]);
        let envelope = span_to_envelope(span_data(Vec::new()), &resource);

        assert_eq!(envelope.tags[context_tags::APPLICATION_VERSION], "1.2.3");
        assert!(!envelope.tags.contains_key("os.type"));
        assert!(!envelope.data.base_data.properties.contains_key("os.type"));
    }

    #[test]
    fn duration_formatting_covers_all_fields() {
        let cases = [
            (Duration::from_secs(10), "0.00:00:10.0000000"),
            (Duration::from_millis(1), "0.00:00:00.0010000"),
            (Duration::from_nanos(150), "0.00:00:00.0000001"),
            (
                Duration::from_secs(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5),
                "2.03:04:05.0000000",
            ),
            (Duration::ZERO, "0.00:00:00.0000000"),
        ];
        for (duration, expected) in cases {
            assert_eq!(duration_to_string(duration), expected);
        }
    }
}
