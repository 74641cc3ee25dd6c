use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Envelope name for request telemetry.
pub(crate) const REQUEST_ENVELOPE_NAME: &str = "Microsoft.ApplicationInsights.Request";
/// Base type carried in [`Data::base_type`] for request payloads.
pub(crate) const REQUEST_BASE_TYPE: &str = "RequestData";

/// Outer record posted to the ingestion endpoint, one per span.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ver: i32,
    pub name: String,
    /// Span start time, RFC3339 with nanosecond precision.
    pub time: String,
    pub sample_rate: f64,
    /// Instrumentation key. Stamped by the exporter, not the codec.
    #[serde(rename = "iKey")]
    pub i_key: String,
    /// Context tags (`operationId`, `operationName`, identity tags, …).
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub data: Data,
}

/// Typed payload of an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    pub base_type: String,
    pub base_data: RequestData,
}

/// Request telemetry representing one finished span.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub ver: i32,
    /// Span id.
    pub id: String,
    pub name: String,
    /// `D.HH:MM:SS.TTTTTTT`, ticks are 100ns units.
    pub duration: String,
    pub response_code: String,
    pub success: bool,
    /// String-valued attributes.
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Numeric attributes.
    #[serde(default)]
    pub measurements: HashMap<String, f64>,
}
