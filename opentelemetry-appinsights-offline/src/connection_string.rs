//! Ingestion connection-string parsing.
//!
//! A connection string is a `;`-delimited list of case-sensitive `Key=Value`
//! settings, e.g. `InstrumentationKey=…;EndpointSuffix=monitor.example.com`.

use std::collections::HashMap;

const INSTRUMENTATION_KEY: &str = "InstrumentationKey";
const INGESTION_ENDPOINT: &str = "IngestionEndpoint";
const ENDPOINT_SUFFIX: &str = "EndpointSuffix";

const DEFAULT_INGESTION_HOST: &str = "https://dc.services.visualstudio.com";
const TRACK_PATH: &str = "/v2/track";

/// Parsed connection settings: the instrumentation key plus the final
/// ingestion URL (base endpoint with `/v2/track` appended).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Instrumentation key stamped onto every envelope.
    pub instrumentation_key: String,
    /// Fully resolved ingestion URL.
    pub endpoint_url: String,
}

/// Errors from connection-string parsing.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// A segment was not a `key=value` pair with a non-empty key.
    #[error("invalid connection string setting: {0:?}")]
    InvalidSetting(String),

    /// The `InstrumentationKey` setting is required.
    #[error("connection string is missing an instrumentation key")]
    MissingInstrumentationKey,
}

/// Parse a connection string into a [`ConnectionConfig`].
///
/// When both `IngestionEndpoint` and `EndpointSuffix` are present the
/// explicit endpoint wins. The suffix form is normalized (leading dots and
/// trailing slashes stripped) and prefixed with the `dc.` ingestion host.
pub fn parse(connection_string: &str) -> Result<ConnectionConfig, ParseError> {
    let mut settings = HashMap::new();
    for segment in connection_string.split(';') {
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment
            .split_once('=')
            .ok_or_else(|| ParseError::InvalidSetting(segment.to_owned()))?;
        if key.is_empty() {
            return Err(ParseError::InvalidSetting(segment.to_owned()));
        }
        settings.insert(key, value);
    }

    let instrumentation_key = *settings
        .get(INSTRUMENTATION_KEY)
        .ok_or(ParseError::MissingInstrumentationKey)?;

    let base = match settings.get(INGESTION_ENDPOINT) {
        Some(endpoint) => (*endpoint).to_owned(),
        None => match settings.get(ENDPOINT_SUFFIX) {
            Some(suffix) => {
                let suffix = suffix.trim_start_matches('.').trim_end_matches('/');
                format!("https://dc.{suffix}")
            }
            None => DEFAULT_INGESTION_HOST.to_owned(),
        },
    };

    Ok(ConnectionConfig {
        instrumentation_key: instrumentation_key.to_owned(),
        endpoint_url: format!("{}{}", base.trim_end_matches('/'), TRACK_PATH),
    })
}
