// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Errors raised while handing telemetry to a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The batch could not be encoded. Data is dropped.
    #[error("failed to prepare payload: {0}")]
    Payload(String),

    /// The ingest endpoint could not be reached or answered with a non-2xx
    /// status. The body is kept verbatim.
    #[error("error shipping to {url}: {status:?} {body}")]
    Destination {
        status: Option<StatusCode>,
        url: String,
        body: String,
    },

    #[error("sink cancelled")]
    Cancelled,

    #[error("sink closed")]
    Closed,
}

impl SinkError {
    pub fn is_permanent(&self) -> bool {
        match self {
            SinkError::Payload(_) => true,
            SinkError::Destination { status, .. } => {
                status.is_some_and(|code| code.is_client_error())
            }
            SinkError::Cancelled | SinkError::Closed => false,
        }
    }
}

/// Errors raised while validating or applying a monitor configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("could not decode monitor config: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the monitor registry and manager.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("unknown monitor type: {0}")]
    UnknownType(String),

    #[error("monitor {monitor_type} failed to configure: {source}")]
    Configure {
        monitor_type: String,
        #[source]
        source: ConfigError,
    },

    #[error("monitor type {0} is already registered")]
    DuplicateType(String),

    #[error("monitor does not support on-demand collection")]
    CollectUnsupported,

    #[error("collection failed: {0}")]
    Collect(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SinkError::Destination {
            status: Some(StatusCode::BAD_REQUEST),
            url: "https://ingest.example.com/v2/datapoint".to_string(),
            body: "bad token".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "error shipping to https://ingest.example.com/v2/datapoint: Some(400) bad token"
        );
        assert_eq!(
            ConfigError::MissingField("host".into()).to_string(),
            "missing required field: host"
        );
    }

    #[test]
    fn test_permanent_errors() {
        let client_error = SinkError::Destination {
            status: Some(StatusCode::FORBIDDEN),
            url: String::new(),
            body: String::new(),
        };
        let server_error = SinkError::Destination {
            status: Some(StatusCode::BAD_GATEWAY),
            url: String::new(),
            body: String::new(),
        };
        let network_error = SinkError::Destination {
            status: None,
            url: String::new(),
            body: String::new(),
        };
        assert!(client_error.is_permanent());
        assert!(!server_error.is_permanent());
        assert!(!network_error.is_permanent());
        assert!(SinkError::Payload("x".into()).is_permanent());
    }
}
