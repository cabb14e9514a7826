// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while talking to vCenter.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{operation} request failed: {source}")]
    Request {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} returned status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("{operation} fault: {message}")]
    Fault {
        operation: &'static str,
        message: String,
    },

    #[error("{0} rejected: session is not authenticated")]
    NotAuthenticated(&'static str),

    #[error("malformed {operation} response: {reason}")]
    Malformed {
        operation: &'static str,
        reason: String,
    },

    #[error("unsupported managed object type {0}")]
    UnsupportedType(String),
}

impl GatewayError {
    pub fn malformed(operation: &'static str, reason: impl Into<String>) -> Self {
        GatewayError::Malformed {
            operation,
            reason: reason.into(),
        }
    }
}

/// Errors raised while parsing an inventory filter expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unknown identifier {0}, expected Datacenter or Cluster")]
    UnknownIdentifier(String),

    #[error("unexpected {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str },
}
