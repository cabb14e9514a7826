// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use http_body_util::{BodyExt, Full, Limited};
use hyper::{
    body::{Bytes, Incoming},
    header,
    http::{self, HeaderMap},
    Response, StatusCode,
};
use serde_json::json;
use tracing::{debug, error, warn};

pub type HttpResponse = Response<Full<Bytes>>;

/// Why a trace request was refused before its body was decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: &'static str,
}

/// Logs `message` and answers with `"OK"` on success or `{"error": message}`
/// otherwise. Client errors log at warn, server errors at error.
pub fn json_response(message: &str, status: StatusCode) -> http::Result<HttpResponse> {
    let body = if status.is_success() {
        debug!("{message}");
        json!("OK")
    } else {
        if status.is_client_error() {
            warn!("{message}");
        } else {
            error!("{message}");
        }
        json!({ "error": message })
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
}

pub fn not_found() -> HttpResponse {
    let mut resp = Response::default();
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

/// Chunked requests pass; their size is enforced by [`read_body`].
pub fn check_content_length(headers: &HeaderMap, max_bytes: usize) -> Result<(), Rejection> {
    let Some(value) = headers.get(header::CONTENT_LENGTH) else {
        if headers.contains_key(header::TRANSFER_ENCODING) {
            return Ok(());
        }
        return Err(Rejection {
            status: StatusCode::LENGTH_REQUIRED,
            reason: "missing Content-Length and Transfer-Encoding header",
        });
    };
    let length = value
        .to_str()
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or(Rejection {
            status: StatusCode::BAD_REQUEST,
            reason: "invalid Content-Length header",
        })?;
    if length > max_bytes {
        return Err(Rejection {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            reason: "payload too large",
        });
    }
    Ok(())
}

/// Reads the whole body, failing once more than `max_len` bytes arrive.
pub async fn read_body(body: Incoming, max_len: usize) -> Result<Bytes, String> {
    Limited::new(body, max_len)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| e.to_string())
}

/// The media type of a request without parameters, lowercased.
pub fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}
