// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

/// Header carrying the organization access token on every outbound request.
pub const TOKEN_HEADER: &str = "X-SF-TOKEN";

/// Builds a reqwest client with optional proxy configuration and timeout.
/// `max_idle_per_host` bounds keep-alive connections so the pool matches the
/// writer's request concurrency.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
    max_idle_per_host: usize,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .pool_max_idle_per_host(max_idle_per_host);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

/// Headers shared by every JSON request sent to the backend.
pub fn json_headers(access_token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    // A token with characters invalid in a header is sent without auth and
    // rejected by the backend with a 401, which is logged.
    if let Ok(token) = HeaderValue::from_str(access_token) {
        headers.insert(TOKEN_HEADER, token);
    }
    headers
}

/// Joins a base URL and a path without doubling or dropping slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
