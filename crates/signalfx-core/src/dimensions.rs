// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sends dimension property and tag updates to the REST API.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::datapoint::Dimension;
use crate::errors::SinkError;
use crate::http_utils::{join_url, json_headers, TOKEN_HEADER};
use crate::internal_metrics::{cumulative, InternalMetricsSource};

#[async_trait]
pub trait DimensionUpdater: Send + Sync {
    async fn update(&self, dimension: Dimension) -> Result<(), SinkError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DimensionBody<'a> {
    key: &'a str,
    value: &'a str,
    custom_properties: &'a HashMap<String, String>,
    tags: &'a [String],
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ExistingDimension {
    #[serde(default)]
    custom_properties: HashMap<String, String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default)]
struct DimensionCounters {
    requests_completed: AtomicI64,
    requests_failed: AtomicI64,
    duplicates_skipped: AtomicI64,
}

pub struct DimensionClient {
    client: reqwest::Client,
    api_url: String,
    access_token: String,
    /// What has been synced recently, keyed by (name, value).
    history: Mutex<LruCache<(String, String), Dimension>>,
    permits: Semaphore,
    log_updates: bool,
    counters: DimensionCounters,
}

impl DimensionClient {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        access_token: impl Into<String>,
        history_size: usize,
        max_requests: usize,
        log_updates: bool,
    ) -> Self {
        let capacity = NonZeroUsize::new(history_size).unwrap_or(NonZeroUsize::MIN);
        DimensionClient {
            client,
            api_url: api_url.into(),
            access_token: access_token.into(),
            history: Mutex::new(LruCache::new(capacity)),
            permits: Semaphore::new(max_requests.max(1)),
            log_updates,
            counters: DimensionCounters::default(),
        }
    }

    fn dimension_url(&self, name: &str, value: &str) -> String {
        join_url(&self.api_url, &format!("v2/dimension/{name}/{value}"))
    }

    fn is_duplicate(&self, dimension: &Dimension) -> bool {
        self.history
            .lock()
            .get(&dimension.key())
            .is_some_and(|prev| prev == dimension)
    }

    async fn fetch_existing(&self, name: &str, value: &str) -> Result<ExistingDimension, SinkError> {
        let url = self.dimension_url(name, value);
        let resp = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, &self.access_token)
            .send()
            .await
            .map_err(|e| SinkError::Destination {
                status: e.status(),
                url: url.clone(),
                body: e.to_string(),
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(ExistingDimension::default());
        }
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SinkError::Destination {
                status: Some(status),
                url,
                body: format!("fetching existing dimension: {body}"),
            });
        }
        serde_json::from_str(&body).map_err(|e| {
            SinkError::Payload(format!("could not decode json response body ({e}): {body}"))
        })
    }

    async fn put(&self, dimension: &Dimension) -> Result<(), SinkError> {
        let url = self.dimension_url(&dimension.name, &dimension.value);
        let body = serde_json::to_vec(&DimensionBody {
            key: &dimension.name,
            value: &dimension.value,
            custom_properties: &dimension.properties,
            tags: &dimension.tags,
        })
        .map_err(|e| SinkError::Payload(e.to_string()))?;

        let resp = self
            .client
            .put(&url)
            .headers(json_headers(&self.access_token))
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Destination {
                status: e.status(),
                url: url.clone(),
                body: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(SinkError::Destination {
            status: Some(status),
            url,
            body: resp.text().await.unwrap_or_default(),
        })
    }
}

/// Overlays the new properties on the existing ones and unions the tags.
fn merge_existing(dimension: &Dimension, existing: ExistingDimension) -> Dimension {
    let mut merged = dimension.clone();
    let mut properties = existing.custom_properties;
    properties.extend(dimension.properties.clone());
    merged.properties = properties;

    let tags: BTreeSet<String> = existing
        .tags
        .into_iter()
        .chain(dimension.tags.iter().cloned())
        .collect();
    merged.tags = tags.into_iter().collect();
    merged
}

#[async_trait]
impl DimensionUpdater for DimensionClient {
    async fn update(&self, dimension: Dimension) -> Result<(), SinkError> {
        if self.is_duplicate(&dimension) {
            debug!(name = %dimension.name, value = %dimension.value, "Skipping duplicate dimension update");
            self.counters.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let _permit = self.permits.acquire().await.map_err(|_| SinkError::Closed)?;

        let to_send = if dimension.merge_into_existing {
            let existing = self.fetch_existing(&dimension.name, &dimension.value).await?;
            merge_existing(&dimension, existing)
        } else {
            dimension.clone()
        };

        match self.put(&to_send).await {
            Ok(()) => {
                self.counters.requests_completed.fetch_add(1, Ordering::Relaxed);
                if self.log_updates {
                    info!(
                        name = %to_send.name,
                        value = %to_send.value,
                        properties = ?to_send.properties,
                        tags = ?to_send.tags,
                        "Updated dimension"
                    );
                }
                // Only successful syncs count as history so failures are
                // retried on the next update from the monitor.
                self.history.lock().put(dimension.key(), dimension);
                Ok(())
            }
            Err(e) => {
                self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

impl InternalMetricsSource for DimensionClient {
    fn internal_metrics(&self) -> Vec<crate::datapoint::Datapoint> {
        vec![
            cumulative(
                "sfxagent.dim_request_completed",
                self.counters.requests_completed.load(Ordering::Relaxed),
            ),
            cumulative(
                "sfxagent.dim_request_failed",
                self.counters.requests_failed.load(Ordering::Relaxed),
            ),
            cumulative(
                "sfxagent.dim_updates_duplicate",
                self.counters.duplicates_skipped.load(Ordering::Relaxed),
            ),
        ]
    }
}
