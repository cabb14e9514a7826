// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tags spans with the container or pod they came from, using the endpoints
//! the agent has discovered on the sending host.

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use signalfx_core::datapoint::{Datapoint, Dimension};
use signalfx_core::internal_metrics::{gauge, InternalMetricsSource};
use signalfx_core::span::{Span, SOURCE_IP_META_KEY};

const DIMS_TO_SYNC_SOURCE: [&str; 2] = ["container_id", "kubernetes_pod_uid"];

const DIM_HISTORY_CACHE_SIZE: usize = 1000;

/// Maps a host IP to the dimensions of every endpoint discovered on it.
pub trait EndpointHostTracker: Send + Sync {
    fn get_by_host(&self, host: &str) -> Vec<HashMap<String, String>>;
}

/// An in-memory [`EndpointHostTracker`] kept in sync with the known endpoints.
#[derive(Default)]
pub struct HostEndpointIndex {
    endpoints: RwLock<HashMap<String, HashMap<String, HashMap<String, String>>>>,
}

impl HostEndpointIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, host: &str, endpoint_id: &str, dimensions: HashMap<String, String>) {
        self.endpoints
            .write()
            .entry(host.to_string())
            .or_default()
            .insert(endpoint_id.to_string(), dimensions);
    }

    pub fn remove(&self, host: &str, endpoint_id: &str) {
        let mut endpoints = self.endpoints.write();
        if let Some(by_id) = endpoints.get_mut(host) {
            by_id.remove(endpoint_id);
            if by_id.is_empty() {
                endpoints.remove(host);
            }
        }
    }

    pub fn host_count(&self) -> usize {
        self.endpoints.read().len()
    }
}

impl EndpointHostTracker for HostEndpointIndex {
    fn get_by_host(&self, host: &str) -> Vec<HashMap<String, String>> {
        let endpoints = self.endpoints.read();
        let Some(by_id) = endpoints.get(host) else {
            return Vec::new();
        };
        // Sorted by endpoint id so enrichment does not depend on map order.
        let mut ids = by_id.keys().collect::<Vec<_>>();
        ids.sort();
        ids.into_iter().map(|id| by_id[id].clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HistoryKey {
    dim_name: String,
    dim_value: String,
    service_name: String,
}

pub struct SpanSourceTracker {
    host_tracker: Arc<dyn EndpointHostTracker>,
    cluster_name: String,
    dim_history: Mutex<LruCache<HistoryKey, ()>>,
}

impl SpanSourceTracker {
    pub fn new(host_tracker: Arc<dyn EndpointHostTracker>, cluster_name: impl Into<String>) -> Self {
        SpanSourceTracker {
            host_tracker,
            cluster_name: cluster_name.into(),
            dim_history: Mutex::new(LruCache::new(
                NonZeroUsize::new(DIM_HISTORY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Adds source tags to the span and returns the dimension property updates
    /// that have not been emitted before.
    pub fn add_source_tags(&self, span: &mut Span) -> Vec<Dimension> {
        let Some(source_ip) = span.meta.get(SOURCE_IP_META_KEY).cloned() else {
            return Vec::new();
        };

        let service_name = span.local_service_name().map(str::to_string);
        let mut updates = Vec::new();
        let mut found = 0;

        for dims in self.host_tracker.get_by_host(&source_ip) {
            for dim in DIMS_TO_SYNC_SOURCE {
                let Some(val) = dims.get(dim).filter(|v| !v.is_empty()) else {
                    continue;
                };
                found += 1;

                if let Some(service) = &service_name {
                    if let Some(update) = self.dimension_prop_if_new(dim, val, service) {
                        updates.push(update);
                    }
                }

                // Existing span tags win.
                span.tags
                    .entry(dim.to_string())
                    .or_insert_with(|| val.clone());
            }

            if found == DIMS_TO_SYNC_SOURCE.len() {
                break;
            }
        }

        if found == 0 {
            debug!(source_ip = %source_ip, span_id = %span.id, "Could not find source of span");
        }
        updates
    }

    fn dimension_prop_if_new(&self, dim: &str, val: &str, service: &str) -> Option<Dimension> {
        let key = HistoryKey {
            dim_name: dim.to_string(),
            dim_value: val.to_string(),
            service_name: service.to_string(),
        };
        let mut history = self.dim_history.lock();
        if history.get(&key).is_some() {
            return None;
        }
        history.put(key, ());

        Some(Dimension {
            name: dim.to_string(),
            value: val.to_string(),
            properties: HashMap::from([
                ("service".to_string(), service.to_string()),
                ("cluster".to_string(), self.cluster_name.clone()),
            ]),
            tags: Vec::new(),
            merge_into_existing: true,
        })
    }

    pub fn history_len(&self) -> usize {
        self.dim_history.lock().len()
    }
}

impl InternalMetricsSource for SpanSourceTracker {
    fn internal_metrics(&self) -> Vec<Datapoint> {
        vec![gauge(
            "sfxagent.span_source_tracker_size",
            self.history_len() as i64,
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalfx_core::span::Endpoint;
    use tracing_test::traced_test;

    fn index_with(host: &str, dims: &[(&str, &str)]) -> Arc<HostEndpointIndex> {
        let index = Arc::new(HostEndpointIndex::new());
        index.add(
            host,
            "endpoint-1",
            dims.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        index
    }

    fn span_from(ip: Option<&str>, service: Option<&str>) -> Span {
        let mut span = Span {
            trace_id: "0000000000000001".into(),
            id: "0000000000000002".into(),
            local_endpoint: service.map(Endpoint::with_service),
            ..Default::default()
        };
        if let Some(ip) = ip {
            span.meta.insert(SOURCE_IP_META_KEY.to_string(), ip.to_string());
        }
        span
    }

    #[test]
    fn test_span_source_enrichment() {
        let tracker =
            SpanSourceTracker::new(index_with("1.2.3.4", &[("container_id", "abc")]), "prod");

        let mut span = span_from(Some("1.2.3.4"), Some("web"));
        let updates = tracker.add_source_tags(&mut span);
        assert_eq!(
            span.tags,
            HashMap::from([("container_id".to_string(), "abc".to_string())])
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "container_id");
        assert_eq!(updates[0].value, "abc");
        assert_eq!(updates[0].properties["service"], "web");
        assert_eq!(updates[0].properties["cluster"], "prod");
        assert!(updates[0].merge_into_existing);

        let mut again = span_from(Some("1.2.3.4"), Some("web"));
        assert!(tracker.add_source_tags(&mut again).is_empty());
        assert_eq!(again.tags["container_id"], "abc");
        assert_eq!(tracker.history_len(), 1);
    }

    #[test]
    fn test_no_source_ip_leaves_tags_alone() {
        let tracker =
            SpanSourceTracker::new(index_with("1.2.3.4", &[("container_id", "abc")]), "");
        let mut span = span_from(None, Some("web"));
        span.tags.insert("a".into(), "b".into());
        let before = span.tags.clone();
        assert!(tracker.add_source_tags(&mut span).is_empty());
        assert_eq!(span.tags, before);
    }

    #[test]
    fn test_existing_tag_not_overwritten() {
        let tracker = SpanSourceTracker::new(
            index_with(
                "1.2.3.4",
                &[("container_id", "abc"), ("kubernetes_pod_uid", "pod-1")],
            ),
            "",
        );
        let mut span = span_from(Some("1.2.3.4"), Some("web"));
        span.tags.insert("container_id".into(), "mine".into());
        let updates = tracker.add_source_tags(&mut span);
        assert_eq!(span.tags["container_id"], "mine");
        assert_eq!(span.tags["kubernetes_pod_uid"], "pod-1");
        // Properties still go out for the discovered values.
        assert_eq!(updates.len(), 2);
    }

    #[test]
    fn test_no_service_name_tags_without_updates() {
        let tracker =
            SpanSourceTracker::new(index_with("1.2.3.4", &[("container_id", "abc")]), "");
        let mut span = span_from(Some("1.2.3.4"), None);
        assert!(tracker.add_source_tags(&mut span).is_empty());
        assert_eq!(span.tags["container_id"], "abc");
    }

    #[test]
    #[traced_test]
    fn test_unknown_host() {
        let tracker =
            SpanSourceTracker::new(index_with("1.2.3.4", &[("container_id", "abc")]), "");
        let mut span = span_from(Some("9.9.9.9"), Some("web"));
        assert!(tracker.add_source_tags(&mut span).is_empty());
        assert!(span.tags.is_empty());
        assert!(logs_contain("Could not find source of span"));
    }

    #[test]
    fn test_stops_after_all_dims_found() {
        let index = Arc::new(HostEndpointIndex::new());
        index.add(
            "1.2.3.4",
            "a",
            HashMap::from([
                ("container_id".to_string(), "first".to_string()),
                ("kubernetes_pod_uid".to_string(), "pod-1".to_string()),
            ]),
        );
        index.add(
            "1.2.3.4",
            "b",
            HashMap::from([("container_id".to_string(), "second".to_string())]),
        );
        let tracker = SpanSourceTracker::new(index, "");
        let mut span = span_from(Some("1.2.3.4"), Some("web"));
        let updates = tracker.add_source_tags(&mut span);
        assert_eq!(span.tags["container_id"], "first");
        assert_eq!(updates.len(), 2);
    }

    #[test]
    fn test_history_is_per_service() {
        let tracker =
            SpanSourceTracker::new(index_with("1.2.3.4", &[("container_id", "abc")]), "");
        let mut web = span_from(Some("1.2.3.4"), Some("web"));
        let mut api = span_from(Some("1.2.3.4"), Some("api"));
        assert_eq!(tracker.add_source_tags(&mut web).len(), 1);
        assert_eq!(tracker.add_source_tags(&mut api).len(), 1);

        let metrics = tracker.internal_metrics();
        assert_eq!(metrics[0].metric, "sfxagent.span_source_tracker_size");
        assert_eq!(metrics[0].value, signalfx_core::datapoint::Value::Int(2));
    }

    #[test]
    fn test_index_remove() {
        let index = index_with("1.2.3.4", &[("container_id", "abc")]);
        assert_eq!(index.host_count(), 1);
        index.remove("1.2.3.4", "endpoint-1");
        assert_eq!(index.host_count(), 0);
        assert!(index.get_by_host("1.2.3.4").is_empty());
    }
}
