// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::filters::{ExclusionFilter, FilterChain, MetricNameFilter};
use crate::writer::WriterSettings;

pub const DEFAULT_INGEST_URL: &str = "https://ingest.signalfx.com";
pub const DEFAULT_API_URL: &str = "https://api.signalfx.com";

/// Splits a list separated by commas or whitespace.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `key:value` pairs separated by commas or whitespace. Malformed pairs
/// are skipped.
pub fn parse_dimensions(raw: &str) -> HashMap<String, String> {
    let mut dims = HashMap::new();
    let normalized = raw.replace(',', " ");

    for kv in normalized.split_whitespace() {
        let parts = kv.splitn(2, ':').collect::<Vec<&str>>();
        if parts.len() == 2 && !parts[0].is_empty() {
            dims.insert(parts[0].to_string(), parts[1].to_string());
        }
    }
    dims
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub access_token: String,
    pub ingest_url: String,
    pub api_url: String,
    /// Spans go here instead of `<ingest_url>/v1/trace` when set.
    pub trace_endpoint_url: Option<String>,
    pub proxy_url: Option<String>,
    pub max_requests: usize,
    pub timeout: Duration,
    pub datapoint_max_batch_size: usize,
    pub trace_span_max_batch_size: usize,
    pub event_send_interval: Duration,
    pub max_events_buffered: usize,
    /// Added to everything without overriding what is already set.
    pub global_dimensions: HashMap<String, String>,
    /// Forced onto host specific datapoints, events and spans.
    pub host_id_dimensions: HashMap<String, String>,
    pub properties_history_size: usize,
    pub properties_max_requests: usize,
    pub log_dimension_updates: bool,
    pub send_trace_host_correlation_metrics: bool,
    pub stale_service_timeout: Duration,
    pub trace_host_correlation_metrics_interval: Duration,
    /// Metric name patterns dropped at the writer. See [`MetricNameFilter`].
    pub datapoint_exclusions: Vec<String>,
    /// Exact metric names dropped at the writer.
    pub excluded_metrics: Vec<String>,
    /// Datapoints whose `kubernetes_pod_namespace` is listed here are dropped.
    pub excluded_namespaces: Vec<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            access_token: String::new(),
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            trace_endpoint_url: None,
            proxy_url: None,
            max_requests: 10,
            timeout: Duration::from_secs(10),
            datapoint_max_batch_size: 1000,
            trace_span_max_batch_size: 1000,
            event_send_interval: Duration::from_secs(1),
            max_events_buffered: 1000,
            global_dimensions: HashMap::new(),
            host_id_dimensions: HashMap::new(),
            properties_history_size: 1000,
            properties_max_requests: 20,
            log_dimension_updates: false,
            send_trace_host_correlation_metrics: true,
            stale_service_timeout: Duration::from_secs(5 * 60),
            trace_host_correlation_metrics_interval: Duration::from_secs(60),
            datapoint_exclusions: Vec::new(),
            excluded_metrics: Vec::new(),
            excluded_namespaces: Vec::new(),
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token.is_empty() {
            return Err(ConfigError::MissingField("access_token".to_string()));
        }
        for (field, url) in [("ingest_url", &self.ingest_url), ("api_url", &self.api_url)] {
            reqwest::Url::parse(url).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
        }
        if let Some(url) = &self.trace_endpoint_url {
            reqwest::Url::parse(url)
                .map_err(|e| ConfigError::invalid("trace_endpoint_url", e.to_string()))?;
        }
        if self.max_requests == 0 {
            return Err(ConfigError::invalid("max_requests", "must be at least 1"));
        }
        if self.stale_service_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "stale_service_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            max_requests: self.max_requests,
            datapoint_max_batch_size: self.datapoint_max_batch_size,
            span_max_batch_size: self.trace_span_max_batch_size,
            event_send_interval: self.event_send_interval,
            event_buffer_capacity: self.max_events_buffered,
            ..Default::default()
        }
    }

    /// `None` when no exclusions are configured.
    pub fn datapoint_filter(&self) -> Result<Option<FilterChain>, ConfigError> {
        let mut chain = FilterChain::new();
        if !self.datapoint_exclusions.is_empty() {
            let names = MetricNameFilter::new(&self.datapoint_exclusions)
                .map_err(|e| ConfigError::invalid("datapoint_exclusions", e.to_string()))?;
            chain.push(Arc::new(names));
        }
        let exclusion = ExclusionFilter::new(&self.excluded_metrics, &self.excluded_namespaces);
        if !exclusion.is_empty() {
            chain.push(Arc::new(exclusion));
        }
        Ok((!chain.is_empty()).then_some(chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::Datapoint;
    use crate::filters::{DatapointFilter, POD_NAMESPACE_DIMENSION};

    #[test]
    fn test_parse_dimensions() {
        let dims = parse_dimensions("env:prod, region:us-east-1 team:core,bad,url:http://x");
        assert_eq!(dims.len(), 4);
        assert_eq!(dims["env"], "prod");
        assert_eq!(dims["region"], "us-east-1");
        assert_eq!(dims["team"], "core");
        assert_eq!(dims["url"], "http://x");
        assert!(parse_dimensions("").is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = WriterConfig::default();
        assert_eq!(config.ingest_url, "https://ingest.signalfx.com");
        assert_eq!(config.max_requests, 10);
        assert_eq!(config.stale_service_timeout, Duration::from_secs(300));
        assert!(config.send_trace_host_correlation_metrics);
        assert_eq!(config.writer_settings().event_buffer_capacity, 1000);
    }

    #[test]
    fn test_validate() {
        let mut config = WriterConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));

        config.access_token = "abc".into();
        assert!(config.validate().is_ok());

        config.ingest_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_datapoint_filter() {
        let mut config = WriterConfig::default();
        assert!(config.datapoint_filter().unwrap().is_none());
        config.datapoint_exclusions = vec!["/(/".to_string()];
        assert!(config.datapoint_filter().is_err());
        config.datapoint_exclusions = vec!["cpu.*".to_string()];
        assert!(config.datapoint_filter().unwrap().is_some());
    }

    #[test]
    fn test_namespace_exclusion_filter() {
        let mut config = WriterConfig {
            excluded_metrics: vec!["memory.free".to_string()],
            excluded_namespaces: vec!["kube-system".to_string()],
            ..Default::default()
        };
        let filter = config.datapoint_filter().unwrap().unwrap();

        let mut dp = Datapoint::gauge("cpu.utilization", 1i64);
        assert!(!filter.excludes(&dp));
        dp.dimensions
            .insert(POD_NAMESPACE_DIMENSION.to_string(), "kube-system".to_string());
        assert!(filter.excludes(&dp));
        assert!(filter.excludes(&Datapoint::gauge("memory.free", 1i64)));

        config.datapoint_exclusions = vec!["disk.*".to_string()];
        let filter = config.datapoint_filter().unwrap().unwrap();
        assert!(filter.excludes(&Datapoint::gauge("disk.used", 1i64)));
        assert!(filter.excludes(&dp));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("a, b c,,"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }
}
