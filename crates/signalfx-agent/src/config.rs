// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use signalfx_core::config::{parse_dimensions, parse_list, WriterConfig};
use signalfx_core::kubernetes;
use signalfx_core::monitor::MonitorConfig;
use signalfx_trace_agent::receiver::{ReceiverConfig, DEFAULT_RECEIVER_PORT};

const INTERNAL_METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// A statically known service endpoint. Spans sent from `host` are tagged
/// with its dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub id: String,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug)]
pub struct AgentConfig {
    pub log_level: String,
    pub writer: WriterConfig,
    pub receiver: ReceiverConfig,
    /// Attached to span source dimensions when set.
    pub cluster_name: String,
    pub pod_name: Option<String>,
    pub monitors: Vec<MonitorConfig>,
    pub endpoints: Vec<EndpointConfig>,
    pub internal_metrics_interval: Duration,
}

impl AgentConfig {
    pub fn new() -> Result<AgentConfig, Box<dyn std::error::Error>> {
        let access_token = env::var("SFX_ACCESS_TOKEN")
            .map_err(|_| anyhow::anyhow!("SFX_ACCESS_TOKEN environment variable is not set"))?;

        let log_level = env::var("SFX_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or("info".to_string());

        let mut writer = WriterConfig {
            access_token,
            proxy_url: env::var("SFX_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            trace_endpoint_url: env::var("SFX_TRACE_ENDPOINT_URL").ok(),
            ..Default::default()
        };
        if let Ok(url) = env::var("SFX_INGEST_URL") {
            writer.ingest_url = url;
        }
        if let Ok(url) = env::var("SFX_API_URL") {
            writer.api_url = url;
        }
        if let Ok(dims) = env::var("SFX_GLOBAL_DIMENSIONS") {
            writer.global_dimensions = parse_dimensions(&dims);
        }
        if let Ok(patterns) = env::var("SFX_DATAPOINT_EXCLUSIONS") {
            writer.datapoint_exclusions = parse_list(&patterns);
        }
        if let Ok(metrics) = env::var("SFX_EXCLUDED_METRICS") {
            writer.excluded_metrics = parse_list(&metrics);
        }
        if let Ok(namespaces) = env::var("SFX_EXCLUDED_NAMESPACES") {
            writer.excluded_namespaces = parse_list(&namespaces);
        }
        if let Ok(val) = env::var("SFX_SEND_TRACE_HOST_CORRELATION_METRICS") {
            writer.send_trace_host_correlation_metrics = val.to_lowercase() != "false";
        }
        let skip_host_dims = env::var("SKIP_PLATFORM_HOST_DIMS")
            .map(|val| val.to_lowercase() == "yes")
            .unwrap_or(false);
        if !skip_host_dims {
            if let Some(hostname) = hostname_from_env() {
                writer.host_id_dimensions.insert("host".to_string(), hostname);
            }
        }
        writer
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid writer configuration: {e}"))?;

        let mut receiver = ReceiverConfig {
            port: env::var("SFX_TRACE_RECEIVER_PORT")
                .ok()
                .and_then(|port| port.parse::<u16>().ok())
                .unwrap_or(DEFAULT_RECEIVER_PORT),
            ..Default::default()
        };
        if let Ok(addr) = env::var("SFX_TRACE_RECEIVER_ADDRESS") {
            receiver.listen_address = addr.parse::<IpAddr>().map_err(|e| {
                anyhow::anyhow!("Invalid SFX_TRACE_RECEIVER_ADDRESS {addr}: {e}")
            })?;
        }

        let pod_name = if kubernetes::api_url_from_env().is_some() {
            let always_cluster_reporter = env::var("SFX_ALWAYS_CLUSTER_REPORTER")
                .map(|val| val.to_lowercase() == "true")
                .unwrap_or(false);
            kubernetes::pod_name_from_env(always_cluster_reporter)?
        } else {
            None
        };

        let file = match env::var("SFX_CONFIG_PATH") {
            Ok(path) => load_config_file(Path::new(&path))?,
            Err(_) => ConfigFile::default(),
        };

        Ok(AgentConfig {
            log_level,
            writer,
            receiver,
            cluster_name: env::var("SFX_CLUSTER_NAME").unwrap_or_default(),
            pod_name,
            monitors: file.monitors,
            endpoints: file.endpoints,
            internal_metrics_interval: INTERNAL_METRICS_INTERVAL,
        })
    }
}

fn hostname_from_env() -> Option<String> {
    env::var("SFX_HOSTNAME")
        .or_else(|_| env::var("HOSTNAME"))
        .ok()
        .filter(|name| !name.is_empty())
}

/// Reads the `monitors` and `endpoints` lists of a YAML file.
pub fn load_config_file(path: &Path) -> anyhow::Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Unable to read {}: {e}", path.display()))?;
    let file: Option<ConfigFile> = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Unable to parse {}: {e}", path.display()))?;
    Ok(file.unwrap_or_default())
}
