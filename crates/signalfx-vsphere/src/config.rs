// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

use signalfx_core::errors::ConfigError;

use crate::filter::InventoryFilter;

fn default_port() -> u16 {
    443
}

fn default_inventory_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_perf_batch_size() -> usize {
    10
}

/// Settings of one vSphere monitor instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VsphereConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Skips verification of the server's certificate chain and host name.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// How often the inventory and its available metrics are reloaded.
    #[serde(
        default = "default_inventory_refresh_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub inventory_refresh_interval: Duration,
    /// Inventory objects per performance query. Zero queries everything at once.
    #[serde(default = "default_perf_batch_size")]
    pub perf_batch_size: usize,
    /// Evaluated per cluster, see [`InventoryFilter`].
    #[serde(default)]
    pub filter: String,
    #[serde(default, rename = "tlsCACertPath")]
    pub tls_ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_client_certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_client_key_path: Option<PathBuf>,
}

impl Default for VsphereConfig {
    fn default() -> Self {
        VsphereConfig {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            insecure_skip_verify: false,
            inventory_refresh_interval: default_inventory_refresh_interval(),
            perf_batch_size: default_perf_batch_size(),
            filter: String::new(),
            tls_ca_cert_path: None,
            tls_client_certificate_path: None,
            tls_client_key_path: None,
        }
    }
}

impl VsphereConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingField("host".to_string()));
        }
        if self.tls_client_certificate_path.is_some() != self.tls_client_key_path.is_some() {
            return Err(ConfigError::invalid(
                "tlsClientCertificatePath",
                "tlsClientCertificatePath and tlsClientKeyPath must be set together",
            ));
        }
        self.inventory_filter()?;
        Ok(())
    }

    pub fn inventory_filter(&self) -> Result<Option<InventoryFilter>, ConfigError> {
        InventoryFilter::parse(&self.filter)
            .map_err(|e| ConfigError::invalid("filter", e.to_string()))
    }

    pub fn sdk_url(&self) -> String {
        format!("https://{}:{}/sdk", self.host, self.port)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// Accepts a number of seconds or a string such as `90s`, `5m` or `1h`.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value = digits
        .parse::<u64>()
        .map_err(|_| format!("invalid duration {text:?}"))?;
    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(format!("invalid duration unit in {text:?}")),
    };
    Ok(Duration::from_secs(value * multiplier))
}
