// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monitor configuration, the factory registry and the manager that keeps the
//! set of running monitors in line with the configured set.

use async_trait::async_trait;
use fnv::FnvHasher;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::datapoint::Datapoint;
use crate::errors::{ConfigError, MonitorError};
use crate::filters::{DatapointFilter, IncludedMetricsFilter};
use crate::internal_metrics::{gauge, InternalMetricsSource};
use crate::output::{MonitorOutput, Output};
use crate::writer::WriterHandle;

fn default_interval_seconds() -> u64 {
    10
}

/// The envelope common to every monitor instance. Monitor specific fields are
/// kept in `other` and decoded by the monitor itself with [`MonitorConfig::custom`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(rename = "type")]
    pub monitor_type: String,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub extra_dimensions: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_metrics: Option<Vec<String>>,
    #[serde(default)]
    pub send_all_metrics: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub dimension_transformations: HashMap<String, String>,
    #[serde(flatten)]
    pub other: Map<String, JsonValue>,
}

impl MonitorConfig {
    pub fn new(monitor_type: impl Into<String>) -> Self {
        MonitorConfig {
            monitor_type: monitor_type.into(),
            interval_seconds: default_interval_seconds(),
            extra_dimensions: HashMap::new(),
            included_metrics: None,
            send_all_metrics: false,
            endpoint: None,
            dimension_transformations: HashMap::new(),
            other: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: JsonValue) -> Self {
        self.other.insert(key.to_string(), value);
        self
    }

    pub fn interval(&self) -> Result<Duration, ConfigError> {
        if self.interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "intervalSeconds",
                "must be greater than zero",
            ));
        }
        Ok(Duration::from_secs(self.interval_seconds))
    }

    /// Decodes the monitor specific part of the config.
    pub fn custom<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Ok(serde_json::from_value(JsonValue::Object(self.other.clone()))?)
    }

    /// Stable across processes: the JSON form has sorted object keys.
    pub fn config_hash(&self) -> Result<u64, ConfigError> {
        let canonical = serde_json::to_value(self)?.to_string();
        let mut hasher = FnvHasher::default();
        hasher.write(canonical.as_bytes());
        Ok(hasher.finish())
    }
}

#[async_trait]
pub trait Monitor: Send {
    /// Called once per active lifetime. The monitor starts its own scheduled
    /// work, which must stop when `cancel` fires.
    async fn configure(
        &mut self,
        config: &MonitorConfig,
        output: Arc<dyn Output>,
        cancel: CancellationToken,
    ) -> Result<(), ConfigError>;

    /// Idempotent.
    async fn shutdown(&mut self);

    /// Pull style collection for monitors that support it.
    async fn collect_once(&mut self) -> Result<(), MonitorError> {
        Err(MonitorError::CollectUnsupported)
    }

    fn internal_metrics_source(&self) -> Option<Arc<dyn InternalMetricsSource>> {
        None
    }
}

pub type MonitorFactory = Box<dyn Fn() -> Box<dyn Monitor> + Send + Sync>;

struct Registration {
    factory: MonitorFactory,
    default_config: Map<String, JsonValue>,
}

#[derive(Default)]
pub struct MonitorRegistryBuilder {
    entries: HashMap<String, Registration>,
}

impl MonitorRegistryBuilder {
    pub fn register(
        mut self,
        monitor_type: &str,
        factory: MonitorFactory,
        default_config: Map<String, JsonValue>,
    ) -> Result<Self, MonitorError> {
        if self.entries.contains_key(monitor_type) {
            return Err(MonitorError::DuplicateType(monitor_type.to_string()));
        }
        self.entries.insert(
            monitor_type.to_string(),
            Registration {
                factory,
                default_config,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> MonitorRegistry {
        MonitorRegistry {
            entries: self.entries,
        }
    }
}

/// Read-only once built.
pub struct MonitorRegistry {
    entries: HashMap<String, Registration>,
}

impl MonitorRegistry {
    pub fn builder() -> MonitorRegistryBuilder {
        MonitorRegistryBuilder::default()
    }

    pub fn create(&self, monitor_type: &str) -> Result<Box<dyn Monitor>, MonitorError> {
        self.entries
            .get(monitor_type)
            .map(|r| (r.factory)())
            .ok_or_else(|| MonitorError::UnknownType(monitor_type.to_string()))
    }

    /// Fills in every monitor specific field the config leaves unset.
    pub fn apply_defaults(&self, config: &mut MonitorConfig) {
        if let Some(registration) = self.entries.get(&config.monitor_type) {
            for (k, v) in &registration.default_config {
                config.other.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
    }

    pub fn types(&self) -> Vec<String> {
        let mut types = self.entries.keys().cloned().collect::<Vec<_>>();
        types.sort();
        types
    }
}

struct ActiveMonitor {
    id: String,
    config: MonitorConfig,
    monitor: Box<dyn Monitor>,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct ManagerStats {
    active: AtomicI64,
    configured: AtomicI64,
    bad: AtomicI64,
    sources: Mutex<HashMap<String, Arc<dyn InternalMetricsSource>>>,
}

impl InternalMetricsSource for ManagerStats {
    fn internal_metrics(&self) -> Vec<Datapoint> {
        let mut dps = vec![
            gauge("sfxagent.active_monitors", self.active.load(Ordering::Relaxed)),
            gauge(
                "sfxagent.configured_monitors",
                self.configured.load(Ordering::Relaxed),
            ),
            gauge(
                "sfxagent.bad_monitor_configs",
                self.bad.load(Ordering::Relaxed),
            ),
        ];
        for (monitor_id, source) in self.sources.lock().iter() {
            dps.extend(
                source
                    .internal_metrics()
                    .into_iter()
                    .map(|dp| dp.with_dimension("monitor_id", monitor_id.clone())),
            );
        }
        dps
    }
}

/// A config that could not be turned into a running monitor.
#[derive(Debug, Clone)]
pub struct BadConfig {
    pub config: MonitorConfig,
    pub reason: String,
}

pub struct MonitorManager {
    registry: Arc<MonitorRegistry>,
    writer: WriterHandle,
    cancel: CancellationToken,
    active: HashMap<u64, ActiveMonitor>,
    bad_configs: Vec<BadConfig>,
    id_counters: HashMap<String, usize>,
    stats: Arc<ManagerStats>,
}

impl MonitorManager {
    pub fn new(registry: Arc<MonitorRegistry>, writer: WriterHandle, cancel: CancellationToken) -> Self {
        MonitorManager {
            registry,
            writer,
            cancel,
            active: HashMap::new(),
            bad_configs: Vec::new(),
            id_counters: HashMap::new(),
            stats: Arc::new(ManagerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ManagerStats> {
        Arc::clone(&self.stats)
    }

    pub fn bad_configs(&self) -> &[BadConfig] {
        &self.bad_configs
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids = self.active.values().map(|m| m.id.clone()).collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Brings the running monitors in line with `configs`. Monitors whose
    /// config is unchanged keep running; removed ones are shut down; new ones
    /// are created and configured. Previously bad configs are retried.
    pub async fn configure(&mut self, configs: Vec<MonitorConfig>) {
        let mut wanted: Vec<(u64, MonitorConfig)> = Vec::with_capacity(configs.len());
        let mut seen = HashSet::new();
        self.bad_configs.clear();

        for mut config in configs {
            self.registry.apply_defaults(&mut config);
            match config.config_hash() {
                Ok(hash) => {
                    if seen.insert(hash) {
                        wanted.push((hash, config));
                    } else {
                        warn!(monitor_type = %config.monitor_type, "Ignoring duplicate monitor config");
                    }
                }
                Err(e) => self.mark_bad(config, e.to_string()),
            }
        }

        let stale = self
            .active
            .keys()
            .filter(|hash| !seen.contains(hash))
            .copied()
            .collect::<Vec<u64>>();
        for hash in stale {
            if let Some(active) = self.active.remove(&hash) {
                self.stop(active).await;
            }
        }

        for (hash, config) in wanted {
            if self.active.contains_key(&hash) {
                continue;
            }
            if let Err(e) = self.start(hash, config.clone()).await {
                error!(monitor_type = %config.monitor_type, "Could not create monitor: {e}");
                self.mark_bad(config, e.to_string());
            }
        }

        self.stats
            .configured
            .store((self.active.len() + self.bad_configs.len()) as i64, Ordering::Relaxed);
        self.stats
            .active
            .store(self.active.len() as i64, Ordering::Relaxed);
        self.stats
            .bad
            .store(self.bad_configs.len() as i64, Ordering::Relaxed);
    }

    fn mark_bad(&mut self, config: MonitorConfig, reason: String) {
        self.bad_configs.push(BadConfig { config, reason });
    }

    fn next_id(&mut self, monitor_type: &str) -> String {
        let counter = self.id_counters.entry(monitor_type.to_string()).or_insert(0);
        let id = format!("{monitor_type}-{counter}");
        *counter += 1;
        id
    }

    async fn start(&mut self, hash: u64, config: MonitorConfig) -> Result<(), MonitorError> {
        let mut monitor = self.registry.create(&config.monitor_type)?;
        let id = self.next_id(&config.monitor_type);

        let filter = IncludedMetricsFilter::new(
            config.included_metrics.as_deref(),
            config.send_all_metrics,
        )
        .map(|f| Arc::new(f) as Arc<dyn DatapointFilter>);

        let output: Arc<dyn Output> = Arc::new(MonitorOutput::new(
            config.monitor_type.clone(),
            id.clone(),
            config.extra_dimensions.clone(),
            config.dimension_transformations.clone(),
            filter,
            self.writer.clone(),
        ));

        let cancel = self.cancel.child_token();
        if let Err(source) = monitor.configure(&config, output, cancel.clone()).await {
            cancel.cancel();
            monitor.shutdown().await;
            return Err(MonitorError::Configure {
                monitor_type: config.monitor_type.clone(),
                source,
            });
        }

        if let Some(source) = monitor.internal_metrics_source() {
            self.stats.sources.lock().insert(id.clone(), source);
        }
        info!(monitor_id = %id, monitor_type = %config.monitor_type, "Started monitor");
        self.active.insert(
            hash,
            ActiveMonitor {
                id,
                config,
                monitor,
                cancel,
            },
        );
        Ok(())
    }

    async fn stop(&self, mut active: ActiveMonitor) {
        debug!(monitor_id = %active.id, "Shutting down monitor");
        active.cancel.cancel();
        active.monitor.shutdown().await;
        self.stats.sources.lock().remove(&active.id);
        info!(monitor_id = %active.id, monitor_type = %active.config.monitor_type, "Stopped monitor");
    }

    pub async fn collect_once(&mut self, monitor_id: &str) -> Result<(), MonitorError> {
        let active = self
            .active
            .values_mut()
            .find(|m| m.id == monitor_id)
            .ok_or_else(|| MonitorError::Collect(format!("no active monitor {monitor_id}")))?;
        active.monitor.collect_once().await
    }

    pub async fn shutdown(&mut self) {
        for (_, active) in self.active.drain().collect::<Vec<_>>() {
            self.stop(active).await;
        }
        self.stats.active.store(0, Ordering::Relaxed);
    }
}
