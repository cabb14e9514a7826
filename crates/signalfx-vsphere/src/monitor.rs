// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use signalfx_core::datapoint::Datapoint;
use signalfx_core::errors::{ConfigError, MonitorError};
use signalfx_core::internal_metrics::{gauge, InternalMetricsSource};
use signalfx_core::monitor::{Monitor, MonitorConfig, MonitorRegistryBuilder};
use signalfx_core::output::Output;
use signalfx_core::scheduler::run_on_interval;

use crate::config::VsphereConfig;
use crate::errors::GatewayError;
use crate::gateway::Gateway;
use crate::inventory::InventoryService;
use crate::metrics::MetricsService;
use crate::model::{VsphereInfo, REALTIME_INTERVAL_SECS};
use crate::paginator::QueryPerfPaginator;
use crate::points::PointsService;
use crate::soap::SoapGateway;

pub const MONITOR_TYPE: &str = "vsphere";

#[derive(Default)]
struct CollectorState {
    last_inventory_load: Option<DateTime<Utc>>,
    last_retrieval: Option<DateTime<Utc>>,
}

/// Keeps the inventory snapshot and turns each tick into datapoints.
pub struct VsphereCollector {
    gateway: Arc<dyn Gateway>,
    inventory: InventoryService,
    metrics: MetricsService,
    points: PointsService,
    paginator: Arc<QueryPerfPaginator>,
    refresh_interval: chrono::Duration,
    info: ArcSwapOption<VsphereInfo>,
    state: Mutex<CollectorState>,
}

impl VsphereCollector {
    pub fn new(gateway: Arc<dyn Gateway>, config: &VsphereConfig) -> Result<Self, ConfigError> {
        let refresh_interval = chrono::Duration::from_std(config.inventory_refresh_interval)
            .map_err(|e| ConfigError::invalid("inventoryRefreshInterval", e.to_string()))?;
        let paginator = Arc::new(QueryPerfPaginator::new(
            Arc::clone(&gateway),
            config.perf_batch_size,
        ));
        Ok(VsphereCollector {
            inventory: InventoryService::new(Arc::clone(&gateway), config.inventory_filter()?),
            metrics: MetricsService::new(Arc::clone(&gateway)),
            points: PointsService::new(Arc::clone(&paginator), gateway.vcenter_name()),
            gateway,
            paginator,
            refresh_interval,
            info: ArcSwapOption::empty(),
            state: Mutex::new(CollectorState::default()),
        })
    }

    /// The current inventory snapshot, if one has been loaded.
    pub fn info(&self) -> Option<Arc<VsphereInfo>> {
        self.info.load_full()
    }

    /// One collection tick. Failures are logged and produce no datapoints.
    pub async fn collect(&self) -> Vec<Datapoint> {
        let mut state = self.state.lock().await;

        if state.last_inventory_load.is_none() {
            if let Err(e) = self.first_time_setup(&mut state).await {
                error!(vcenter = %self.gateway.vcenter_name(), "vSphere setup failed: {e}");
                return Vec::new();
            }
        } else {
            self.reload_if_stale(&mut state).await;
        }

        let Some(info) = self.info.load_full() else {
            return Vec::new();
        };
        let num_samples = match self.num_samples(&state).await {
            Ok(n) => n,
            Err(e) => {
                error!(vcenter = %self.gateway.vcenter_name(), "Failed to read vCenter time: {e}");
                return Vec::new();
            }
        };
        if num_samples == 0 {
            debug!("No new samples since the last retrieval");
            return Vec::new();
        }

        let (dps, latest) = self.points.retrieve_points(&info, num_samples).await;
        if let Some(latest) = latest {
            state.last_retrieval = Some(latest);
        }
        dps
    }

    async fn first_time_setup(&self, state: &mut CollectorState) -> Result<(), GatewayError> {
        self.gateway.connect().await?;
        self.load_info(state).await?;
        info!(
            vcenter = %self.gateway.vcenter_name(),
            "Loaded vSphere inventory of {} objects",
            self.info.load_full().map_or(0, |i| i.inventory.len())
        );
        Ok(())
    }

    async fn load_info(&self, state: &mut CollectorState) -> Result<(), GatewayError> {
        let mut inventory = self.inventory.retrieve_inventory().await?;
        self.metrics.populate_metric_ids(&mut inventory).await?;
        let perf_counter_index = self.metrics.retrieve_perf_counter_index().await?;
        let loaded_at = self.gateway.current_time().await?;

        self.info.store(Some(Arc::new(VsphereInfo {
            inventory,
            perf_counter_index,
        })));
        state.last_inventory_load = Some(loaded_at);
        Ok(())
    }

    /// Reloads when more than the refresh interval has passed on the vCenter
    /// clock. A failed reload keeps the previous snapshot.
    async fn reload_if_stale(&self, state: &mut CollectorState) {
        let Some(last_load) = state.last_inventory_load else {
            return;
        };
        let now = match self.gateway.current_time().await {
            Ok(now) => now,
            Err(e) => {
                error!(vcenter = %self.gateway.vcenter_name(), "Failed to read vCenter time: {e}");
                return;
            }
        };
        let since_load = now - last_load;
        debug!(
            seconds_since_load = since_load.num_seconds(),
            refresh_seconds = self.refresh_interval.num_seconds(),
            "Checking vSphere inventory age"
        );
        if since_load <= self.refresh_interval {
            return;
        }
        if let Err(e) = self.load_info(state).await {
            error!(
                vcenter = %self.gateway.vcenter_name(),
                "Failed to reload vSphere inventory: {e}"
            );
        }
    }

    /// Number of 20 second samples available since the last retrieval.
    async fn num_samples(&self, state: &CollectorState) -> Result<i32, GatewayError> {
        let Some(last) = state.last_retrieval else {
            return Ok(1);
        };
        let now = self.gateway.current_time().await?;
        let samples = (now - last).num_seconds() / REALTIME_INTERVAL_SECS;
        debug!(%now, %last, "num_samples = {samples}");
        Ok(samples.clamp(0, i64::from(i32::MAX)) as i32)
    }
}

impl InternalMetricsSource for VsphereCollector {
    fn internal_metrics(&self) -> Vec<Datapoint> {
        let objects = self
            .info
            .load_full()
            .map_or(0, |info| info.inventory.len() as i64);
        let mut dps = vec![gauge("sfxagent.vsphere_inventory_objects", objects)];
        dps.extend(self.paginator.internal_metrics());
        dps
    }
}

/// Collects real-time performance metrics of every host and VM a vCenter
/// manages.
#[derive(Default)]
pub struct VsphereMonitor {
    gateway: Option<Arc<dyn Gateway>>,
    collector: Option<Arc<VsphereCollector>>,
    output: Option<Arc<dyn Output>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl VsphereMonitor {
    pub fn new() -> Self {
        VsphereMonitor::default()
    }

    /// Uses `gateway` instead of connecting to the configured host.
    pub fn with_gateway(gateway: Arc<dyn Gateway>) -> Self {
        VsphereMonitor {
            gateway: Some(gateway),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Monitor for VsphereMonitor {
    async fn configure(
        &mut self,
        config: &MonitorConfig,
        output: Arc<dyn Output>,
        cancel: CancellationToken,
    ) -> Result<(), ConfigError> {
        let conf: VsphereConfig = config.custom()?;
        conf.validate()?;
        let interval = config.interval()?;

        let gateway = match &self.gateway {
            Some(gateway) => Arc::clone(gateway),
            None => Arc::new(SoapGateway::new(&conf)?) as Arc<dyn Gateway>,
        };
        let collector = Arc::new(VsphereCollector::new(gateway, &conf)?);

        self.cancel = cancel.child_token();
        let job_collector = Arc::clone(&collector);
        let job_output = Arc::clone(&output);
        self.task = Some(run_on_interval(self.cancel.clone(), interval, move || {
            let collector = Arc::clone(&job_collector);
            let output = Arc::clone(&job_output);
            async move {
                let dps = collector.collect().await;
                if !dps.is_empty() {
                    output.send_datapoints(dps).await;
                }
            }
        }));
        self.collector = Some(collector);
        self.output = Some(output);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("vSphere collection task failed: {e}");
            }
        }
        self.output = None;
        if let Some(collector) = self.collector.take() {
            collector.gateway.disconnect().await;
        }
    }

    async fn collect_once(&mut self) -> Result<(), MonitorError> {
        let (Some(collector), Some(output)) = (&self.collector, &self.output) else {
            return Err(MonitorError::Collect("monitor is not configured".to_string()));
        };
        let dps = collector.collect().await;
        output.send_datapoints(dps).await;
        Ok(())
    }

    fn internal_metrics_source(&self) -> Option<Arc<dyn InternalMetricsSource>> {
        self.collector
            .as_ref()
            .map(|c| Arc::clone(c) as Arc<dyn InternalMetricsSource>)
    }
}

fn default_config() -> Map<String, JsonValue> {
    match json!({
        "port": 443,
        "perfBatchSize": 10,
        "inventoryRefreshInterval": "60s",
    }) {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

/// Adds the vSphere monitor to a registry under [`MONITOR_TYPE`].
pub fn register(builder: MonitorRegistryBuilder) -> Result<MonitorRegistryBuilder, MonitorError> {
    builder.register(
        MONITOR_TYPE,
        Box::new(|| Box::new(VsphereMonitor::new()) as Box<dyn Monitor>),
        default_config(),
    )
}
