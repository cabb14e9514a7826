// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the writer, the trace pipeline and the monitors together and tears
//! them down in reverse order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use signalfx_core::dimensions::{DimensionClient, DimensionUpdater};
use signalfx_core::errors::{ConfigError, MonitorError};
use signalfx_core::forwarder::IngestForwarder;
use signalfx_core::http_utils::build_client;
use signalfx_core::internal_metrics::InternalMetricsCollector;
use signalfx_core::monitor::{MonitorConfig, MonitorManager, MonitorRegistry};
use signalfx_core::scheduler::run_on_interval;
use signalfx_core::sink::{build_chain, CountingSink, DecoratingSink, FilteringSink, SinkCounters};
use signalfx_core::writer::{WriterHandle, WriterService};
use signalfx_trace_agent::correlation::CorrelationEmitter;
use signalfx_trace_agent::processor::SpanProcessor;
use signalfx_trace_agent::receiver::TraceReceiver;
use signalfx_trace_agent::span_source::{EndpointHostTracker, HostEndpointIndex, SpanSourceTracker};
use signalfx_trace_agent::tracker::ActiveServiceTracker;

use crate::config::{AgentConfig, EndpointConfig};

pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("failed to start trace receiver: {0}")]
    Receiver(#[from] std::io::Error),
}

pub struct Agent {
    /// Stops monitors, the receiver and the periodic emitters.
    cancel: CancellationToken,
    /// Only cancelled when the writer cannot drain in time.
    writer_cancel: CancellationToken,
    writer: WriterHandle,
    writer_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    manager: MonitorManager,
    endpoint_index: Arc<HostEndpointIndex>,
    endpoints: Vec<EndpointConfig>,
    receiver_addr: SocketAddr,
}

impl Agent {
    pub async fn start(config: AgentConfig) -> Result<Agent, AgentError> {
        let AgentConfig {
            writer: writer_config,
            receiver: receiver_config,
            cluster_name,
            pod_name,
            monitors,
            endpoints,
            internal_metrics_interval,
            ..
        } = config;
        if let Some(pod) = &pod_name {
            info!("Running in Kubernetes pod {pod}");
        }

        let cancel = CancellationToken::new();
        let writer_cancel = CancellationToken::new();
        let mut internal_metrics = InternalMetricsCollector::default();
        let mut tasks = Vec::new();

        let client = build_client(
            writer_config.proxy_url.as_deref(),
            writer_config.timeout,
            writer_config.max_requests,
        )?;
        let forwarder = Arc::new(IngestForwarder::new(
            client.clone(),
            writer_config.access_token.clone(),
            &writer_config.ingest_url,
            writer_config.trace_endpoint_url.as_deref(),
        ));
        debug!("Spans will be sent to {}", forwarder.trace_url());
        let dimension_client = Arc::new(DimensionClient::new(
            client,
            writer_config.api_url.clone(),
            writer_config.access_token.clone(),
            writer_config.properties_history_size,
            writer_config.properties_max_requests,
            writer_config.log_dimension_updates,
        ));
        internal_metrics.register(dimension_client.clone());

        // Decorate, then filter, then count what is left.
        let sink_counters = Arc::new(SinkCounters::default());
        internal_metrics.register(sink_counters.clone());
        let mut middlewares = vec![DecoratingSink::middleware(
            writer_config.global_dimensions.clone(),
            writer_config.host_id_dimensions.clone(),
        )];
        if let Some(filter) = writer_config.datapoint_filter()? {
            middlewares.push(FilteringSink::middleware(
                Arc::new(filter),
                Arc::clone(&sink_counters.datapoints_filtered),
            ));
        }
        middlewares.push(CountingSink::middleware(sink_counters));
        let sink = build_chain(forwarder, middlewares);

        let (writer_service, writer) = WriterService::new(
            sink,
            Some(dimension_client as Arc<dyn DimensionUpdater>),
            writer_config.writer_settings(),
            writer_cancel.clone(),
        );
        let writer_task = tokio::spawn(writer_service.run());

        let service_tracker = Arc::new(ActiveServiceTracker::new(
            writer_config.stale_service_timeout,
            None,
        ));
        internal_metrics.register(service_tracker.clone());
        let endpoint_index = Arc::new(HostEndpointIndex::new());
        let span_source_tracker = Arc::new(SpanSourceTracker::new(
            Arc::clone(&endpoint_index) as Arc<dyn EndpointHostTracker>,
            cluster_name,
        ));
        internal_metrics.register(span_source_tracker.clone());
        let processor = SpanProcessor::new(writer.clone())
            .with_global_span_tags(writer_config.host_id_dimensions.clone())
            .with_service_tracker(Arc::clone(&service_tracker))
            .with_span_source_tracker(span_source_tracker);

        let receiver = TraceReceiver::new(receiver_config, Arc::new(processor));
        internal_metrics.register(receiver.stats());
        let listener = receiver.bind().await?;
        let receiver_addr = listener.local_addr()?;
        let receiver_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = receiver.serve(listener, receiver_cancel).await {
                error!("Trace receiver stopped: {e}");
            }
        }));
        info!("Trace receiver listening on {receiver_addr}");

        if writer_config.send_trace_host_correlation_metrics {
            tasks.push(
                CorrelationEmitter::new(
                    service_tracker,
                    writer.clone(),
                    writer_config.trace_host_correlation_metrics_interval,
                )
                .spawn(cancel.clone()),
            );
        }

        let registry = signalfx_vsphere::monitor::register(MonitorRegistry::builder())?.build();
        let registry = Arc::new(registry);
        debug!("Registered monitor types: {:?}", registry.types());
        let manager = MonitorManager::new(registry, writer.clone(), cancel.clone());
        internal_metrics.register(manager.stats());

        let emitter_writer = writer.clone();
        tasks.push(run_on_interval(cancel.clone(), internal_metrics_interval, move || {
            let metrics = internal_metrics.clone();
            let writer = emitter_writer.clone();
            async move { emit_internal_metrics(&metrics, &writer).await }
        }));

        let mut agent = Agent {
            cancel,
            writer_cancel,
            writer,
            writer_task,
            tasks,
            manager,
            endpoint_index,
            endpoints: Vec::new(),
            receiver_addr,
        };
        agent.sync_endpoints(endpoints);
        agent.reload(monitors).await;
        info!(
            "Agent started with {} active monitors",
            agent.manager.active_ids().len()
        );
        Ok(agent)
    }

    /// Reconciles the running monitors with `monitors`. Monitors whose config
    /// is unchanged keep running under the same id.
    pub async fn reload(&mut self, monitors: Vec<MonitorConfig>) {
        self.manager.configure(monitors).await;
        for bad in self.manager.bad_configs() {
            error!(
                monitor_type = %bad.config.monitor_type,
                "Monitor config rejected: {}", bad.reason
            );
        }
    }

    /// Replaces the known endpoints that spans are matched against.
    pub fn sync_endpoints(&mut self, endpoints: Vec<EndpointConfig>) {
        for old in &self.endpoints {
            if !endpoints.contains(old) {
                debug!(host = %old.host, "Removing endpoint {}", old.id);
                self.endpoint_index.remove(&old.host, &old.id);
            }
        }
        for new in &endpoints {
            if !self.endpoints.contains(new) {
                debug!(host = %new.host, "Adding endpoint {}", new.id);
                self.endpoint_index
                    .add(&new.host, &new.id, new.dimensions.clone());
            }
        }
        self.endpoints = endpoints;
    }

    pub fn receiver_addr(&self) -> SocketAddr {
        self.receiver_addr
    }

    pub fn active_monitors(&self) -> Vec<String> {
        self.manager.active_ids()
    }

    /// Stops everything within [`SHUTDOWN_DEADLINE`]. Telemetry still queued
    /// when the deadline passes is dropped.
    pub async fn shutdown(mut self) {
        if tokio::time::timeout(SHUTDOWN_DEADLINE, self.stop()).await.is_err() {
            warn!("Agent did not stop within {SHUTDOWN_DEADLINE:?}, dropping queued telemetry");
            self.writer_cancel.cancel();
        }
        info!("Agent stopped");
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        self.manager.shutdown().await;
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Agent task failed: {e}");
            }
        }
        if let Err(e) = self.writer.flush().await {
            error!("Failed to flush writer: {e}");
        }
        if let Err(e) = self.writer.shutdown().await {
            error!("Failed to stop writer: {e}");
        }
        if let Err(e) = (&mut self.writer_task).await {
            error!("Writer task failed: {e}");
        }
    }
}

async fn emit_internal_metrics(metrics: &InternalMetricsCollector, writer: &WriterHandle) {
    let datapoints = metrics.collect();
    if datapoints.is_empty() {
        return;
    }
    debug!("Sending {} internal metrics", datapoints.len());
    if let Err(e) = writer.send_datapoints(datapoints).await {
        error!("Failed to send internal metrics: {e}");
    }
}
