// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use tracing::debug;

use crate::errors::GatewayError;
use crate::gateway::Gateway;
use crate::model::{Inventory, MetricInfo, MetricInfosByKey, PerfCounterInfo};

/// `vsphere.` followed by the snake cased `<group>.<name>` of the counter,
/// e.g. `cpu` / `coreUtilization` becomes `vsphere.cpu_core_utilization`.
pub fn metric_name(group_key: &str, name_key: &str) -> String {
    let mut out = String::from("vsphere.");
    let mut prev: Option<char> = None;
    for c in group_key.chars().chain(['.']).chain(name_key.chars()) {
        if c == '.' {
            out.push('_');
        } else if c.is_uppercase() {
            if prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit()) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

pub fn build_counter_index(counters: Vec<PerfCounterInfo>) -> MetricInfosByKey {
    counters
        .into_iter()
        .map(|info| {
            let metric = MetricInfo {
                metric_name: metric_name(&info.group_key, &info.name_key),
                perf_counter_info: info,
            };
            (metric.perf_counter_info.key, metric)
        })
        .collect()
}

/// Builds the counter index and discovers which metrics each object offers.
pub struct MetricsService {
    gateway: Arc<dyn Gateway>,
}

impl MetricsService {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        MetricsService { gateway }
    }

    pub async fn retrieve_perf_counter_index(&self) -> Result<MetricInfosByKey, GatewayError> {
        let counters = self.gateway.retrieve_perf_counters().await?;
        debug!("Retrieved {} perf counters", counters.len());
        Ok(build_counter_index(counters))
    }

    /// Attaches the real-time metrics available for every inventory object.
    pub async fn populate_metric_ids(&self, inventory: &mut Inventory) -> Result<(), GatewayError> {
        for object in inventory.objects.iter_mut() {
            object.metric_ids = self
                .gateway
                .query_available_perf_metric(&object.reference)
                .await?;
        }
        Ok(())
    }
}
