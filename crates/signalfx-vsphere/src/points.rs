// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error};

use signalfx_core::datapoint::{Datapoint, MetricType, Value};

use crate::model::{PerfEntityMetric, PerfStatsType, VsphereInfo};
use crate::paginator::QueryPerfPaginator;

/// Turns performance query results into datapoints.
pub struct PointsService {
    paginator: Arc<QueryPerfPaginator>,
    vcenter: String,
}

impl PointsService {
    pub fn new(paginator: Arc<QueryPerfPaginator>, vcenter: impl Into<String>) -> Self {
        PointsService {
            paginator,
            vcenter: vcenter.into(),
        }
    }

    /// Queries `num_samples` samples for every inventory object. Returns the
    /// datapoints along with the latest sample time seen, if any. A failed
    /// query is logged and yields nothing.
    pub async fn retrieve_points(
        &self,
        info: &VsphereInfo,
        num_samples: i32,
    ) -> (Vec<Datapoint>, Option<DateTime<Utc>>) {
        let metrics = match self
            .paginator
            .query_perf(&info.inventory.objects, num_samples)
            .await
        {
            Ok(metrics) => metrics,
            Err(e) => {
                error!(vcenter = %self.vcenter, "Failed to query perf metrics: {e}");
                return (Vec::new(), None);
            }
        };

        let latest = metrics
            .iter()
            .filter_map(|m| m.sample_times.last().copied())
            .max();
        let dps = metrics
            .iter()
            .flat_map(|m| self.entity_points(info, m))
            .collect::<Vec<_>>();
        debug!(vcenter = %self.vcenter, "Converted {} datapoints", dps.len());
        (dps, latest)
    }

    fn entity_points(&self, info: &VsphereInfo, metric: &PerfEntityMetric) -> Vec<Datapoint> {
        let base_dims = info
            .inventory
            .dimension_map
            .get(&metric.entity.value)
            .cloned()
            .unwrap_or_default();

        let mut dps = Vec::new();
        for series in &metric.series {
            let Some(metric_info) = info.perf_counter_index.get(&series.id.counter_id) else {
                debug!(
                    counter_id = series.id.counter_id,
                    "Dropping series of unknown counter"
                );
                continue;
            };

            let mut dims = base_dims.clone();
            dims.insert("vcenter".to_string(), self.vcenter.clone());
            if !series.id.instance.is_empty() {
                dims.insert("object".to_string(), series.id.instance.clone());
            }

            let metric_type = match metric_info.perf_counter_info.stats_type {
                PerfStatsType::Delta => MetricType::Counter,
                _ => MetricType::Gauge,
            };
            let is_percent = metric_info.metric_name.ends_with("_percent");

            for (raw, timestamp) in series.values.iter().zip(&metric.sample_times) {
                let value = if is_percent {
                    Value::Float(*raw as f64 / 100.0)
                } else {
                    Value::Int(*raw)
                };
                dps.push(Datapoint::new(
                    metric_info.metric_name.clone(),
                    dims.clone(),
                    value,
                    metric_type,
                    Some(*timestamp),
                ));
            }
        }
        dps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Inventory, InventoryObject, ManagedObjectRef, MetricInfo, PerfCounterInfo, PerfMetricId,
        PerfMetricIntSeries, HOST_TYPE,
    };
    use crate::testing::FakeGateway;
    use chrono::Duration;
    use std::collections::HashMap;

    fn counter(key: i32, metric_name: &str, stats_type: PerfStatsType) -> (i32, MetricInfo) {
        (
            key,
            MetricInfo {
                metric_name: metric_name.to_string(),
                perf_counter_info: PerfCounterInfo {
                    key,
                    group_key: String::new(),
                    name_key: String::new(),
                    stats_type,
                },
            },
        )
    }

    fn host_info() -> VsphereInfo {
        let mut inventory = Inventory::default();
        inventory.add_object(InventoryObject::new(
            ManagedObjectRef::new(HOST_TYPE, "host-1"),
            HashMap::from([("esx_ip".to_string(), "10.0.0.1".to_string())]),
        ));
        VsphereInfo {
            inventory,
            perf_counter_index: HashMap::from([
                counter(1, "vsphere.cpu_core_utilization", PerfStatsType::Delta),
                counter(2, "vsphere.cpu_core_utilization_percent", PerfStatsType::Rate),
            ]),
        }
    }

    fn service() -> PointsService {
        let gateway = Arc::new(FakeGateway::new("vc"));
        PointsService::new(Arc::new(QueryPerfPaginator::new(gateway, 10)), "vc")
    }

    fn entity(
        series: Vec<PerfMetricIntSeries>,
        sample_times: Vec<DateTime<Utc>>,
    ) -> PerfEntityMetric {
        PerfEntityMetric {
            entity: ManagedObjectRef::new(HOST_TYPE, "host-1"),
            sample_times,
            series,
        }
    }

    fn series(counter_id: i32, instance: &str, values: Vec<i64>) -> PerfMetricIntSeries {
        PerfMetricIntSeries {
            id: PerfMetricId {
                counter_id,
                instance: instance.to_string(),
            },
            values,
        }
    }

    #[test]
    fn test_percent_and_delta_conversion() {
        let now = Utc::now();
        let metric = entity(
            vec![series(1, "", vec![111]), series(2, "0", vec![5000])],
            vec![now],
        );
        let dps = service().entity_points(&host_info(), &metric);
        assert_eq!(dps.len(), 2);

        assert_eq!(dps[0].metric, "vsphere.cpu_core_utilization");
        assert_eq!(dps[0].value, Value::Int(111));
        assert_eq!(dps[0].metric_type, MetricType::Counter);
        assert_eq!(dps[0].timestamp, Some(now));
        assert!(!dps[0].dimensions.contains_key("object"));

        assert_eq!(dps[1].value, Value::Float(50.0));
        assert_eq!(dps[1].metric_type, MetricType::Gauge);
        assert_eq!(dps[1].dimensions["object"], "0");
    }

    #[test]
    fn test_dimensions_and_timestamps() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(20);
        let metric = entity(vec![series(1, "", vec![1, 2])], vec![t0, t1]);
        let dps = service().entity_points(&host_info(), &metric);

        assert_eq!(dps.len(), 2);
        assert_eq!(dps[0].timestamp, Some(t0));
        assert_eq!(dps[1].timestamp, Some(t1));
        assert_eq!(dps[1].value, Value::Int(2));
        let dims = &dps[0].dimensions;
        assert_eq!(dims["vcenter"], "vc");
        assert_eq!(dims["esx_ip"], "10.0.0.1");
        assert_eq!(dims["ref_id"], "host-1");
        assert_eq!(dims["object_type"], HOST_TYPE);
    }

    #[test]
    fn test_unknown_counter_is_dropped() {
        let metric = entity(vec![series(99, "", vec![1])], vec![Utc::now()]);
        assert!(service().entity_points(&host_info(), &metric).is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_points_latest_sample() {
        let gateway = Arc::new(FakeGateway::new("vc").with_value(1, 7));
        let now = gateway.now();
        let service = PointsService::new(Arc::new(QueryPerfPaginator::new(gateway, 10)), "vc");

        let mut info = host_info();
        info.inventory.objects[0].metric_ids = vec![PerfMetricId {
            counter_id: 1,
            instance: String::new(),
        }];
        let (dps, latest) = service.retrieve_points(&info, 3).await;
        assert_eq!(dps.len(), 3);
        assert!(dps.iter().all(|dp| dp.value == Value::Int(7)));
        assert_eq!(latest, Some(now));
        assert_eq!(dps[0].timestamp, Some(now - Duration::seconds(40)));
    }

    #[tokio::test]
    async fn test_failed_query_yields_nothing() {
        let gateway = Arc::new(FakeGateway::new("vc"));
        gateway.set_failing(true);
        let service = PointsService::new(Arc::new(QueryPerfPaginator::new(gateway, 10)), "vc");
        let (dps, latest) = service.retrieve_points(&host_info(), 1).await;
        assert!(dps.is_empty());
        assert!(latest.is_none());
    }
}
