// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent self-observability. Components expose their counters as datapoints
//! and the orchestrator periodically sends them through the normal pipeline.

use std::sync::Arc;

use crate::datapoint::{Datapoint, MetricType, Value};

pub trait InternalMetricsSource: Send + Sync {
    fn internal_metrics(&self) -> Vec<Datapoint>;
}

pub fn gauge(metric: &str, value: i64) -> Datapoint {
    internal(metric, Value::Int(value), MetricType::Gauge)
}

pub fn cumulative(metric: &str, value: i64) -> Datapoint {
    internal(metric, Value::Int(value), MetricType::CumulativeCounter)
}

fn internal(metric: &str, value: Value, metric_type: MetricType) -> Datapoint {
    let mut dp = Datapoint::new(metric, Default::default(), value, metric_type, None);
    dp.meta.monitor_type = Some("internal-metrics".to_string());
    dp
}

/// Gathers metrics from every registered source.
#[derive(Default, Clone)]
pub struct InternalMetricsCollector {
    sources: Vec<Arc<dyn InternalMetricsSource>>,
}

impl InternalMetricsCollector {
    pub fn register(&mut self, source: Arc<dyn InternalMetricsSource>) {
        self.sources.push(source);
    }

    pub fn collect(&self) -> Vec<Datapoint> {
        self.sources
            .iter()
            .flat_map(|s| s.internal_metrics())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(i64);

    impl InternalMetricsSource for Fixed {
        fn internal_metrics(&self) -> Vec<Datapoint> {
            vec![gauge("sfxagent.fixed", self.0)]
        }
    }

    #[test]
    fn test_collects_all_sources() {
        let mut collector = InternalMetricsCollector::default();
        collector.register(Arc::new(Fixed(1)));
        collector.register(Arc::new(Fixed(2)));
        let dps = collector.collect();
        assert_eq!(dps.len(), 2);
        assert_eq!(dps[1].value, Value::Int(2));
        assert_eq!(dps[0].metric_type, MetricType::Gauge);
        assert_eq!(dps[0].meta.monitor_type.as_deref(), Some("internal-metrics"));
    }
}
