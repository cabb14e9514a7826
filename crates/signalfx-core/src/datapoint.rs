// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The value carried by a datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// How the ingest server interprets a datapoint's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Gauge,
    Counter,
    CumulativeCounter,
    Timestamp,
}

impl MetricType {
    /// Key of the ingest JSON payload this type is grouped under.
    pub fn ingest_key(&self) -> &'static str {
        match self {
            MetricType::Gauge | MetricType::Timestamp => "gauge",
            MetricType::Counter => "counter",
            MetricType::CumulativeCounter => "cumulative_counter",
        }
    }
}

/// A scalar property value attached to datapoints and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Agent-side bookkeeping that never leaves the process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatapointMeta {
    pub monitor_type: Option<String>,
    pub monitor_id: Option<String>,
    /// Host id dimensions are not added to these.
    pub not_host_specific: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub metric: String,
    pub dimensions: HashMap<String, String>,
    pub value: Value,
    pub metric_type: MetricType,
    /// Stamped with the send time when still unset at the forwarder.
    pub timestamp: Option<DateTime<Utc>>,
    pub properties: HashMap<String, Scalar>,
    pub meta: DatapointMeta,
}

impl Datapoint {
    pub fn new(
        metric: impl Into<String>,
        dimensions: HashMap<String, String>,
        value: impl Into<Value>,
        metric_type: MetricType,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Datapoint {
            metric: metric.into(),
            dimensions,
            value: value.into(),
            metric_type,
            timestamp,
            properties: HashMap::new(),
            meta: DatapointMeta::default(),
        }
    }

    pub fn gauge(metric: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(metric, HashMap::new(), value, MetricType::Gauge, None)
    }

    pub fn cumulative(metric: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            metric,
            HashMap::new(),
            value,
            MetricType::CumulativeCounter,
            None,
        )
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl fmt::Display for Datapoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dims = self
            .dimensions
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<String>>();
        dims.sort();
        write!(
            f,
            "{}[{}] ({:?}) {}",
            self.metric,
            dims.join(","),
            self.metric_type,
            self.value
        )
    }
}

/// A property update for a single dimension key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub value: String,
    pub properties: HashMap<String, String>,
    pub tags: Vec<String>,
    /// When set, existing properties on the dimension are kept and overlaid.
    pub merge_into_existing: bool,
}

impl Dimension {
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.value.clone())
    }
}
