// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// Real-time performance data is sampled every 20 seconds.
pub const REALTIME_INTERVAL_SECS: i64 = 20;

pub const FOLDER_TYPE: &str = "Folder";
pub const DATACENTER_TYPE: &str = "Datacenter";
pub const CLUSTER_COMPUTE_TYPE: &str = "ClusterComputeResource";
pub const COMPUTE_TYPE: &str = "ComputeResource";
pub const HOST_TYPE: &str = "HostSystem";
pub const VM_TYPE: &str = "VirtualMachine";

pub type Dimensions = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedObjectRef {
    pub object_type: String,
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(object_type: impl Into<String>, value: impl Into<String>) -> Self {
        ManagedObjectRef {
            object_type: object_type.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerfMetricId {
    pub counter_id: i32,
    pub instance: String,
}

/// The properties the inventory traversal reads from each managed object.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
    Folder {
        child_entity: Vec<ManagedObjectRef>,
    },
    Datacenter {
        name: String,
        host_folder: ManagedObjectRef,
    },
    ClusterComputeResource {
        name: String,
        hosts: Vec<ManagedObjectRef>,
    },
    ComputeResource {
        name: String,
        hosts: Vec<ManagedObjectRef>,
    },
    HostSystem {
        name: String,
        vms: Vec<ManagedObjectRef>,
    },
    VirtualMachine(VmProperties),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmProperties {
    pub name: String,
    pub guest_id: String,
    pub ip_address: String,
    pub guest_family: String,
    pub guest_full_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryObject {
    pub reference: ManagedObjectRef,
    pub metric_ids: Vec<PerfMetricId>,
    dimensions: Dimensions,
}

impl InventoryObject {
    /// `ref_id` and `object_type` are always present and cannot be replaced
    /// by `extra_dimensions`.
    pub fn new(reference: ManagedObjectRef, extra_dimensions: Dimensions) -> Self {
        let mut dimensions = extra_dimensions;
        dimensions.insert("ref_id".to_string(), reference.value.clone());
        dimensions.insert("object_type".to_string(), reference.object_type.clone());
        InventoryObject {
            reference,
            metric_ids: Vec::new(),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    pub objects: Vec<InventoryObject>,
    pub dimension_map: HashMap<String, Dimensions>,
}

impl Inventory {
    pub fn add_object(&mut self, object: InventoryObject) {
        self.dimension_map
            .insert(object.reference.value.clone(), object.dimensions.clone());
        self.objects.push(object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfStatsType {
    Absolute,
    Delta,
    Rate,
}

impl PerfStatsType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "absolute" => Some(PerfStatsType::Absolute),
            "delta" => Some(PerfStatsType::Delta),
            "rate" => Some(PerfStatsType::Rate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerfCounterInfo {
    pub key: i32,
    pub group_key: String,
    pub name_key: String,
    pub stats_type: PerfStatsType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricInfo {
    pub metric_name: String,
    pub perf_counter_info: PerfCounterInfo,
}

pub type MetricInfosByKey = HashMap<i32, MetricInfo>;

/// Everything one points retrieval needs. Replaced as a whole on refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VsphereInfo {
    pub inventory: Inventory,
    pub perf_counter_index: MetricInfosByKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerfMetricIntSeries {
    pub id: PerfMetricId,
    pub values: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerfEntityMetric {
    pub entity: ManagedObjectRef,
    pub sample_times: Vec<DateTime<Utc>>,
    pub series: Vec<PerfMetricIntSeries>,
}
