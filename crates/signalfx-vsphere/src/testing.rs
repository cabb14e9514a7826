// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An in-memory [`Gateway`] for tests of this crate and its dependents.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::errors::GatewayError;
use crate::gateway::Gateway;
use crate::model::{
    InventoryObject, ManagedObject, ManagedObjectRef, PerfCounterInfo, PerfEntityMetric,
    PerfMetricId, PerfMetricIntSeries, PerfStatsType, VmProperties, CLUSTER_COMPUTE_TYPE,
    COMPUTE_TYPE, DATACENTER_TYPE, FOLDER_TYPE, HOST_TYPE, REALTIME_INTERVAL_SECS, VM_TYPE,
};

/// 2024-01-01T00:00:00Z
const START_TIMESTAMP: i64 = 1_704_067_200;

pub struct FakeGateway {
    vcenter: String,
    root: ManagedObjectRef,
    objects: HashMap<String, ManagedObject>,
    counters: Vec<PerfCounterInfo>,
    available: HashMap<String, Vec<PerfMetricId>>,
    values: HashMap<i32, i64>,
    max_query_size: Option<usize>,
    now: Mutex<DateTime<Utc>>,
    failing: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    query_delay: Option<std::time::Duration>,
    root_folder_calls: AtomicUsize,
    query_perf_calls: Mutex<Vec<(usize, i32)>>,
}

impl FakeGateway {
    pub fn new(vcenter: &str) -> Self {
        FakeGateway {
            vcenter: vcenter.to_string(),
            root: ManagedObjectRef::new(FOLDER_TYPE, "group-d1"),
            objects: HashMap::new(),
            counters: Vec::new(),
            available: HashMap::new(),
            values: HashMap::new(),
            max_query_size: None,
            now: Mutex::new(DateTime::from_timestamp(START_TIMESTAMP, 0).unwrap_or_default()),
            failing: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            query_delay: None,
            root_folder_calls: AtomicUsize::new(0),
            query_perf_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_root(mut self, root: ManagedObjectRef) -> Self {
        self.root = root;
        self
    }

    pub fn with_object(mut self, reference: ManagedObjectRef, object: ManagedObject) -> Self {
        self.objects.insert(reference.value, object);
        self
    }

    pub fn with_counter(
        mut self,
        key: i32,
        group_key: &str,
        name_key: &str,
        stats_type: PerfStatsType,
    ) -> Self {
        self.counters.push(PerfCounterInfo {
            key,
            group_key: group_key.to_string(),
            name_key: name_key.to_string(),
            stats_type,
        });
        self
    }

    /// Metrics reported as available for the object with the given ref value.
    pub fn with_available(mut self, reference: &str, ids: &[(i32, &str)]) -> Self {
        self.available.insert(
            reference.to_string(),
            ids.iter()
                .map(|(counter_id, instance)| PerfMetricId {
                    counter_id: *counter_id,
                    instance: instance.to_string(),
                })
                .collect(),
        );
        self
    }

    /// The raw value every sample of the counter reports.
    pub fn with_value(mut self, counter_id: i32, value: i64) -> Self {
        self.values.insert(counter_id, value);
        self
    }

    /// Performance queries spanning more objects than this fail.
    pub fn with_max_query_size(mut self, max: usize) -> Self {
        self.max_query_size = Some(max);
        self
    }

    /// Every performance query takes this long to answer.
    pub fn with_query_delay(mut self, delay: std::time::Duration) -> Self {
        self.query_delay = Some(delay);
        self
    }

    pub fn with_time(self, now: DateTime<Utc>) -> Self {
        *self.now.lock() = now;
        self
    }

    /// Moves the vCenter clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Makes every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn root_folder_calls(&self) -> usize {
        self.root_folder_calls.load(Ordering::SeqCst)
    }

    /// Number of objects and `max_sample` of every performance query so far.
    pub fn query_perf_calls(&self) -> Vec<(usize, i32)> {
        self.query_perf_calls.lock().clone()
    }

    pub fn query_perf_page_sizes(&self) -> Vec<usize> {
        self.query_perf_calls().into_iter().map(|(n, _)| n).collect()
    }

    /// Datacenter `dc1` holding cluster `cluster1` with host `host-1` and its
    /// two VMs, plus the standalone host `host-2`.
    pub fn sample_topology() -> Self {
        let r = ManagedObjectRef::new;
        FakeGateway::new("vcenter.example.com")
            .with_object(
                r(FOLDER_TYPE, "group-d1"),
                ManagedObject::Folder {
                    child_entity: vec![r(DATACENTER_TYPE, "datacenter-1")],
                },
            )
            .with_object(
                r(DATACENTER_TYPE, "datacenter-1"),
                ManagedObject::Datacenter {
                    name: "dc1".into(),
                    host_folder: r(FOLDER_TYPE, "group-h1"),
                },
            )
            .with_object(
                r(FOLDER_TYPE, "group-h1"),
                ManagedObject::Folder {
                    child_entity: vec![
                        r(CLUSTER_COMPUTE_TYPE, "domain-c1"),
                        r(COMPUTE_TYPE, "domain-s1"),
                    ],
                },
            )
            .with_object(
                r(CLUSTER_COMPUTE_TYPE, "domain-c1"),
                ManagedObject::ClusterComputeResource {
                    name: "cluster1".into(),
                    hosts: vec![r(HOST_TYPE, "host-1")],
                },
            )
            .with_object(
                r(HOST_TYPE, "host-1"),
                ManagedObject::HostSystem {
                    name: "10.0.0.1".into(),
                    vms: vec![r(VM_TYPE, "vm-1"), r(VM_TYPE, "vm-2")],
                },
            )
            .with_object(
                r(VM_TYPE, "vm-1"),
                ManagedObject::VirtualMachine(VmProperties {
                    name: "web-1".into(),
                    guest_id: "debian10_64Guest".into(),
                    ip_address: "192.168.1.10".into(),
                    guest_family: "linuxGuest".into(),
                    guest_full_name: "Debian GNU/Linux 10 (64-bit)".into(),
                }),
            )
            .with_object(
                r(VM_TYPE, "vm-2"),
                ManagedObject::VirtualMachine(VmProperties {
                    name: "db-1".into(),
                    guest_id: "centos7_64Guest".into(),
                    ip_address: String::new(),
                    guest_family: "linuxGuest".into(),
                    guest_full_name: "CentOS 7 (64-bit)".into(),
                }),
            )
            .with_object(
                r(COMPUTE_TYPE, "domain-s1"),
                ManagedObject::ComputeResource {
                    name: "standalone".into(),
                    hosts: vec![r(HOST_TYPE, "host-2")],
                },
            )
            .with_object(
                r(HOST_TYPE, "host-2"),
                ManagedObject::HostSystem {
                    name: "10.0.0.2".into(),
                    vms: Vec::new(),
                },
            )
            .with_counter(1, "cpu", "coreUtilization", PerfStatsType::Delta)
            .with_counter(2, "cpu", "usagePercent", PerfStatsType::Rate)
            .with_counter(3, "mem", "usage", PerfStatsType::Absolute)
            .with_available("host-1", &[(1, ""), (2, "")])
            .with_available("vm-1", &[(2, ""), (3, "")])
            .with_available("vm-2", &[(3, "")])
            .with_available("host-2", &[(1, "0"), (1, "1")])
            .with_value(1, 300)
            .with_value(2, 4250)
            .with_value(3, 1024)
    }

    fn check(&self, operation: &'static str) -> Result<(), GatewayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Fault {
                operation,
                message: "fake gateway is failing".to_string(),
            });
        }
        Ok(())
    }

    /// The current vCenter clock.
    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.check("Login")
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn retrieve_perf_counters(&self) -> Result<Vec<PerfCounterInfo>, GatewayError> {
        self.check("RetrievePropertiesEx")?;
        Ok(self.counters.clone())
    }

    async fn root_folder(&self) -> Result<ManagedObjectRef, GatewayError> {
        self.root_folder_calls.fetch_add(1, Ordering::SeqCst);
        self.check("RetrieveServiceContent")?;
        Ok(self.root.clone())
    }

    async fn retrieve_object(
        &self,
        reference: &ManagedObjectRef,
    ) -> Result<ManagedObject, GatewayError> {
        self.check("RetrievePropertiesEx")?;
        self.objects
            .get(&reference.value)
            .cloned()
            .ok_or_else(|| GatewayError::Fault {
                operation: "RetrievePropertiesEx",
                message: format!("managed object {reference} not found"),
            })
    }

    async fn query_available_perf_metric(
        &self,
        reference: &ManagedObjectRef,
    ) -> Result<Vec<PerfMetricId>, GatewayError> {
        self.check("QueryAvailablePerfMetric")?;
        Ok(self
            .available
            .get(&reference.value)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_perf(
        &self,
        objects: &[InventoryObject],
        max_sample: i32,
    ) -> Result<Vec<PerfEntityMetric>, GatewayError> {
        self.query_perf_calls
            .lock()
            .push((objects.len(), max_sample));
        self.check("QueryPerf")?;
        if let Some(delay) = self.query_delay {
            tokio::time::sleep(delay).await;
            if self.disconnects() > 0 {
                return Err(GatewayError::Fault {
                    operation: "QueryPerf",
                    message: "session logged out during query".to_string(),
                });
            }
        }
        if let Some(max) = self.max_query_size {
            if objects.len() > max {
                return Err(GatewayError::Fault {
                    operation: "QueryPerf",
                    message: format!("{} objects exceed the limit of {max}", objects.len()),
                });
            }
        }

        let now = self.now();
        let samples = max_sample.max(1);
        let sample_times: Vec<DateTime<Utc>> = (0..samples)
            .rev()
            .map(|i| now - Duration::seconds(i64::from(i) * REALTIME_INTERVAL_SECS))
            .collect();

        Ok(objects
            .iter()
            .map(|object| PerfEntityMetric {
                entity: object.reference.clone(),
                sample_times: sample_times.clone(),
                series: object
                    .metric_ids
                    .iter()
                    .map(|id| PerfMetricIntSeries {
                        id: id.clone(),
                        values: vec![
                            self.values.get(&id.counter_id).copied().unwrap_or_default();
                            sample_times.len()
                        ],
                    })
                    .collect(),
            })
            .collect())
    }

    async fn current_time(&self) -> Result<DateTime<Utc>, GatewayError> {
        self.check("CurrentTime")?;
        Ok(self.now())
    }

    fn vcenter_name(&self) -> &str {
        &self.vcenter
    }
}
