// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::GatewayError;
use crate::model::{
    InventoryObject, ManagedObject, ManagedObjectRef, PerfCounterInfo, PerfEntityMetric,
    PerfMetricId,
};

/// The vCenter operations the monitor relies on.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Establishes a session. Called before anything else and again after a
    /// failed first-time setup.
    async fn connect(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn retrieve_perf_counters(&self) -> Result<Vec<PerfCounterInfo>, GatewayError>;

    async fn root_folder(&self) -> Result<ManagedObjectRef, GatewayError>;

    async fn retrieve_object(
        &self,
        reference: &ManagedObjectRef,
    ) -> Result<ManagedObject, GatewayError>;

    async fn query_available_perf_metric(
        &self,
        reference: &ManagedObjectRef,
    ) -> Result<Vec<PerfMetricId>, GatewayError>;

    async fn query_perf(
        &self,
        objects: &[InventoryObject],
        max_sample: i32,
    ) -> Result<Vec<PerfEntityMetric>, GatewayError>;

    async fn current_time(&self) -> Result<DateTime<Utc>, GatewayError>;

    fn vcenter_name(&self) -> &str;
}
