// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

use signalfx_core::datapoint::Datapoint;
use signalfx_core::internal_metrics::{cumulative, InternalMetricsSource};

use crate::errors::GatewayError;
use crate::gateway::Gateway;
use crate::model::{InventoryObject, PerfEntityMetric};

/// Splits performance queries into pages of at most `page_size` objects.
/// A page size of zero sends everything in one request.
pub struct QueryPerfPaginator {
    gateway: Arc<dyn Gateway>,
    page_size: usize,
    pages_queried: AtomicI64,
}

impl QueryPerfPaginator {
    pub fn new(gateway: Arc<dyn Gateway>, page_size: usize) -> Self {
        QueryPerfPaginator {
            gateway,
            page_size,
            pages_queried: AtomicI64::new(0),
        }
    }

    pub fn num_pages(&self, num_objects: usize) -> usize {
        if self.page_size == 0 {
            return 1;
        }
        num_objects.div_ceil(self.page_size)
    }

    /// Responses are concatenated in page order. Any failed page fails the
    /// whole query.
    pub async fn query_perf(
        &self,
        objects: &[InventoryObject],
        max_sample: i32,
    ) -> Result<Vec<PerfEntityMetric>, GatewayError> {
        if self.page_size == 0 {
            self.pages_queried.fetch_add(1, Ordering::Relaxed);
            return self.gateway.query_perf(objects, max_sample).await;
        }

        let num_pages = self.num_pages(objects.len());
        let mut metrics = Vec::with_capacity(objects.len());
        for (i, page) in objects.chunks(self.page_size).enumerate() {
            debug!("Querying perf page {} of {num_pages} ({} objects)", i + 1, page.len());
            self.pages_queried.fetch_add(1, Ordering::Relaxed);
            metrics.extend(self.gateway.query_perf(page, max_sample).await?);
        }
        Ok(metrics)
    }
}

impl InternalMetricsSource for QueryPerfPaginator {
    fn internal_metrics(&self) -> Vec<Datapoint> {
        vec![cumulative(
            "sfxagent.vsphere_perf_query_pages",
            self.pages_queried.load(Ordering::Relaxed),
        )]
    }
}
