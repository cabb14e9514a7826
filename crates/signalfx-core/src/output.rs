// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::datapoint::{Datapoint, Dimension};
use crate::event::Event;
use crate::filters::DatapointFilter;
use crate::writer::WriterHandle;

/// The capability a monitor is handed to emit telemetry.
///
/// Sends apply backpressure: when the writer is saturated the calling task
/// waits instead of data being dropped.
#[async_trait]
pub trait Output: Send + Sync {
    async fn send_datapoints(&self, datapoints: Vec<Datapoint>);

    async fn send_datapoint(&self, datapoint: Datapoint) {
        self.send_datapoints(vec![datapoint]).await
    }

    async fn send_event(&self, event: Event);

    async fn send_dimension_update(&self, dimension: Dimension);

    fn add_extra_dimension(&self, key: &str, value: &str);

    fn remove_extra_dimension(&self, key: &str);
}

pub struct MonitorOutput {
    monitor_type: String,
    monitor_id: String,
    extra_dimensions: RwLock<HashMap<String, String>>,
    dimension_transformations: HashMap<String, String>,
    filter: Option<Arc<dyn DatapointFilter>>,
    writer: WriterHandle,
}

impl MonitorOutput {
    pub fn new(
        monitor_type: impl Into<String>,
        monitor_id: impl Into<String>,
        extra_dimensions: HashMap<String, String>,
        dimension_transformations: HashMap<String, String>,
        filter: Option<Arc<dyn DatapointFilter>>,
        writer: WriterHandle,
    ) -> Self {
        MonitorOutput {
            monitor_type: monitor_type.into(),
            monitor_id: monitor_id.into(),
            extra_dimensions: RwLock::new(extra_dimensions),
            dimension_transformations,
            filter,
            writer,
        }
    }

    fn prepare(&self, mut dp: Datapoint) -> Option<Datapoint> {
        dp.meta.monitor_type = Some(self.monitor_type.clone());
        dp.meta.monitor_id = Some(self.monitor_id.clone());
        merge_dimensions(&mut dp.dimensions, &self.extra_dimensions.read());

        if let Some(filter) = &self.filter {
            if filter.excludes(&dp) {
                return None;
            }
        }

        transform_dimensions(&mut dp.dimensions, &self.dimension_transformations);
        Some(dp)
    }
}

#[async_trait]
impl Output for MonitorOutput {
    async fn send_datapoints(&self, datapoints: Vec<Datapoint>) {
        let prepared = datapoints
            .into_iter()
            .filter_map(|dp| self.prepare(dp))
            .collect::<Vec<Datapoint>>();
        if prepared.is_empty() {
            return;
        }
        if let Err(e) = self.writer.send_datapoints(prepared).await {
            warn!(monitor_id = %self.monitor_id, "Could not send datapoints: {e}");
        }
    }

    async fn send_event(&self, mut event: Event) {
        merge_dimensions(&mut event.dimensions, &self.extra_dimensions.read());
        transform_dimensions(&mut event.dimensions, &self.dimension_transformations);
        if let Err(e) = self.writer.send_event(event).await {
            warn!(monitor_id = %self.monitor_id, "Could not send event: {e}");
        }
    }

    async fn send_dimension_update(&self, dimension: Dimension) {
        if let Err(e) = self.writer.send_dimension_update(dimension).await {
            warn!(monitor_id = %self.monitor_id, "Could not send dimension update: {e}");
        }
    }

    fn add_extra_dimension(&self, key: &str, value: &str) {
        debug!(monitor_id = %self.monitor_id, "Adding extra dimension {key}={value}");
        self.extra_dimensions
            .write()
            .insert(key.to_string(), value.to_string());
    }

    fn remove_extra_dimension(&self, key: &str) {
        self.extra_dimensions.write().remove(key);
    }
}

/// Union-merges `extra` into `dimensions`; values from `extra` win.
pub fn merge_dimensions(dimensions: &mut HashMap<String, String>, extra: &HashMap<String, String>) {
    for (k, v) in extra {
        dimensions.insert(k.clone(), v.clone());
    }
}

/// Renames dimension keys. Renaming to an empty string deletes the dimension.
pub fn transform_dimensions(
    dimensions: &mut HashMap<String, String>,
    transformations: &HashMap<String, String>,
) {
    for (from, to) in transformations {
        if let Some(value) = dimensions.remove(from) {
            if !to.is_empty() {
                dimensions.insert(to.clone(), value);
            }
        }
    }
}

/// An [`Output`] that keeps everything in memory. Extra dimensions are
/// applied the same way production outputs apply them.
#[derive(Default)]
pub struct TestOutput {
    datapoints: Mutex<Vec<Datapoint>>,
    events: Mutex<Vec<Event>>,
    dimensions: Mutex<Vec<Dimension>>,
    extra_dimensions: RwLock<HashMap<String, String>>,
}

impl TestOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(TestOutput::default())
    }

    pub fn datapoints(&self) -> Vec<Datapoint> {
        self.datapoints.lock().clone()
    }

    pub fn take_datapoints(&self) -> Vec<Datapoint> {
        std::mem::take(&mut *self.datapoints.lock())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn dimension_updates(&self) -> Vec<Dimension> {
        self.dimensions.lock().clone()
    }
}

#[async_trait]
impl Output for TestOutput {
    async fn send_datapoints(&self, datapoints: Vec<Datapoint>) {
        let extra = self.extra_dimensions.read().clone();
        let mut store = self.datapoints.lock();
        for mut dp in datapoints {
            merge_dimensions(&mut dp.dimensions, &extra);
            store.push(dp);
        }
    }

    async fn send_event(&self, mut event: Event) {
        merge_dimensions(&mut event.dimensions, &self.extra_dimensions.read());
        self.events.lock().push(event);
    }

    async fn send_dimension_update(&self, dimension: Dimension) {
        self.dimensions.lock().push(dimension);
    }

    fn add_extra_dimension(&self, key: &str, value: &str) {
        self.extra_dimensions
            .write()
            .insert(key.to_string(), value.to_string());
    }

    fn remove_extra_dimension(&self, key: &str) {
        self.extra_dimensions.write().remove(key);
    }
}
