// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The writer receives telemetry from every monitor and receiver over a
//! bounded channel and hands it to the sink chain. A full channel blocks the
//! producers, which is the only backpressure mechanism in the pipeline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::datapoint::{Datapoint, Dimension};
use crate::dimensions::DimensionUpdater;
use crate::event::Event;
use crate::sink::Sink;
use crate::span::Span;

#[derive(Debug)]
pub enum WriterCommand {
    Datapoints(Vec<Datapoint>),
    Event(Event),
    Dimension(Dimension),
    Spans(Vec<Span>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    /// Concurrent requests allowed against the sink.
    pub max_requests: usize,
    pub datapoint_max_batch_size: usize,
    pub span_max_batch_size: usize,
    pub event_send_interval: Duration,
    pub event_buffer_capacity: usize,
    pub channel_capacity: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        WriterSettings {
            max_requests: 10,
            datapoint_max_batch_size: 1000,
            span_max_batch_size: 1000,
            event_send_interval: Duration::from_secs(1),
            event_buffer_capacity: 1000,
            channel_capacity: 1000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
}

impl WriterHandle {
    pub fn from_sender(tx: mpsc::Sender<WriterCommand>) -> Self {
        WriterHandle { tx }
    }

    pub async fn send_datapoints(
        &self,
        datapoints: Vec<Datapoint>,
    ) -> Result<(), mpsc::error::SendError<WriterCommand>> {
        self.tx.send(WriterCommand::Datapoints(datapoints)).await
    }

    pub async fn send_event(
        &self,
        event: Event,
    ) -> Result<(), mpsc::error::SendError<WriterCommand>> {
        self.tx.send(WriterCommand::Event(event)).await
    }

    pub async fn send_dimension_update(
        &self,
        dimension: Dimension,
    ) -> Result<(), mpsc::error::SendError<WriterCommand>> {
        self.tx.send(WriterCommand::Dimension(dimension)).await
    }

    pub async fn send_spans(
        &self,
        spans: Vec<Span>,
    ) -> Result<(), mpsc::error::SendError<WriterCommand>> {
        self.tx.send(WriterCommand::Spans(spans)).await
    }

    /// Waits until everything sent before this call has left the writer.
    pub async fn flush(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(response_tx))
            .await
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }

    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<WriterCommand>> {
        self.tx.send(WriterCommand::Shutdown).await
    }
}

pub struct WriterService {
    sink: Arc<dyn Sink>,
    dimension_updater: Option<Arc<dyn DimensionUpdater>>,
    settings: WriterSettings,
    cancel: CancellationToken,
    rx: mpsc::Receiver<WriterCommand>,
}

impl WriterService {
    pub fn new(
        sink: Arc<dyn Sink>,
        dimension_updater: Option<Arc<dyn DimensionUpdater>>,
        settings: WriterSettings,
        cancel: CancellationToken,
    ) -> (Self, WriterHandle) {
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let service = WriterService {
            sink,
            dimension_updater,
            settings,
            cancel,
            rx,
        };
        (service, WriterHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Writer service started");

        let permits = Arc::new(Semaphore::new(self.settings.max_requests.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut event_buffer: Vec<Event> = Vec::with_capacity(self.settings.event_buffer_capacity);

        let mut event_ticker = interval(self.settings.event_send_interval);
        event_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        event_ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Writer service cancelled");
                    break;
                }
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        debug!("All writer handles dropped");
                        break;
                    };
                    match command {
                        WriterCommand::Datapoints(datapoints) => {
                            let batch_size = self.settings.datapoint_max_batch_size.max(1);
                            let batches = chunk(datapoints, batch_size);
                            self.spawn_datapoints(&permits, &mut in_flight, batches).await;
                        }
                        WriterCommand::Spans(spans) => {
                            let batch_size = self.settings.span_max_batch_size.max(1);
                            let batches = chunk(spans, batch_size);
                            self.spawn_spans(&permits, &mut in_flight, batches).await;
                        }
                        WriterCommand::Event(event) => {
                            if event_buffer.len() >= self.settings.event_buffer_capacity {
                                error!(
                                    event_type = %event.event_type,
                                    buffer_len = event_buffer.len(),
                                    "Dropping event due to overfull buffer"
                                );
                                continue;
                            }
                            event_buffer.push(event);
                        }
                        WriterCommand::Dimension(dimension) => {
                            self.spawn_dimension(&mut in_flight, dimension);
                        }
                        WriterCommand::Flush(response_tx) => {
                            self.send_events(std::mem::take(&mut event_buffer)).await;
                            drain(&mut in_flight).await;
                            if response_tx.send(()).is_err() {
                                error!("Failed to send flush response - receiver dropped");
                            }
                        }
                        WriterCommand::Shutdown => {
                            debug!("Writer service shutting down");
                            self.send_events(std::mem::take(&mut event_buffer)).await;
                            drain(&mut in_flight).await;
                            break;
                        }
                    }
                }
                _ = event_ticker.tick() => {
                    if !event_buffer.is_empty() {
                        let events = std::mem::replace(
                            &mut event_buffer,
                            Vec::with_capacity(self.settings.event_buffer_capacity),
                        );
                        let sink = Arc::clone(&self.sink);
                        let cancel = self.cancel.clone();
                        in_flight.spawn(async move {
                            if let Err(e) = sink.add_events(&cancel, events).await {
                                error!("Error shipping events: {e}");
                            }
                        });
                    }
                }
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Writer request task panicked: {:?}", e);
                        }
                    }
                }
            }
        }

        debug!("Writer service stopped");
    }

    /// The batches of one send go out one after another so ingest sees them
    /// in order. Separate sends may still overlap.
    async fn spawn_datapoints(
        &self,
        permits: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
        batches: Vec<Vec<Datapoint>>,
    ) {
        if batches.is_empty() {
            return;
        }
        let Ok(permit) = Arc::clone(permits).acquire_owned().await else {
            return;
        };
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        in_flight.spawn(async move {
            for datapoints in batches {
                let count = datapoints.len();
                match sink.add_datapoints(&cancel, datapoints).await {
                    Ok(()) => debug!("Sent {count} datapoints out of the agent"),
                    Err(e) => error!("Error shipping datapoints: {e}"),
                }
            }
            drop(permit);
        });
    }

    async fn spawn_spans(
        &self,
        permits: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
        batches: Vec<Vec<Span>>,
    ) {
        if batches.is_empty() {
            return;
        }
        let Ok(permit) = Arc::clone(permits).acquire_owned().await else {
            return;
        };
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        in_flight.spawn(async move {
            for spans in batches {
                let count = spans.len();
                match sink.add_spans(&cancel, spans).await {
                    Ok(()) => debug!("Sent {count} trace spans out of the agent"),
                    Err(e) => error!("Error shipping trace spans: {e}"),
                }
            }
            drop(permit);
        });
    }

    fn spawn_dimension(&self, in_flight: &mut JoinSet<()>, dimension: Dimension) {
        let Some(updater) = self.dimension_updater.as_ref().map(Arc::clone) else {
            warn!(
                dimension = %dimension.name,
                "No dimension client configured, dropping dimension update"
            );
            return;
        };
        in_flight.spawn(async move {
            let (name, value) = dimension.key();
            if let Err(e) = updater.update(dimension).await {
                error!(dim_name = %name, dim_value = %value, "Could not send dimension update: {e}");
            }
        });
    }

    async fn send_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.sink.add_events(&self.cancel, events).await {
            error!("Error shipping events: {e}");
        }
    }
}

fn chunk<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut out = Vec::with_capacity(items.len() / size + 1);
    while items.len() > size {
        let rest = items.split_off(size);
        out.push(items);
        items = rest;
    }
    if !items.is_empty() {
        out.push(items);
    }
    out
}

async fn drain(in_flight: &mut JoinSet<()>) {
    while let Some(finished) = in_flight.join_next().await {
        if let Err(e) = finished {
            if e.is_panic() {
                error!("Writer request task panicked: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;
    use crate::sink::RecordingSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingUpdater {
        updates: Mutex<Vec<Dimension>>,
    }

    #[async_trait]
    impl DimensionUpdater for RecordingUpdater {
        async fn update(&self, dimension: Dimension) -> Result<(), crate::errors::SinkError> {
            self.updates.lock().push(dimension);
            Ok(())
        }
    }

    fn start(
        settings: WriterSettings,
    ) -> (Arc<RecordingSink>, Arc<RecordingUpdater>, WriterHandle, tokio::task::JoinHandle<()>) {
        let sink = Arc::new(RecordingSink::default());
        let updater = Arc::new(RecordingUpdater::default());
        let (service, handle) = WriterService::new(
            sink.clone(),
            Some(updater.clone()),
            settings,
            CancellationToken::new(),
        );
        let task = tokio::spawn(service.run());
        (sink, updater, handle, task)
    }

    #[test]
    fn test_chunk() {
        assert_eq!(chunk(vec![1, 2, 3, 4, 5], 2), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(chunk(vec![1, 2], 2), vec![vec![1, 2]]);
        assert!(chunk(Vec::<i32>::new(), 2).is_empty());
    }

    #[tokio::test]
    async fn test_writer_forwards_everything_on_flush() {
        let (sink, updater, handle, task) = start(WriterSettings::default());

        handle
            .send_datapoints(vec![Datapoint::gauge("a", 1i64), Datapoint::gauge("b", 2i64)])
            .await
            .expect("send failed");
        handle
            .send_event(Event::new("restart", EventCategory::Agent))
            .await
            .expect("send failed");
        handle
            .send_spans(vec![Span {
                trace_id: "0000000000000001".into(),
                id: "0000000000000001".into(),
                ..Default::default()
            }])
            .await
            .expect("send failed");
        handle
            .send_dimension_update(Dimension {
                name: "container_id".into(),
                value: "abc".into(),
                properties: Default::default(),
                tags: vec![],
                merge_into_existing: true,
            })
            .await
            .expect("send failed");

        handle.flush().await.expect("flush failed");

        assert_eq!(sink.datapoints().len(), 2);
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.spans().len(), 1);
        assert_eq!(updater.updates.lock().len(), 1);

        handle.shutdown().await.expect("shutdown failed");
        task.await.expect("writer task failed");
    }

    #[tokio::test]
    async fn test_writer_batches_large_sends() {
        let settings = WriterSettings {
            datapoint_max_batch_size: 2,
            ..Default::default()
        };
        let (sink, _, handle, task) = start(settings);
        let dps = (0..5)
            .map(|i| Datapoint::gauge(format!("m{i}"), i as i64))
            .collect::<Vec<_>>();
        handle.send_datapoints(dps).await.unwrap();
        handle.flush().await.unwrap();

        assert_eq!(sink.batches.load(std::sync::atomic::Ordering::Relaxed), 3);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    /// Answers the first batch slowest.
    #[derive(Default)]
    struct SlowStartSink {
        calls: std::sync::atomic::AtomicU64,
        metrics: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Sink for SlowStartSink {
        async fn add_datapoints(
            &self,
            _cancel: &CancellationToken,
            datapoints: Vec<Datapoint>,
        ) -> Result<(), crate::errors::SinkError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let delay = 50u64.saturating_sub(call * 10);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            self.metrics
                .lock()
                .extend(datapoints.into_iter().map(|dp| dp.metric));
            Ok(())
        }

        async fn add_events(
            &self,
            _cancel: &CancellationToken,
            _events: Vec<Event>,
        ) -> Result<(), crate::errors::SinkError> {
            Ok(())
        }

        async fn add_spans(
            &self,
            _cancel: &CancellationToken,
            _spans: Vec<Span>,
        ) -> Result<(), crate::errors::SinkError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_of_one_send_keep_their_order() {
        let sink = Arc::new(SlowStartSink::default());
        let settings = WriterSettings {
            datapoint_max_batch_size: 2,
            ..Default::default()
        };
        let (service, handle) =
            WriterService::new(sink.clone(), None, settings, CancellationToken::new());
        let task = tokio::spawn(service.run());

        let dps = (0..5)
            .map(|i| Datapoint::gauge(format!("m{i}"), i as i64))
            .collect::<Vec<_>>();
        handle.send_datapoints(dps).await.unwrap();
        handle.flush().await.unwrap();

        assert_eq!(*sink.metrics.lock(), vec!["m0", "m1", "m2", "m3", "m4"]);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_event_buffer_overflow_drops_events() {
        let settings = WriterSettings {
            event_buffer_capacity: 2,
            event_send_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (sink, _, handle, task) = start(settings);
        for i in 0..4 {
            handle
                .send_event(Event::new(format!("e{i}"), EventCategory::UserDefined))
                .await
                .unwrap();
        }
        handle.flush().await.unwrap();
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "e0");

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_sent_on_interval() {
        let (sink, _, handle, task) = start(WriterSettings::default());
        handle
            .send_event(Event::new("tick", EventCategory::UserDefined))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        // Let the spawned send finish.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.events().len(), 1);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
