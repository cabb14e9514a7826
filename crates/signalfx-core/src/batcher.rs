// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fan-in for collectors that produce datapoints one at a time from many
//! tasks. A single consumer groups them into batches before they reach the
//! monitor output.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::datapoint::Datapoint;
use crate::output::Output;

pub const DEFAULT_MAX_BATCH: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug)]
pub enum BatchCommand {
    Datapoint(Datapoint),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct BatchHandle {
    tx: mpsc::Sender<BatchCommand>,
}

impl BatchHandle {
    /// Waits for room in the queue when it is full.
    pub async fn send(&self, datapoint: Datapoint) -> Result<(), mpsc::error::SendError<BatchCommand>> {
        self.tx.send(BatchCommand::Datapoint(datapoint)).await
    }

    /// Returns once everything queued before the call has been handed to the
    /// output.
    pub async fn flush(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(BatchCommand::Flush(response_tx))
            .await
            .map_err(|e| format!("Failed to send flush command: {}", e))?;
        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }
}

pub struct DatapointBatcher {
    output: Arc<dyn Output>,
    rx: mpsc::Receiver<BatchCommand>,
    max_batch: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
}

impl DatapointBatcher {
    pub fn new(
        output: Arc<dyn Output>,
        cancel: CancellationToken,
        max_batch: usize,
        flush_interval: Duration,
        queue_capacity: usize,
    ) -> (Self, BatchHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        (
            DatapointBatcher {
                output,
                rx,
                max_batch: max_batch.max(1),
                flush_interval,
                cancel,
            },
            BatchHandle { tx },
        )
    }

    pub fn with_defaults(output: Arc<dyn Output>, cancel: CancellationToken) -> (Self, BatchHandle) {
        Self::new(
            output,
            cancel,
            DEFAULT_MAX_BATCH,
            DEFAULT_FLUSH_INTERVAL,
            DEFAULT_QUEUE_CAPACITY,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut buffer: Vec<Datapoint> = Vec::with_capacity(self.max_batch);
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.send(&mut buffer).await;
                    debug!("Datapoint batcher cancelled");
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(BatchCommand::Datapoint(dp)) => {
                        buffer.push(dp);
                        if buffer.len() >= self.max_batch {
                            self.send(&mut buffer).await;
                        }
                    }
                    Some(BatchCommand::Flush(response_tx)) => {
                        self.send(&mut buffer).await;
                        if response_tx.send(()).is_err() {
                            error!("Failed to send flush response - receiver dropped");
                        }
                    }
                    None => {
                        self.send(&mut buffer).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.send(&mut buffer).await;
                }
            }
        }
    }

    async fn send(&self, buffer: &mut Vec<Datapoint>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(buffer, Vec::with_capacity(self.max_batch));
        self.output.send_datapoints(batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::TestOutput;

    #[tokio::test]
    async fn test_batches_at_max_size() {
        let output = TestOutput::new();
        let (batcher, handle) = DatapointBatcher::new(
            output.clone(),
            CancellationToken::new(),
            3,
            Duration::from_secs(3600),
            10,
        );
        let task = batcher.spawn();

        for i in 0..7 {
            handle.send(Datapoint::gauge(format!("m{i}"), i as i64)).await.unwrap();
        }
        handle.flush().await.unwrap();
        let dps = output.datapoints();
        assert_eq!(
            dps.iter().map(|dp| dp.metric.as_str()).collect::<Vec<_>>(),
            vec!["m0", "m1", "m2", "m3", "m4", "m5", "m6"]
        );

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_interval() {
        let output = TestOutput::new();
        let (batcher, handle) = DatapointBatcher::with_defaults(output.clone(), CancellationToken::new());
        let task = batcher.spawn();

        handle.send(Datapoint::gauge("lonely", 1i64)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(output.datapoints().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(output.datapoints().len(), 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_sends_remaining() {
        let output = TestOutput::new();
        let cancel = CancellationToken::new();
        let (batcher, handle) = DatapointBatcher::new(
            output.clone(),
            cancel.clone(),
            50,
            Duration::from_secs(3600),
            10,
        );
        let task = batcher.spawn();
        handle.send(Datapoint::gauge("pending", 1i64)).await.unwrap();
        // The send only queues; make sure the consumer has seen it.
        handle.flush().await.unwrap();
        handle.send(Datapoint::gauge("pending2", 1i64)).await.unwrap();
        tokio::task::yield_now().await;
        cancel.cancel();
        task.await.unwrap();
        assert!(!output.datapoints().is_empty());
    }
}
