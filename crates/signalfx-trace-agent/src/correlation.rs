// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use signalfx_core::scheduler::run_on_interval;
use signalfx_core::writer::WriterHandle;

use crate::tracker::ActiveServiceTracker;

pub const DEFAULT_CORRELATION_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically sends the tracker's heartbeat datapoints to the writer.
/// Reading them also purges idle services, so this loop drives eviction.
pub struct CorrelationEmitter {
    tracker: Arc<ActiveServiceTracker>,
    writer: WriterHandle,
    interval: Duration,
}

impl CorrelationEmitter {
    pub fn new(
        tracker: Arc<ActiveServiceTracker>,
        writer: WriterHandle,
        interval: Duration,
    ) -> Self {
        CorrelationEmitter {
            tracker,
            writer,
            interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let CorrelationEmitter {
            tracker,
            writer,
            interval,
        } = self;
        run_on_interval(cancel, interval, move || {
            let tracker = Arc::clone(&tracker);
            let writer = writer.clone();
            async move { emit(&tracker, &writer).await }
        })
    }
}

async fn emit(tracker: &ActiveServiceTracker, writer: &WriterHandle) {
    let datapoints = tracker.correlation_datapoints();
    if datapoints.is_empty() {
        return;
    }
    debug!("Sending {} service heartbeat datapoints", datapoints.len());
    if let Err(e) = writer.send_datapoints(datapoints).await {
        error!("Failed to send service heartbeats: {e}");
    }
}
