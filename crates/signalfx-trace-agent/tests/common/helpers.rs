// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use signalfx_core::datapoint::Dimension;
use signalfx_core::dimensions::DimensionUpdater;
use signalfx_core::errors::SinkError;
use signalfx_core::sink::RecordingSink;
use signalfx_core::writer::{WriterHandle, WriterService, WriterSettings};
use signalfx_trace_agent::processor::SpanProcessor;
use signalfx_trace_agent::receiver::{ReceiverConfig, ReceiverStats, TraceReceiver};
use signalfx_trace_agent::span_source::{HostEndpointIndex, SpanSourceTracker};
use signalfx_trace_agent::tracker::ActiveServiceTracker;

/// Keeps every dimension update instead of calling the API.
#[derive(Default)]
pub struct RecordingUpdater {
    pub updates: parking_lot::Mutex<Vec<Dimension>>,
}

#[async_trait::async_trait]
impl DimensionUpdater for RecordingUpdater {
    async fn update(&self, dimension: Dimension) -> Result<(), SinkError> {
        self.updates.lock().push(dimension);
        Ok(())
    }
}

/// A receiver listening on an ephemeral port, wired to a recording sink.
pub struct TestAgent {
    pub addr: SocketAddr,
    pub sink: Arc<RecordingSink>,
    pub dimensions: Arc<RecordingUpdater>,
    pub writer: WriterHandle,
    pub tracker: Arc<ActiveServiceTracker>,
    pub stats: Arc<ReceiverStats>,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl TestAgent {
    pub async fn start() -> TestAgent {
        let cancel = CancellationToken::new();
        let sink = Arc::new(RecordingSink::default());
        let dimensions = Arc::new(RecordingUpdater::default());
        let (writer_service, writer) = WriterService::new(
            sink.clone(),
            Some(dimensions.clone()),
            WriterSettings::default(),
            cancel.clone(),
        );
        let writer_task = tokio::spawn(writer_service.run());

        let index = Arc::new(HostEndpointIndex::new());
        index.add(
            "127.0.0.1",
            "container-1",
            HashMap::from([
                ("container_id".to_string(), "abc123".to_string()),
                ("kubernetes_pod_uid".to_string(), "pod-uid-1".to_string()),
            ]),
        );
        let tracker = Arc::new(ActiveServiceTracker::new(Duration::from_secs(300), None));
        let processor = SpanProcessor::new(writer.clone())
            .with_global_span_tags(HashMap::from([("env".to_string(), "test".to_string())]))
            .with_service_tracker(tracker.clone())
            .with_span_source_tracker(Arc::new(SpanSourceTracker::new(index, "test-cluster")));

        let receiver = TraceReceiver::new(
            ReceiverConfig {
                port: 0,
                ..Default::default()
            },
            Arc::new(processor),
        );
        let stats = receiver.stats();
        let listener = receiver.bind().await.expect("failed to bind receiver");
        let addr = listener.local_addr().expect("no local address");
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            receiver
                .serve(listener, server_cancel)
                .await
                .expect("receiver failed");
        });

        TestAgent {
            addr,
            sink,
            dimensions,
            writer,
            tracker,
            stats,
            cancel,
            server,
            writer_task,
        }
    }

    pub async fn stop(self) {
        self.writer.flush().await.expect("flush failed");
        self.cancel.cancel();
        self.server.await.expect("server task failed");
        self.writer_task.await.expect("writer task failed");
    }
}

/// Send an HTTP request over TCP and return the status and body
pub async fn send_tcp_request(
    addr: SocketAddr,
    method: &str,
    uri: &str,
    content_type: &str,
    body: Vec<u8>,
) -> Result<(StatusCode, String), Box<dyn std::error::Error>> {
    let stream = timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(addr)).await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", addr.to_string())
        .header("Content-Type", content_type)
        .header("Content-Length", body.len().to_string())
        .body(Full::new(Bytes::from(body)))?;
    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;

    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8(bytes.to_vec())?))
}
