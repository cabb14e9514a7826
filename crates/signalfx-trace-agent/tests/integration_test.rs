// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{send_tcp_request, TestAgent};
use serde_json::json;
use signalfx_core::internal_metrics::InternalMetricsSource;
use signalfx_core::span::SpanKind;
use signalfx_trace_agent::jaeger::{Batch, JaegerSpan, Process, Tag, TagValue};
use std::sync::atomic::Ordering;

fn zipkin_v1_payload() -> serde_json::Value {
    let frontend = json!({"serviceName": "frontend", "ipv4": "127.0.0.1"});
    json!([{
        "traceId": "86154a4ba6e91385",
        "id": "4d1e00c0db9010db",
        "name": "get",
        "timestamp": 1472470996199000i64,
        "duration": 207000,
        "annotations": [
            {"timestamp": 1472470996199000i64, "value": "cs", "endpoint": frontend},
            {"timestamp": 1472470996406000i64, "value": "cr", "endpoint": frontend}
        ],
        "binaryAnnotations": [
            {"key": "http.path", "value": "/api", "endpoint": frontend}
        ]
    }])
}

#[cfg(test)]
#[tokio::test]
async fn test_zipkin_json_spans_are_enriched_and_written() {
    let agent = TestAgent::start().await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/trace", agent.addr))
        .json(&zipkin_v1_payload())
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "\"OK\"");

    agent.writer.flush().await.unwrap();
    let spans = agent.sink.spans();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.kind, Some(SpanKind::Client));
    assert_eq!(span.tags["http.path"], "/api");
    assert_eq!(span.tags["container_id"], "abc123");
    assert_eq!(span.tags["kubernetes_pod_uid"], "pod-uid-1");
    assert_eq!(span.tags["env"], "test");
    assert!(span.meta.is_empty());

    let heartbeats = agent.tracker.correlation_datapoints();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].dimensions["sf_hasService"], "frontend");

    // Each (dimension, value, service) triple is only synced once.
    let updates = agent.dimensions.updates.lock().clone();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|d| d.merge_into_existing
        && d.properties["service"] == "frontend"
        && d.properties["cluster"] == "test-cluster"));

    assert_eq!(agent.stats.requests.load(Ordering::Relaxed), 1);
    assert_eq!(agent.stats.spans.load(Ordering::Relaxed), 1);
    agent.stop().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_jaeger_thrift_batch() {
    let agent = TestAgent::start().await;

    let batch = Batch {
        process: Process {
            service_name: "checkout".into(),
            tags: vec![Tag::new("hostname", TagValue::Str("node-1".into()))],
        },
        spans: vec![JaegerSpan {
            trace_id_low: 0x1234,
            trace_id_high: 0,
            span_id: 0xabc,
            parent_span_id: 0,
            operation_name: "POST /pay".into(),
            references: Vec::new(),
            flags: 1,
            start_time: 1_500_000,
            duration: 120,
            tags: vec![Tag::new("span.kind", TagValue::Str("server".into()))],
            logs: Vec::new(),
        }],
    };

    let (status, body) = send_tcp_request(
        agent.addr,
        "POST",
        "/v1/trace",
        "application/x-thrift",
        batch.encode(),
    )
    .await
    .expect("request failed");
    assert_eq!(status, 200);
    assert_eq!(body, "\"OK\"");

    agent.writer.flush().await.unwrap();
    let spans = agent.sink.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].trace_id, "0000000000001234");
    assert_eq!(spans[0].kind, Some(SpanKind::Server));
    assert_eq!(spans[0].local_service_name(), Some("checkout"));
    assert_eq!(spans[0].tags["hostname"], "node-1");
    assert_eq!(spans[0].tags["container_id"], "abc123");
    agent.stop().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_conversion_errors_keep_valid_spans() {
    let agent = TestAgent::start().await;

    let payload = json!([
        {
            "traceId": "1",
            "id": "2",
            "kind": "SERVER",
            "localEndpoint": {"serviceName": "api"}
        },
        {
            "traceId": "1",
            "id": "3",
            "kind": "CLIENT",
            "binaryAnnotations": [{"key": "a", "value": "b"}]
        },
        {
            "traceId": "1",
            "id": "4",
            "tags": {"x": "y"},
            "binaryAnnotations": [{"key": "c", "value": "d"}]
        }
    ]);
    let (status, body) = send_tcp_request(
        agent.addr,
        "POST",
        "/v1/trace",
        "application/json",
        serde_json::to_vec(&payload).unwrap(),
    )
    .await
    .expect("request failed");

    assert_eq!(status, 400);
    assert!(
        body.contains("2 errors encountered, last one was: span cannot have binaryAnnotations"),
        "unexpected body: {body}"
    );

    agent.writer.flush().await.unwrap();
    let spans = agent.sink.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].id, "0000000000000002");
    assert_eq!(agent.stats.errors.load(Ordering::Relaxed), 2);
    agent.stop().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_invalid_payloads_and_routes() {
    let agent = TestAgent::start().await;

    let (status, body) = send_tcp_request(
        agent.addr,
        "POST",
        "/v1/trace",
        "application/json",
        b"{not json".to_vec(),
    )
    .await
    .expect("request failed");
    assert_eq!(status, 400);
    assert!(body.contains("invalid JSON format"));

    let (status, _) = send_tcp_request(
        agent.addr,
        "POST",
        "/v1/trace",
        "application/vnd.apache.thrift.binary",
        vec![12, 0, 1, 11],
    )
    .await
    .expect("request failed");
    assert_eq!(status, 400);

    let (status, _) =
        send_tcp_request(agent.addr, "GET", "/v1/trace", "text/plain", Vec::new())
            .await
            .expect("request failed");
    assert_eq!(status, 404);

    let (status, _) =
        send_tcp_request(agent.addr, "POST", "/metrics", "text/plain", Vec::new())
            .await
            .expect("request failed");
    assert_eq!(status, 404);

    let metrics = agent.stats.internal_metrics();
    assert_eq!(metrics.len(), 3);
    assert_eq!(agent.stats.requests.load(Ordering::Relaxed), 2);
    assert_eq!(agent.stats.errors.load(Ordering::Relaxed), 2);
    assert!(agent.sink.spans().is_empty());
    agent.stop().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_v2_endpoint_rejects_v1_spans() {
    let agent = TestAgent::start().await;

    let (status, body) = send_tcp_request(
        agent.addr,
        "POST",
        "/v2/trace",
        "application/json",
        serde_json::to_vec(&zipkin_v1_payload()).unwrap(),
    )
    .await
    .expect("request failed");
    assert_eq!(status, 400);
    assert!(body.contains("1 errors encountered"), "unexpected body: {body}");

    let v2 = json!([{
        "traceId": "abc",
        "id": "def",
        "kind": "PRODUCER",
        "localEndpoint": {"serviceName": "queue"}
    }]);
    let (status, _) = send_tcp_request(
        agent.addr,
        "POST",
        "/v2/trace",
        "application/json",
        serde_json::to_vec(&v2).unwrap(),
    )
    .await
    .expect("request failed");
    assert_eq!(status, 200);

    agent.writer.flush().await.unwrap();
    let spans = agent.sink.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].kind, Some(SpanKind::Producer));
    agent.stop().await;
}
