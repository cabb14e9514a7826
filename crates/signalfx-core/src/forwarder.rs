// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The terminal sink: encodes telemetry as ingest JSON and posts it to the
//! backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::datapoint::{Datapoint, Scalar, Value};
use crate::errors::SinkError;
use crate::event::{Event, EventCategory};
use crate::http_utils::{join_url, json_headers};
use crate::sink::Sink;
use crate::span::Span;

pub const DATAPOINT_PATH: &str = "v2/datapoint";
pub const EVENT_PATH: &str = "v2/event";
pub const TRACE_PATH: &str = "v1/trace";

#[derive(Serialize)]
struct IngestDatapoint<'a> {
    metric: &'a str,
    value: &'a Value,
    dimensions: &'a HashMap<String, String>,
    timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestEvent<'a> {
    category: EventCategory,
    event_type: &'a str,
    dimensions: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    properties: &'a HashMap<String, Scalar>,
    timestamp: i64,
}

/// Encodes datapoints grouped by ingest type. Datapoints with an empty metric
/// name are dropped and missing timestamps are set to `now`.
pub fn encode_datapoints(
    datapoints: &[Datapoint],
    now: DateTime<Utc>,
) -> Result<Vec<u8>, SinkError> {
    let mut grouped: Map<String, JsonValue> = Map::new();
    for dp in datapoints {
        if dp.metric.is_empty() {
            warn!("Dropping datapoint without a metric name: {dp}");
            continue;
        }
        let encoded = serde_json::to_value(IngestDatapoint {
            metric: &dp.metric,
            value: &dp.value,
            dimensions: &dp.dimensions,
            timestamp: dp.timestamp.unwrap_or(now).timestamp_millis(),
        })
        .map_err(|e| SinkError::Payload(e.to_string()))?;

        match grouped
            .entry(dp.metric_type.ingest_key())
            .or_insert_with(|| JsonValue::Array(Vec::new()))
        {
            JsonValue::Array(list) => list.push(encoded),
            _ => return Err(SinkError::Payload("malformed datapoint group".to_string())),
        }
    }
    serde_json::to_vec(&grouped).map_err(|e| SinkError::Payload(e.to_string()))
}

pub fn encode_events(events: &[Event], now: DateTime<Utc>) -> Result<Vec<u8>, SinkError> {
    let encoded = events
        .iter()
        .map(|ev| IngestEvent {
            category: ev.category,
            event_type: &ev.event_type,
            dimensions: &ev.dimensions,
            properties: &ev.properties,
            timestamp: ev.timestamp.unwrap_or(now).timestamp_millis(),
        })
        .collect::<Vec<_>>();
    serde_json::to_vec(&encoded).map_err(|e| SinkError::Payload(e.to_string()))
}

#[derive(Clone)]
pub struct IngestForwarder {
    client: reqwest::Client,
    access_token: String,
    datapoint_url: String,
    event_url: String,
    trace_url: String,
}

impl IngestForwarder {
    /// `trace_endpoint` overrides the URL spans are posted to; when unset they
    /// go to the ingest URL.
    pub fn new(
        client: reqwest::Client,
        access_token: impl Into<String>,
        ingest_url: &str,
        trace_endpoint: Option<&str>,
    ) -> Self {
        IngestForwarder {
            client,
            access_token: access_token.into(),
            datapoint_url: join_url(ingest_url, DATAPOINT_PATH),
            event_url: join_url(ingest_url, EVENT_PATH),
            trace_url: trace_endpoint
                .map(str::to_string)
                .unwrap_or_else(|| join_url(ingest_url, TRACE_PATH)),
        }
    }

    pub fn trace_url(&self) -> &str {
        &self.trace_url
    }

    async fn post(
        &self,
        cancel: &CancellationToken,
        url: &str,
        body: Vec<u8>,
    ) -> Result<(), SinkError> {
        let request = self
            .client
            .post(url)
            .headers(json_headers(&self.access_token))
            .body(body);

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SinkError::Cancelled),
            resp = request.send() => resp,
        };

        let resp = resp.map_err(|e| SinkError::Destination {
            status: e.status(),
            url: url.to_string(),
            body: e.to_string(),
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            error!("{}: Failed to push to {}: {:?}", status, url, body);
        } else {
            warn!("{}: Temporary failure pushing to {}: {:?}", status, url, body);
        }
        Err(SinkError::Destination {
            status: Some(status),
            url: url.to_string(),
            body,
        })
    }
}

#[async_trait]
impl Sink for IngestForwarder {
    async fn add_datapoints(
        &self,
        cancel: &CancellationToken,
        datapoints: Vec<Datapoint>,
    ) -> Result<(), SinkError> {
        let body = encode_datapoints(&datapoints, Utc::now())?;
        debug!("Sending {} datapoints to {}", datapoints.len(), self.datapoint_url);
        self.post(cancel, &self.datapoint_url, body).await
    }

    async fn add_events(
        &self,
        cancel: &CancellationToken,
        events: Vec<Event>,
    ) -> Result<(), SinkError> {
        let body = encode_events(&events, Utc::now())?;
        debug!("Sending {} events to {}", events.len(), self.event_url);
        self.post(cancel, &self.event_url, body).await
    }

    async fn add_spans(
        &self,
        cancel: &CancellationToken,
        spans: Vec<Span>,
    ) -> Result<(), SinkError> {
        let body = serde_json::to_vec(&spans).map_err(|e| SinkError::Payload(e.to_string()))?;
        debug!("Sending {} spans to {}", spans.len(), self.trace_url);
        self.post(cancel, &self.trace_url, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::MetricType;
    use chrono::TimeZone;
    use mockito::{Matcher, Server};
    use std::time::Duration;

    fn client() -> reqwest::Client {
        crate::http_utils::build_client(None, Duration::from_secs(5), 10).unwrap()
    }

    #[test]
    fn test_encode_datapoints_groups_by_type() {
        let now = Utc.timestamp_millis_opt(1_000).unwrap();
        let dps = vec![
            Datapoint::gauge("g", 1i64).with_dimension("host", "a"),
            Datapoint::cumulative("c", 2.5f64)
                .with_timestamp(Utc.timestamp_millis_opt(500).unwrap()),
            Datapoint::new("n", HashMap::new(), 3i64, MetricType::Counter, None),
            Datapoint::gauge("", 4i64),
        ];
        let body: JsonValue = serde_json::from_slice(&encode_datapoints(&dps, now).unwrap()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "gauge": [{"metric": "g", "value": 1, "dimensions": {"host": "a"}, "timestamp": 1000}],
                "cumulative_counter": [{"metric": "c", "value": 2.5, "dimensions": {}, "timestamp": 500}],
                "counter": [{"metric": "n", "value": 3, "dimensions": {}, "timestamp": 1000}],
            })
        );
    }

    #[test]
    fn test_encode_events() {
        let now = Utc.timestamp_millis_opt(42).unwrap();
        let mut ev = Event::new("deploy", EventCategory::UserDefined);
        ev.dimensions.insert("service".into(), "web".into());
        let body: JsonValue = serde_json::from_slice(&encode_events(&[ev], now).unwrap()).unwrap();
        assert_eq!(
            body,
            serde_json::json!([{
                "category": "USER_DEFINED",
                "eventType": "deploy",
                "dimensions": {"service": "web"},
                "timestamp": 42
            }])
        );
    }

    #[tokio::test]
    async fn test_datapoints_are_posted_with_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/datapoint")
            .match_header("X-SF-TOKEN", "secret")
            .match_header("Content-Type", "application/json")
            .match_body(Matcher::Regex(
                r#"^\{"gauge":\[\{"metric":"cpu.utilization","value":10,"#.to_string(),
            ))
            .with_status(200)
            .with_body("\"OK\"")
            .create_async()
            .await;

        let forwarder = IngestForwarder::new(client(), "secret", &server.url(), None);
        forwarder
            .add_datapoints(
                &CancellationToken::new(),
                vec![Datapoint::gauge("cpu.utilization", 10i64)],
            )
            .await
            .expect("send failed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_keeps_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/event")
            .with_status(401)
            .with_body("bad token")
            .create_async()
            .await;

        let forwarder = IngestForwarder::new(client(), "nope", &server.url(), None);
        let err = forwarder
            .add_events(
                &CancellationToken::new(),
                vec![Event::new("x", EventCategory::Agent)],
            )
            .await
            .unwrap_err();
        match &err {
            SinkError::Destination { status, body, .. } => {
                assert_eq!(status.map(|s| s.as_u16()), Some(401));
                assert_eq!(body, "bad token");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_spans_go_to_trace_endpoint_override() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/custom/trace")
            .match_body(Matcher::Regex(r#""traceId":"0000000000000001""#.to_string()))
            .with_status(200)
            .create_async()
            .await;

        let trace_url = format!("{}/custom/trace", server.url());
        let forwarder = IngestForwarder::new(
            client(),
            "t",
            "https://ingest.invalid",
            Some(&trace_url),
        );
        forwarder
            .add_spans(
                &CancellationToken::new(),
                vec![Span {
                    trace_id: "0000000000000001".into(),
                    id: "0000000000000002".into(),
                    ..Default::default()
                }],
            )
            .await
            .expect("send failed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancelled_send() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let forwarder = IngestForwarder::new(client(), "t", "http://10.255.255.1:9", None);
        let err = forwarder
            .add_datapoints(&cancel, vec![Datapoint::gauge("m", 1i64)])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Cancelled));
    }
}
