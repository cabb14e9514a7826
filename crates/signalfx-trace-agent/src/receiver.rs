// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use signalfx_core::datapoint::Datapoint;
use signalfx_core::internal_metrics::{cumulative, InternalMetricsSource};
use signalfx_core::span::SOURCE_IP_META_KEY;

use crate::errors::DecodeError;
use crate::http_utils::{
    check_content_length, content_type, json_response, not_found, read_body, HttpResponse,
};
use crate::processor::TraceProcessor;
use crate::{jaeger, zipkin};

pub const TRACE_ENDPOINT_PATH: &str = "/v1/trace";
pub const TRACE_V2_ENDPOINT_PATH: &str = "/v2/trace";
pub const DEFAULT_RECEIVER_PORT: u16 = 9080;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

const THRIFT_CONTENT_TYPES: [&str; 2] = [
    "application/x-thrift",
    "application/vnd.apache.thrift.binary",
];

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub listen_address: IpAddr,
    pub port: u16,
    pub max_request_bytes: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_RECEIVER_PORT,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub requests: AtomicI64,
    pub spans: AtomicI64,
    pub errors: AtomicI64,
}

impl InternalMetricsSource for ReceiverStats {
    fn internal_metrics(&self) -> Vec<Datapoint> {
        vec![
            cumulative(
                "sfxagent.trace_receiver_requests",
                self.requests.load(Ordering::Relaxed),
            ),
            cumulative(
                "sfxagent.trace_receiver_spans",
                self.spans.load(Ordering::Relaxed),
            ),
            cumulative(
                "sfxagent.trace_receiver_errors",
                self.errors.load(Ordering::Relaxed),
            ),
        ]
    }
}

#[derive(Clone, Copy)]
enum Accepts {
    Any,
    ZipkinV2,
}

pub struct TraceReceiver {
    config: ReceiverConfig,
    processor: Arc<dyn TraceProcessor>,
    stats: Arc<ReceiverStats>,
}

impl TraceReceiver {
    pub fn new(config: ReceiverConfig, processor: Arc<dyn TraceProcessor>) -> Self {
        TraceReceiver {
            config,
            processor,
            stats: Arc::new(ReceiverStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        let addr = SocketAddr::new(self.config.listen_address, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        debug!("Trace receiver listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serves connections from `listener` until `cancel` fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let (conn, remote) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Trace receiver shutting down");
                    break;
                }
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok(accepted) => accepted,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };

            let processor = Arc::clone(&self.processor);
            let stats = Arc::clone(&self.stats);
            let max_request_bytes = self.config.max_request_bytes;
            let service = service_fn(move |req| {
                trace_endpoint_handler(
                    req,
                    remote.ip(),
                    Arc::clone(&processor),
                    Arc::clone(&stats),
                    max_request_bytes,
                )
            });

            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }

        joinset.shutdown().await;
        Ok(())
    }
}

async fn trace_endpoint_handler(
    req: Request<Incoming>,
    remote_ip: IpAddr,
    processor: Arc<dyn TraceProcessor>,
    stats: Arc<ReceiverStats>,
    max_request_bytes: usize,
) -> http::Result<HttpResponse> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, TRACE_ENDPOINT_PATH) => {
            handle_traces(
                req,
                remote_ip,
                Accepts::Any,
                processor,
                &stats,
                max_request_bytes,
            )
            .await
        }
        (&Method::POST, TRACE_V2_ENDPOINT_PATH) => {
            handle_traces(
                req,
                remote_ip,
                Accepts::ZipkinV2,
                processor,
                &stats,
                max_request_bytes,
            )
            .await
        }
        _ => Ok(not_found()),
    }
}

async fn handle_traces(
    req: Request<Incoming>,
    remote_ip: IpAddr,
    accepts: Accepts,
    processor: Arc<dyn TraceProcessor>,
    stats: &ReceiverStats,
    max_request_bytes: usize,
) -> http::Result<HttpResponse> {
    stats.requests.fetch_add(1, Ordering::Relaxed);
    let (parts, body) = req.into_parts();

    if let Err(rejection) = check_content_length(&parts.headers, max_request_bytes) {
        stats.errors.fetch_add(1, Ordering::Relaxed);
        return json_response(
            &format!("Rejected trace request: {}", rejection.reason),
            rejection.status,
        );
    }

    let body = match read_body(body, max_request_bytes).await {
        Ok(body) => body,
        Err(e) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return json_response(
                &format!("Error reading trace request body: {e}"),
                StatusCode::PAYLOAD_TOO_LARGE,
            );
        }
    };

    let media_type = content_type(&parts.headers);
    let decoded = match accepts {
        Accepts::ZipkinV2 => zipkin::decode_json_v2(&body),
        Accepts::Any if THRIFT_CONTENT_TYPES.contains(&media_type.as_str()) => {
            jaeger::decode_thrift(&body)
        }
        Accepts::Any => zipkin::decode_json(&body),
    };

    let (mut spans, conversion_errors) = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return json_response(
                &format!("Error decoding traces: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let source_ip = remote_ip.to_string();
    for span in spans.iter_mut() {
        span.meta
            .insert(SOURCE_IP_META_KEY.to_string(), source_ip.clone());
    }
    stats
        .spans
        .fetch_add(spans.len() as i64, Ordering::Relaxed);

    if let Err(e) = processor.process_spans(spans).await {
        stats.errors.fetch_add(1, Ordering::Relaxed);
        return json_response(
            &format!("Error processing traces: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
    }

    // Valid spans of the same request have already been forwarded.
    if let Some(err) = conversion_errors.into_error() {
        if let DecodeError::Conversion { count, .. } = &err {
            stats.errors.fetch_add(*count as i64, Ordering::Relaxed);
        }
        return json_response(
            &format!("Error decoding traces: {err}"),
            StatusCode::BAD_REQUEST,
        );
    }

    json_response("Successfully buffered traces", StatusCode::OK)
}
