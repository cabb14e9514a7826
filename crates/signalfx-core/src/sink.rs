// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forward-only telemetry sinks and the middleware used to chain them.
//!
//! A chain is built from a terminal sink (usually the ingest forwarder) and a
//! list of middleware constructors. The first constructor in the list ends up
//! as the outermost layer, so telemetry flows through the list in order.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::datapoint::Datapoint;
use crate::errors::SinkError;
use crate::event::Event;
use crate::filters::DatapointFilter;
use crate::internal_metrics::{cumulative, gauge, InternalMetricsSource};
use crate::span::Span;

#[async_trait]
pub trait Sink: Send + Sync {
    async fn add_datapoints(
        &self,
        cancel: &CancellationToken,
        datapoints: Vec<Datapoint>,
    ) -> Result<(), SinkError>;

    async fn add_events(
        &self,
        cancel: &CancellationToken,
        events: Vec<Event>,
    ) -> Result<(), SinkError>;

    async fn add_spans(&self, cancel: &CancellationToken, spans: Vec<Span>)
        -> Result<(), SinkError>;
}

/// Wraps the next sink in the chain.
pub type Middleware = Box<dyn FnOnce(Arc<dyn Sink>) -> Arc<dyn Sink> + Send>;

pub fn build_chain(terminal: Arc<dyn Sink>, middlewares: Vec<Middleware>) -> Arc<dyn Sink> {
    middlewares
        .into_iter()
        .rev()
        .fold(terminal, |next, middleware| middleware(next))
}

/// Adds global dimensions (never overriding) and host id dimensions (always
/// overriding, except on span tags) to everything that passes through.
pub struct DecoratingSink {
    next: Arc<dyn Sink>,
    global_dimensions: HashMap<String, String>,
    host_id_dimensions: HashMap<String, String>,
}

impl DecoratingSink {
    pub fn middleware(
        global_dimensions: HashMap<String, String>,
        host_id_dimensions: HashMap<String, String>,
    ) -> Middleware {
        Box::new(move |next| {
            Arc::new(DecoratingSink {
                next,
                global_dimensions,
                host_id_dimensions,
            })
        })
    }

    fn add_global(&self, fields: &mut HashMap<String, String>) {
        for (name, value) in &self.global_dimensions {
            fields
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    fn add_host_ids(&self, fields: &mut HashMap<String, String>) {
        for (name, value) in &self.host_id_dimensions {
            fields.insert(name.clone(), value.clone());
        }
    }
}

#[async_trait]
impl Sink for DecoratingSink {
    async fn add_datapoints(
        &self,
        cancel: &CancellationToken,
        mut datapoints: Vec<Datapoint>,
    ) -> Result<(), SinkError> {
        for dp in datapoints.iter_mut() {
            self.add_global(&mut dp.dimensions);
            if !dp.meta.not_host_specific {
                self.add_host_ids(&mut dp.dimensions);
            }
        }
        self.next.add_datapoints(cancel, datapoints).await
    }

    async fn add_events(
        &self,
        cancel: &CancellationToken,
        mut events: Vec<Event>,
    ) -> Result<(), SinkError> {
        for event in events.iter_mut() {
            self.add_global(&mut event.dimensions);
            // Events only ever get the host dimension out of the host ids.
            if !event.not_host_specific {
                if let Some(host) = self.host_id_dimensions.get("host") {
                    event.dimensions.insert("host".to_string(), host.clone());
                }
            }
        }
        self.next.add_events(cancel, events).await
    }

    async fn add_spans(
        &self,
        cancel: &CancellationToken,
        mut spans: Vec<Span>,
    ) -> Result<(), SinkError> {
        // Tags set by the instrumentation win over the host ids.
        for span in spans.iter_mut() {
            for (name, value) in &self.host_id_dimensions {
                span.tags
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        self.next.add_spans(cancel, spans).await
    }
}

/// Drops datapoints excluded by a filter. Events and spans pass untouched.
pub struct FilteringSink {
    next: Arc<dyn Sink>,
    filter: Arc<dyn DatapointFilter>,
    filtered: Arc<AtomicI64>,
}

impl FilteringSink {
    pub fn middleware(filter: Arc<dyn DatapointFilter>, filtered: Arc<AtomicI64>) -> Middleware {
        Box::new(move |next| {
            Arc::new(FilteringSink {
                next,
                filter,
                filtered,
            })
        })
    }
}

#[async_trait]
impl Sink for FilteringSink {
    async fn add_datapoints(
        &self,
        cancel: &CancellationToken,
        datapoints: Vec<Datapoint>,
    ) -> Result<(), SinkError> {
        let before = datapoints.len();
        let kept = datapoints
            .into_iter()
            .filter(|dp| !self.filter.excludes(dp))
            .collect::<Vec<Datapoint>>();
        let dropped = before - kept.len();
        if dropped > 0 {
            debug!("Filtered out {dropped} datapoints");
            self.filtered.fetch_add(dropped as i64, Ordering::Relaxed);
        }
        if kept.is_empty() {
            return Ok(());
        }
        self.next.add_datapoints(cancel, kept).await
    }

    async fn add_events(
        &self,
        cancel: &CancellationToken,
        events: Vec<Event>,
    ) -> Result<(), SinkError> {
        self.next.add_events(cancel, events).await
    }

    async fn add_spans(
        &self,
        cancel: &CancellationToken,
        spans: Vec<Span>,
    ) -> Result<(), SinkError> {
        self.next.add_spans(cancel, spans).await
    }
}

/// Counters kept by [`CountingSink`].
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub datapoints_sent: AtomicI64,
    pub datapoints_failed: AtomicI64,
    pub datapoints_in_flight: AtomicI64,
    pub datapoints_filtered: Arc<AtomicI64>,
    pub events_sent: AtomicI64,
    pub events_failed: AtomicI64,
    pub spans_sent: AtomicI64,
    pub spans_failed: AtomicI64,
    pub spans_in_flight: AtomicI64,
}

impl InternalMetricsSource for SinkCounters {
    fn internal_metrics(&self) -> Vec<Datapoint> {
        vec![
            cumulative(
                "sfxagent.datapoints_sent",
                self.datapoints_sent.load(Ordering::Relaxed),
            ),
            cumulative(
                "sfxagent.datapoints_failed",
                self.datapoints_failed.load(Ordering::Relaxed),
            ),
            cumulative(
                "sfxagent.datapoints_filtered",
                self.datapoints_filtered.load(Ordering::Relaxed),
            ),
            gauge(
                "sfxagent.datapoints_in_flight",
                self.datapoints_in_flight.load(Ordering::Relaxed),
            ),
            cumulative("sfxagent.events_sent", self.events_sent.load(Ordering::Relaxed)),
            cumulative(
                "sfxagent.trace_spans_sent",
                self.spans_sent.load(Ordering::Relaxed),
            ),
            cumulative(
                "sfxagent.trace_spans_failed",
                self.spans_failed.load(Ordering::Relaxed),
            ),
            gauge(
                "sfxagent.trace_spans_in_flight",
                self.spans_in_flight.load(Ordering::Relaxed),
            ),
        ]
    }
}

/// Records how much telemetry went through the rest of the chain.
pub struct CountingSink {
    next: Arc<dyn Sink>,
    counters: Arc<SinkCounters>,
}

impl CountingSink {
    pub fn middleware(counters: Arc<SinkCounters>) -> Middleware {
        Box::new(move |next| Arc::new(CountingSink { next, counters }))
    }
}

#[async_trait]
impl Sink for CountingSink {
    async fn add_datapoints(
        &self,
        cancel: &CancellationToken,
        datapoints: Vec<Datapoint>,
    ) -> Result<(), SinkError> {
        let count = datapoints.len() as i64;
        self.counters
            .datapoints_in_flight
            .fetch_add(count, Ordering::Relaxed);
        let res = self.next.add_datapoints(cancel, datapoints).await;
        self.counters
            .datapoints_in_flight
            .fetch_sub(count, Ordering::Relaxed);
        match &res {
            Ok(()) => self.counters.datapoints_sent.fetch_add(count, Ordering::Relaxed),
            Err(_) => self
                .counters
                .datapoints_failed
                .fetch_add(count, Ordering::Relaxed),
        };
        res
    }

    async fn add_events(
        &self,
        cancel: &CancellationToken,
        events: Vec<Event>,
    ) -> Result<(), SinkError> {
        let count = events.len() as i64;
        let res = self.next.add_events(cancel, events).await;
        match &res {
            Ok(()) => self.counters.events_sent.fetch_add(count, Ordering::Relaxed),
            Err(_) => self.counters.events_failed.fetch_add(count, Ordering::Relaxed),
        };
        res
    }

    async fn add_spans(
        &self,
        cancel: &CancellationToken,
        spans: Vec<Span>,
    ) -> Result<(), SinkError> {
        let count = spans.len() as i64;
        self.counters
            .spans_in_flight
            .fetch_add(count, Ordering::Relaxed);
        let res = self.next.add_spans(cancel, spans).await;
        self.counters
            .spans_in_flight
            .fetch_sub(count, Ordering::Relaxed);
        match &res {
            Ok(()) => self.counters.spans_sent.fetch_add(count, Ordering::Relaxed),
            Err(_) => self.counters.spans_failed.fetch_add(count, Ordering::Relaxed),
        };
        res
    }
}

/// Keeps everything it receives. Used by tests throughout the workspace.
#[derive(Default)]
pub struct RecordingSink {
    pub datapoints: Mutex<Vec<Datapoint>>,
    pub events: Mutex<Vec<Event>>,
    pub spans: Mutex<Vec<Span>>,
    pub batches: AtomicI64,
}

impl RecordingSink {
    pub fn datapoints(&self) -> Vec<Datapoint> {
        self.datapoints.lock().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn add_datapoints(
        &self,
        _cancel: &CancellationToken,
        datapoints: Vec<Datapoint>,
    ) -> Result<(), SinkError> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.datapoints.lock().extend(datapoints);
        Ok(())
    }

    async fn add_events(
        &self,
        _cancel: &CancellationToken,
        events: Vec<Event>,
    ) -> Result<(), SinkError> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.lock().extend(events);
        Ok(())
    }

    async fn add_spans(
        &self,
        _cancel: &CancellationToken,
        spans: Vec<Span>,
    ) -> Result<(), SinkError> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.spans.lock().extend(spans);
        Ok(())
    }
}
