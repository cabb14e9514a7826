// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracks which services are currently sending spans so a heartbeat datapoint
//! can be emitted for each of them until they go quiet.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use signalfx_core::datapoint::Datapoint;
use signalfx_core::internal_metrics::{cumulative, gauge, InternalMetricsSource};
use signalfx_core::span::Span;

pub const HEARTBEAT_METRIC: &str = "sf.int.service.heartbeat";
pub const HAS_SERVICE_DIMENSION: &str = "sf_hasService";

pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;
pub type NewServiceCallback = Box<dyn Fn(&Datapoint) + Send + Sync>;

struct TrackerState {
    /// Service name to last seen time, most recently seen first.
    last_seen: LruCache<String, Instant>,
    /// Heartbeats never change for a given service so they are built once.
    dp_cache: HashMap<String, Datapoint>,
}

pub struct ActiveServiceTracker {
    timeout: Duration,
    state: Mutex<TrackerState>,
    new_service_callback: Option<NewServiceCallback>,
    now: Clock,

    active_services: AtomicI64,
    purged_services: AtomicI64,
    spans_processed: AtomicI64,
}

impl ActiveServiceTracker {
    pub fn new(timeout: Duration, new_service_callback: Option<NewServiceCallback>) -> Self {
        Self::with_clock(timeout, new_service_callback, Arc::new(Instant::now))
    }

    pub fn with_clock(
        timeout: Duration,
        new_service_callback: Option<NewServiceCallback>,
        now: Clock,
    ) -> Self {
        ActiveServiceTracker {
            timeout,
            state: Mutex::new(TrackerState {
                last_seen: LruCache::unbounded(),
                dp_cache: HashMap::new(),
            }),
            new_service_callback,
            now,
            active_services: AtomicI64::new(0),
            purged_services: AtomicI64::new(0),
            spans_processed: AtomicI64::new(0),
        }
    }

    pub fn add_spans(&self, spans: &[Span]) {
        let now = (self.now)();
        let mut state = self.state.lock();

        for service in spans.iter().filter_map(Span::local_service_name) {
            if let Some(seen) = state.last_seen.get_mut(service) {
                *seen = now;
                continue;
            }

            state.last_seen.put(service.to_string(), now);
            let dp = heartbeat_for_service(service);
            if let Some(callback) = &self.new_service_callback {
                callback(&dp);
            }
            state.dp_cache.insert(service.to_string(), dp);
            self.active_services.fetch_add(1, Ordering::Relaxed);
            debug!(service = %service, "Tracking service name from trace span");
        }

        self.spans_processed
            .fetch_add(spans.len() as i64, Ordering::Relaxed);
    }

    /// Purges idle services first, then returns a heartbeat per active one.
    pub fn correlation_datapoints(&self) -> Vec<Datapoint> {
        let mut state = self.state.lock();
        self.purge(&mut state);
        state.dp_cache.values().cloned().collect()
    }

    fn purge(&self, state: &mut TrackerState) {
        let now = (self.now)();
        while let Some((_, last_seen)) = state.last_seen.peek_lru() {
            // Everything ahead of a live entry was seen more recently.
            if now.saturating_duration_since(*last_seen) < self.timeout {
                break;
            }
            let Some((service, _)) = state.last_seen.pop_lru() else {
                break;
            };
            state.dp_cache.remove(&service);
            self.active_services.fetch_sub(1, Ordering::Relaxed);
            self.purged_services.fetch_add(1, Ordering::Relaxed);
            debug!(service = %service, "No longer tracking service name from trace span");
        }
    }

    pub fn active_count(&self) -> i64 {
        self.active_services.load(Ordering::Relaxed)
    }

    pub fn purged_count(&self) -> i64 {
        self.purged_services.load(Ordering::Relaxed)
    }
}

impl InternalMetricsSource for ActiveServiceTracker {
    fn internal_metrics(&self) -> Vec<Datapoint> {
        vec![
            gauge("sfxagent.tracing_active_services", self.active_count()),
            cumulative("sfxagent.tracing_purged_services", self.purged_count()),
            cumulative(
                "sfxagent.tracing_spans_processed",
                self.spans_processed.load(Ordering::Relaxed),
            ),
        ]
    }
}

/// Host dimensions are added by the writer like for any other datapoint.
fn heartbeat_for_service(service: &str) -> Datapoint {
    Datapoint::gauge(HEARTBEAT_METRIC, 0i64).with_dimension(HAS_SERVICE_DIMENSION, service)
}
