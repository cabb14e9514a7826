// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use signalfx_core::span::{Span, SOURCE_IP_META_KEY};
use signalfx_core::writer::WriterHandle;

use crate::span_source::SpanSourceTracker;
use crate::tracker::ActiveServiceTracker;

#[async_trait]
pub trait TraceProcessor: Send + Sync {
    /// Prepares decoded spans and hands them to the writer.
    async fn process_spans(&self, spans: Vec<Span>) -> Result<(), String>;
}

/// Enriches spans before they are written: global span tags, source tags
/// from the span source tracker, and active service tracking.
pub struct SpanProcessor {
    writer: WriterHandle,
    global_span_tags: HashMap<String, String>,
    service_tracker: Option<Arc<ActiveServiceTracker>>,
    span_source_tracker: Option<Arc<SpanSourceTracker>>,
}

impl SpanProcessor {
    pub fn new(writer: WriterHandle) -> Self {
        SpanProcessor {
            writer,
            global_span_tags: HashMap::new(),
            service_tracker: None,
            span_source_tracker: None,
        }
    }

    pub fn with_global_span_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.global_span_tags = tags;
        self
    }

    pub fn with_service_tracker(mut self, tracker: Arc<ActiveServiceTracker>) -> Self {
        self.service_tracker = Some(tracker);
        self
    }

    pub fn with_span_source_tracker(mut self, tracker: Arc<SpanSourceTracker>) -> Self {
        self.span_source_tracker = Some(tracker);
        self
    }
}

#[async_trait]
impl TraceProcessor for SpanProcessor {
    async fn process_spans(&self, mut spans: Vec<Span>) -> Result<(), String> {
        if spans.is_empty() {
            return Ok(());
        }

        let mut dimension_updates = Vec::new();
        for span in spans.iter_mut() {
            if let Some(source_tracker) = &self.span_source_tracker {
                dimension_updates.extend(source_tracker.add_source_tags(span));
            }
            span.meta.remove(SOURCE_IP_META_KEY);

            for (key, value) in &self.global_span_tags {
                span.tags
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        if let Some(tracker) = &self.service_tracker {
            tracker.add_spans(&spans);
        }

        debug!("Sending {} spans to the writer", spans.len());
        self.writer
            .send_spans(spans)
            .await
            .map_err(|e| format!("Failed to send spans to the writer: {e}"))?;

        for dimension in dimension_updates {
            if let Err(e) = self.writer.send_dimension_update(dimension).await {
                error!("Failed to send dimension update: {e}");
            }
        }
        Ok(())
    }
}
