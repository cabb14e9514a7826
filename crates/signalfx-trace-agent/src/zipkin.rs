// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Zipkin JSON decoding. Both v1 and v2 payloads end up as v2 shaped spans.
//!
//! A single v1 span can turn into several v2 spans because its annotations
//! carry their own endpoints. The conversion follows the upstream Zipkin
//! `V2SpanConverter` rules.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use signalfx_core::span::{normalize_parent_id, pad_id, Annotation, Endpoint, Span, SpanKind};

use crate::errors::{ConversionErrors, DecodeError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputAnnotation {
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub value: Option<String>,
}

impl InputAnnotation {
    fn to_v2(&self) -> Annotation {
        Annotation {
            timestamp: self.timestamp,
            value: self.value.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryAnnotation {
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<JsonValue>,
}

/// A span as posted to the receiver, in either Zipkin JSON version.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSpan {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<SpanKind>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub local_endpoint: Option<Endpoint>,
    #[serde(default)]
    pub remote_endpoint: Option<Endpoint>,
    #[serde(default)]
    pub tags: Option<HashMap<String, String>>,
    #[serde(default)]
    pub annotations: Vec<InputAnnotation>,
    #[serde(default)]
    pub binary_annotations: Vec<BinaryAnnotation>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub shared: Option<bool>,
}

impl InputSpan {
    /// `kind`, tags or either endpoint only exist in v2. A span without them
    /// may still be v2, which the v1 path handles as well.
    pub fn is_definitely_zipkin_v2(&self) -> bool {
        self.kind.is_some()
            || self.tags.as_ref().is_some_and(|t| !t.is_empty())
            || self.local_endpoint.is_some()
            || self.remote_endpoint.is_some()
    }

    pub fn into_v2(self) -> Result<Span, DecodeError> {
        if !self.binary_annotations.is_empty() {
            return Err(DecodeError::BinaryAnnotationsOnV2);
        }
        let annotations = self.annotations.iter().map(InputAnnotation::to_v2).collect();
        let mut span = self.base_span();
        span.annotations = annotations;
        Ok(span)
    }

    pub fn into_v1_spans(self) -> Result<Vec<Span>, DecodeError> {
        let mut builder = SpanBuilder::new(&self);
        builder.process_annotations()?;
        builder.process_binary_annotations()?;
        Ok(builder.spans)
    }

    fn base_span(&self) -> Span {
        let mut span = Span {
            trace_id: self.trace_id.clone(),
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            timestamp: self.timestamp,
            duration: self.duration,
            local_endpoint: self.local_endpoint.clone(),
            remote_endpoint: self.remote_endpoint.clone(),
            tags: self.tags.clone().unwrap_or_default(),
            annotations: Vec::new(),
            debug: self.debug,
            shared: self.shared,
            meta: HashMap::new(),
        };
        normalize_ids(&mut span);
        span
    }

    fn end_timestamp_reflects_span_duration(&self, end: Option<&InputAnnotation>) -> bool {
        match (end.and_then(|e| e.timestamp), self.timestamp, self.duration) {
            (Some(end), Some(ts), Some(duration)) => ts.checked_add(duration) == Some(end),
            _ => false,
        }
    }
}

/// Microseconds from `begin` to `end`.
fn elapsed(begin: i64, end: i64) -> Result<i64, DecodeError> {
    end.checked_sub(begin)
        .ok_or(DecodeError::TimestampOverflow { begin, end })
}

/// Lowercases and pads ids. An all zero parent id means no parent.
pub(crate) fn normalize_ids(span: &mut Span) {
    span.trace_id = pad_id(&span.trace_id.to_ascii_lowercase());
    span.id = pad_id(&span.id.to_ascii_lowercase());
    span.parent_id = normalize_parent_id(span.parent_id.take())
        .map(|p| pad_id(&p.to_ascii_lowercase()));
}

fn close_enough(left: Option<&Endpoint>, right: Option<&Endpoint>) -> bool {
    left.and_then(|e| e.service_name.as_deref()) == right.and_then(|e| e.service_name.as_deref())
}

fn endpoint_of(annotation: &Option<InputAnnotation>) -> Option<Endpoint> {
    annotation.as_ref().and_then(|a| a.endpoint.clone())
}

fn timestamp_of(annotation: &Option<InputAnnotation>) -> Option<i64> {
    annotation.as_ref().and_then(|a| a.timestamp)
}

struct SpanBuilder<'a> {
    input: &'a InputSpan,
    template: Span,
    spans: Vec<Span>,
    cs: Option<InputAnnotation>,
    sr: Option<InputAnnotation>,
    ss: Option<InputAnnotation>,
    cr: Option<InputAnnotation>,
    ms: Option<InputAnnotation>,
    mr: Option<InputAnnotation>,
    ws: Option<InputAnnotation>,
    wr: Option<InputAnnotation>,
}

impl<'a> SpanBuilder<'a> {
    fn new(input: &'a InputSpan) -> Self {
        let template = input.base_span();
        SpanBuilder {
            input,
            spans: vec![template.clone()],
            template,
            cs: None,
            sr: None,
            ss: None,
            cr: None,
            ms: None,
            mr: None,
            ws: None,
            wr: None,
        }
    }

    fn add_span_for_endpoint(&mut self, endpoint: Option<Endpoint>) -> usize {
        let mut span = self.template.clone();
        span.local_endpoint = endpoint;
        span.tags = HashMap::new();
        self.spans.push(span);
        self.spans.len() - 1
    }

    /// Index of the span owning data from `endpoint`. Data without an endpoint
    /// goes to the first span.
    fn span_for_endpoint(&mut self, endpoint: Option<&Endpoint>) -> usize {
        let Some(endpoint) = endpoint else {
            return 0;
        };
        for (i, span) in self.spans.iter_mut().enumerate() {
            let Some(local) = &span.local_endpoint else {
                span.local_endpoint = Some(endpoint.clone());
                return i;
            };
            if local.close_enough(endpoint) {
                return i;
            }
        }
        self.add_span_for_endpoint(Some(endpoint.clone()))
    }

    fn push_annotation(&mut self, annotation: &Option<InputAnnotation>) {
        if let Some(annotation) = annotation {
            let idx = self.span_for_endpoint(annotation.endpoint.as_ref());
            self.spans[idx].annotations.push(annotation.to_v2());
        }
    }

    fn process_annotations(&mut self) -> Result<(), DecodeError> {
        self.pull_out_special_annotations();
        self.fill_in_start_annotations();

        if self.cs.is_some() && self.sr.is_some() {
            self.fill_in_missing_timings()?;
        } else if self.cs.is_some() && self.cr.is_some() {
            self.maybe_timestamp_duration(self.cs.clone(), self.cr.clone())?;
        } else if self.sr.is_some() && self.ss.is_some() {
            self.maybe_timestamp_duration(self.sr.clone(), self.ss.clone())?;
        } else {
            self.handle_incomplete_span();
        }

        // v1 had no shared flag. A missing span timestamp on a server-only
        // span meant shared.
        if self.cs.is_none() && self.sr.is_some() && self.input.timestamp.is_none() {
            let idx = self.span_for_endpoint(endpoint_of(&self.sr).as_ref());
            self.spans[idx].shared = Some(true);
        }

        self.handle_message_queue_annotations()
    }

    fn pull_out_special_annotations(&mut self) {
        let input = self.input;
        for annotation in &input.annotations {
            let idx = self.span_for_endpoint(annotation.endpoint.as_ref());

            // Core annotations require an endpoint.
            let processed = annotation.endpoint.is_some()
                && annotation.value.as_ref().is_some_and(|v| v.len() == 2)
                && self.handle_special_annotation(annotation, idx);

            if !processed {
                self.spans[idx].annotations.push(annotation.to_v2());
            }
        }
    }

    fn handle_special_annotation(&mut self, annotation: &InputAnnotation, idx: usize) -> bool {
        let (slot, kind) = match annotation.value.as_deref() {
            Some("cs") => (&mut self.cs, Some(SpanKind::Client)),
            Some("sr") => (&mut self.sr, Some(SpanKind::Server)),
            Some("ss") => (&mut self.ss, Some(SpanKind::Server)),
            Some("cr") => (&mut self.cr, Some(SpanKind::Client)),
            Some("ms") => (&mut self.ms, Some(SpanKind::Producer)),
            Some("mr") => (&mut self.mr, Some(SpanKind::Consumer)),
            Some("ws") => (&mut self.ws, None),
            Some("wr") => (&mut self.wr, None),
            _ => return false,
        };
        *slot = Some(annotation.clone());
        if kind.is_some() {
            self.spans[idx].kind = kind;
        }
        true
    }

    /// Bridging from an event model can leave out the start annotation.
    fn fill_in_start_annotations(&mut self) {
        if self.cs.is_none() && self.input.end_timestamp_reflects_span_duration(self.cr.as_ref()) {
            self.cs = Some(InputAnnotation {
                timestamp: self.input.timestamp,
                value: Some("cs".to_string()),
                endpoint: endpoint_of(&self.cr),
            });
        }
        if self.sr.is_none() && self.input.end_timestamp_reflects_span_duration(self.ss.as_ref()) {
            self.sr = Some(InputAnnotation {
                timestamp: self.input.timestamp,
                value: Some("sr".to_string()),
                endpoint: endpoint_of(&self.ss),
            });
        }
    }

    fn fill_in_missing_timings(&mut self) -> Result<(), DecodeError> {
        // In a shared span the client side owns the duration.
        self.maybe_timestamp_duration(self.cs.clone(), self.cr.clone())?;

        let cs_endpoint = endpoint_of(&self.cs);
        let sr_endpoint = endpoint_of(&self.sr);
        let client = self.span_for_endpoint(cs_endpoint.as_ref());

        // Loopback needs two spans.
        let server = if close_enough(cs_endpoint.as_ref(), sr_endpoint.as_ref()) {
            self.spans[client].kind = Some(SpanKind::Client);
            let server = self.add_span_for_endpoint(sr_endpoint);
            self.spans[server].kind = Some(SpanKind::Server);
            server
        } else {
            self.span_for_endpoint(sr_endpoint.as_ref())
        };

        let sr_ts = timestamp_of(&self.sr);
        let server_span = &mut self.spans[server];
        server_span.shared = Some(true);
        server_span.timestamp = sr_ts;
        if let (Some(ss_ts), Some(sr_ts)) = (timestamp_of(&self.ss), sr_ts) {
            server_span.duration = Some(elapsed(sr_ts, ss_ts)?);
        }
        if self.cr.is_none() && self.input.duration.is_none() {
            self.spans[client].duration = None;
        }
        Ok(())
    }

    fn handle_incomplete_span(&mut self) {
        for span in self.spans.iter_mut() {
            match span.kind {
                Some(SpanKind::Client) => {
                    if let Some(cs) = &self.cs {
                        span.timestamp = cs.timestamp;
                    }
                    if let Some(cr) = &self.cr {
                        span.annotations.push(cr.to_v2());
                    }
                }
                Some(SpanKind::Server) => {
                    if let Some(sr) = &self.sr {
                        span.timestamp = sr.timestamp;
                    }
                    if let Some(ss) = &self.ss {
                        span.annotations.push(ss.to_v2());
                    }
                }
                _ => {}
            }
        }

        if self.input.timestamp.is_some() {
            self.spans[0].timestamp = self.input.timestamp;
            self.spans[0].duration = self.input.duration;
        }
    }

    fn handle_message_queue_annotations(&mut self) -> Result<(), DecodeError> {
        // ms and mr should not share a span, but handle it when they do.
        match (self.ms.is_some(), self.mr.is_some()) {
            (true, true) => self.handle_both_ms_and_mr(),
            (true, false) => self.maybe_timestamp_duration(self.ms.clone(), self.ws.clone()),
            (false, true) => {
                if self.wr.is_some() {
                    self.maybe_timestamp_duration(self.wr.clone(), self.mr.clone())
                } else {
                    self.maybe_timestamp_duration(self.mr.clone(), None)
                }
            }
            (false, false) => {
                let (ws, wr) = (self.ws.clone(), self.wr.clone());
                self.push_annotation(&ws);
                self.push_annotation(&wr);
                Ok(())
            }
        }
    }

    fn handle_both_ms_and_mr(&mut self) -> Result<(), DecodeError> {
        let ms_endpoint = endpoint_of(&self.ms);
        let mr_endpoint = endpoint_of(&self.mr);
        let producer = self.span_for_endpoint(ms_endpoint.as_ref());

        let consumer = if close_enough(ms_endpoint.as_ref(), mr_endpoint.as_ref()) {
            self.spans[producer].kind = Some(SpanKind::Producer);
            let consumer = self.add_span_for_endpoint(mr_endpoint);
            self.spans[consumer].kind = Some(SpanKind::Consumer);
            consumer
        } else {
            self.span_for_endpoint(mr_endpoint.as_ref())
        };

        let (ms_ts, mr_ts) = (timestamp_of(&self.ms), timestamp_of(&self.mr));
        let (ws_ts, wr_ts) = (timestamp_of(&self.ws), timestamp_of(&self.wr));

        let consumer_span = &mut self.spans[consumer];
        consumer_span.shared = Some(true);
        match (wr_ts, mr_ts) {
            (Some(wr_ts), Some(mr_ts)) => {
                consumer_span.timestamp = Some(wr_ts);
                consumer_span.duration = Some(elapsed(wr_ts, mr_ts)?);
            }
            _ => consumer_span.timestamp = mr_ts,
        }

        let producer_span = &mut self.spans[producer];
        producer_span.timestamp = ms_ts;
        if let (Some(ws_ts), Some(ms_ts)) = (ws_ts, ms_ts) {
            producer_span.duration = Some(elapsed(ms_ts, ws_ts)?);
        }
        Ok(())
    }

    fn maybe_timestamp_duration(
        &mut self,
        begin: Option<InputAnnotation>,
        end: Option<InputAnnotation>,
    ) -> Result<(), DecodeError> {
        let Some(begin) = begin else {
            return Ok(());
        };
        let idx = self.span_for_endpoint(begin.endpoint.as_ref());
        let span = &mut self.spans[idx];

        if let (Some(ts), Some(duration)) = (self.input.timestamp, self.input.duration) {
            span.timestamp = Some(ts);
            span.duration = Some(duration);
        } else {
            span.timestamp = begin.timestamp;
            if let (Some(end), Some(begin)) = (timestamp_of(&end), begin.timestamp) {
                span.duration = Some(elapsed(begin, end)?);
            }
        }
        Ok(())
    }

    fn process_binary_annotations(&mut self) -> Result<(), DecodeError> {
        let (ca, sa, ma) = self.pull_out_special_binary_annotations()?;

        // Only the address annotations are present.
        if self.cs.is_none() && self.sr.is_none() {
            if let (Some(ca), Some(sa)) = (&ca, &sa) {
                let idx = self.span_for_endpoint(Some(ca));
                self.spans[idx].remote_endpoint = Some(sa.clone());
                return Ok(());
            }
        }

        let no_core_annotations =
            self.cs.is_none() && self.cr.is_none() && self.sr.is_none() && self.ss.is_none();

        if let Some(sa) = sa {
            let cs_endpoint = endpoint_of(&self.cs);
            let cr_endpoint = endpoint_of(&self.cr);
            if self.cs.is_some() && !close_enough(Some(&sa), cs_endpoint.as_ref()) {
                let idx = self.span_for_endpoint(cs_endpoint.as_ref());
                self.spans[idx].remote_endpoint = Some(sa);
            } else if self.cr.is_some() && !close_enough(Some(&sa), cr_endpoint.as_ref()) {
                let idx = self.span_for_endpoint(cr_endpoint.as_ref());
                self.spans[idx].remote_endpoint = Some(sa);
            } else if no_core_annotations {
                let span = &mut self.spans[0];
                span.kind = Some(SpanKind::Client);
                span.remote_endpoint = Some(sa);
            }
        }

        if let Some(ca) = ca {
            let sr_endpoint = endpoint_of(&self.sr);
            let ss_endpoint = endpoint_of(&self.ss);
            if self.sr.is_some() && !close_enough(Some(&ca), sr_endpoint.as_ref()) {
                let idx = self.span_for_endpoint(sr_endpoint.as_ref());
                self.spans[idx].remote_endpoint = Some(ca.clone());
            }
            if self.ss.is_some() && !close_enough(Some(&ca), ss_endpoint.as_ref()) {
                let idx = self.span_for_endpoint(ss_endpoint.as_ref());
                self.spans[idx].remote_endpoint = Some(ca);
            } else if no_core_annotations {
                let span = &mut self.spans[0];
                span.kind = Some(SpanKind::Server);
                span.remote_endpoint = Some(ca);
            }
        }

        if let Some(ma) = ma {
            let ms_endpoint = endpoint_of(&self.ms);
            let mr_endpoint = endpoint_of(&self.mr);
            if self.ms.is_some() && !close_enough(Some(&ma), ms_endpoint.as_ref()) {
                let idx = self.span_for_endpoint(ms_endpoint.as_ref());
                self.spans[idx].remote_endpoint = Some(ma.clone());
            }
            if self.mr.is_some() && !close_enough(Some(&ma), mr_endpoint.as_ref()) {
                let idx = self.span_for_endpoint(mr_endpoint.as_ref());
                self.spans[idx].remote_endpoint = Some(ma);
            }
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn pull_out_special_binary_annotations(
        &mut self,
    ) -> Result<(Option<Endpoint>, Option<Endpoint>, Option<Endpoint>), DecodeError> {
        let (mut ca, mut sa, mut ma) = (None, None, None);
        let input = self.input;

        for annotation in &input.binary_annotations {
            let (Some(key), Some(value)) = (&annotation.key, &annotation.value) else {
                continue;
            };

            if let JsonValue::Bool(b) = value {
                match key.as_str() {
                    "ca" => ca = annotation.endpoint.clone(),
                    "sa" => sa = annotation.endpoint.clone(),
                    "ma" => ma = annotation.endpoint.clone(),
                    _ => {
                        let idx = self.span_for_endpoint(annotation.endpoint.as_ref());
                        self.spans[idx].tags.insert(key.clone(), b.to_string());
                    }
                }
                continue;
            }

            let idx = self.span_for_endpoint(annotation.endpoint.as_ref());
            if let Some(tag) = binary_annotation_tag(key, value)? {
                self.spans[idx].tags.insert(key.clone(), tag);
            }
        }
        Ok((ca, sa, ma))
    }
}

fn binary_annotation_tag(key: &str, value: &JsonValue) -> Result<Option<String>, DecodeError> {
    match value {
        // "lc" with no value is only a marker.
        JsonValue::String(s) if key == "lc" && s.is_empty() => Ok(None),
        JsonValue::String(s) => Ok(Some(s.clone())),
        JsonValue::Number(n) => Ok(Some(match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (None, Some(u), _) => u.to_string(),
            (None, None, Some(f)) => f.to_string(),
            (None, None, None) => n.to_string(),
        })),
        JsonValue::Bool(b) => Ok(Some(b.to_string())),
        JsonValue::Null => Ok(None),
        JsonValue::Array(_) => Err(DecodeError::InvalidBinaryAnnotation {
            key: key.to_string(),
            kind: "array",
        }),
        JsonValue::Object(_) => Err(DecodeError::InvalidBinaryAnnotation {
            key: key.to_string(),
            kind: "object",
        }),
    }
}

/// Decodes a JSON list of spans of either Zipkin version.
///
/// A span that fails to convert is skipped and reported through the returned
/// [`ConversionErrors`]; the remaining spans are still returned.
pub fn decode_json(body: &[u8]) -> Result<(Vec<Span>, ConversionErrors), DecodeError> {
    let input: Vec<InputSpan> =
        serde_json::from_slice(body).map_err(|_| DecodeError::InvalidJson)?;

    let mut spans = Vec::with_capacity(input.len());
    let mut errors = ConversionErrors::default();
    for input_span in input {
        let converted = if input_span.is_definitely_zipkin_v2() {
            input_span.into_v2().map(|s| vec![s])
        } else {
            input_span.into_v1_spans()
        };
        match converted {
            Ok(converted) => spans.extend(converted),
            Err(e) => errors.append(e),
        }
    }
    Ok((spans, errors))
}

/// Decodes a JSON list that is known to hold only Zipkin v2 spans.
pub fn decode_json_v2(body: &[u8]) -> Result<(Vec<Span>, ConversionErrors), DecodeError> {
    let input: Vec<InputSpan> =
        serde_json::from_slice(body).map_err(|_| DecodeError::InvalidJson)?;

    let mut spans = Vec::with_capacity(input.len());
    let mut errors = ConversionErrors::default();
    for input_span in input {
        match input_span.into_v2() {
            Ok(span) => spans.push(span),
            Err(e) => errors.append(e),
        }
    }
    Ok((spans, errors))
}
