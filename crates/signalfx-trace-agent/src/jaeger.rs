// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Jaeger collector Thrift batches, and their conversion to Zipkin v2 spans.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use signalfx_core::span::{Annotation, Endpoint, Span, SpanKind};

use crate::errors::{ConversionErrors, DecodeError};
use crate::thrift::{BinaryReader, BinaryWriter, TType};
use crate::zipkin::normalize_ids;

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    Double(f64),
    Bool(bool),
    Long(i64),
    Binary(Vec<u8>),
}

impl TagValue {
    fn type_id(&self) -> i32 {
        match self {
            TagValue::Str(_) => 0,
            TagValue::Double(_) => 1,
            TagValue::Bool(_) => 2,
            TagValue::Long(_) => 3,
            TagValue::Binary(_) => 4,
        }
    }

    fn as_string(&self) -> String {
        match self {
            TagValue::Str(s) => s.clone(),
            TagValue::Double(d) => d.to_string(),
            TagValue::Bool(b) => b.to_string(),
            TagValue::Long(l) => l.to_string(),
            TagValue::Binary(b) => BASE64.encode(b),
        }
    }

    fn as_json(&self) -> JsonValue {
        match self {
            TagValue::Str(s) => JsonValue::from(s.as_str()),
            TagValue::Double(d) => JsonValue::from(*d),
            TagValue::Bool(b) => JsonValue::from(*b),
            TagValue::Long(l) => JsonValue::from(*l),
            TagValue::Binary(b) => JsonValue::from(BASE64.encode(b)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub key: String,
    pub value: TagValue,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: TagValue) -> Self {
        Tag {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Log {
    pub timestamp: i64,
    pub fields: Vec<Tag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanRefType {
    ChildOf,
    FollowsFrom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanRef {
    pub ref_type: SpanRefType,
    pub trace_id_low: i64,
    pub trace_id_high: i64,
    pub span_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JaegerSpan {
    pub trace_id_low: i64,
    pub trace_id_high: i64,
    pub span_id: i64,
    pub parent_span_id: i64,
    pub operation_name: String,
    pub references: Vec<SpanRef>,
    pub flags: i32,
    pub start_time: i64,
    pub duration: i64,
    pub tags: Vec<Tag>,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub process: Process,
    pub spans: Vec<JaegerSpan>,
}

const DEBUG_FLAG: i32 = 2;

fn read_tag(r: &mut BinaryReader<'_>) -> Result<Tag, DecodeError> {
    let mut key = String::new();
    let mut v_type = 0;
    let (mut v_str, mut v_double, mut v_bool, mut v_long, mut v_binary) =
        (None, None, None, None, None);

    while let Some((ttype, id)) = r.read_field_begin()? {
        match (id, ttype) {
            (1, TType::String) => key = r.read_string()?,
            (2, TType::I32) => v_type = r.read_i32()?,
            (3, TType::String) => v_str = Some(r.read_string()?),
            (4, TType::Double) => v_double = Some(r.read_double()?),
            (5, TType::Bool) => v_bool = Some(r.read_bool()?),
            (6, TType::I64) => v_long = Some(r.read_i64()?),
            (7, TType::String) => v_binary = Some(r.read_binary()?),
            _ => r.skip(ttype)?,
        }
    }

    let value = match v_type {
        0 => TagValue::Str(v_str.unwrap_or_default()),
        1 => TagValue::Double(v_double.unwrap_or_default()),
        2 => TagValue::Bool(v_bool.unwrap_or_default()),
        3 => TagValue::Long(v_long.unwrap_or_default()),
        4 => TagValue::Binary(v_binary.unwrap_or_default()),
        other => {
            return Err(DecodeError::Thrift(format!(
                "unknown tag type {other} for key {key}"
            )))
        }
    };
    Ok(Tag { key, value })
}

fn read_tags(r: &mut BinaryReader<'_>) -> Result<Vec<Tag>, DecodeError> {
    r.read_list(TType::Struct, read_tag)
}

fn read_log(r: &mut BinaryReader<'_>) -> Result<Log, DecodeError> {
    let mut log = Log {
        timestamp: 0,
        fields: Vec::new(),
    };
    while let Some((ttype, id)) = r.read_field_begin()? {
        match (id, ttype) {
            (1, TType::I64) => log.timestamp = r.read_i64()?,
            (2, TType::List) => log.fields = read_tags(r)?,
            _ => r.skip(ttype)?,
        }
    }
    Ok(log)
}

fn read_span_ref(r: &mut BinaryReader<'_>) -> Result<SpanRef, DecodeError> {
    let mut span_ref = SpanRef {
        ref_type: SpanRefType::ChildOf,
        trace_id_low: 0,
        trace_id_high: 0,
        span_id: 0,
    };
    while let Some((ttype, id)) = r.read_field_begin()? {
        match (id, ttype) {
            (1, TType::I32) => {
                span_ref.ref_type = match r.read_i32()? {
                    1 => SpanRefType::FollowsFrom,
                    _ => SpanRefType::ChildOf,
                }
            }
            (2, TType::I64) => span_ref.trace_id_low = r.read_i64()?,
            (3, TType::I64) => span_ref.trace_id_high = r.read_i64()?,
            (4, TType::I64) => span_ref.span_id = r.read_i64()?,
            _ => r.skip(ttype)?,
        }
    }
    Ok(span_ref)
}

fn read_span(r: &mut BinaryReader<'_>) -> Result<JaegerSpan, DecodeError> {
    let mut span = JaegerSpan::default();
    while let Some((ttype, id)) = r.read_field_begin()? {
        match (id, ttype) {
            (1, TType::I64) => span.trace_id_low = r.read_i64()?,
            (2, TType::I64) => span.trace_id_high = r.read_i64()?,
            (3, TType::I64) => span.span_id = r.read_i64()?,
            (4, TType::I64) => span.parent_span_id = r.read_i64()?,
            (5, TType::String) => span.operation_name = r.read_string()?,
            (6, TType::List) => span.references = r.read_list(TType::Struct, read_span_ref)?,
            (7, TType::I32) => span.flags = r.read_i32()?,
            (8, TType::I64) => span.start_time = r.read_i64()?,
            (9, TType::I64) => span.duration = r.read_i64()?,
            (10, TType::List) => span.tags = read_tags(r)?,
            (11, TType::List) => span.logs = r.read_list(TType::Struct, read_log)?,
            _ => r.skip(ttype)?,
        }
    }
    Ok(span)
}

fn read_process(r: &mut BinaryReader<'_>) -> Result<Process, DecodeError> {
    let mut process = Process::default();
    while let Some((ttype, id)) = r.read_field_begin()? {
        match (id, ttype) {
            (1, TType::String) => process.service_name = r.read_string()?,
            (2, TType::List) => process.tags = read_tags(r)?,
            _ => r.skip(ttype)?,
        }
    }
    Ok(process)
}

impl Batch {
    pub fn decode(payload: &[u8]) -> Result<Batch, DecodeError> {
        let mut r = BinaryReader::new(payload);
        let mut batch = Batch::default();
        while let Some((ttype, id)) = r.read_field_begin()? {
            match (id, ttype) {
                (1, TType::Struct) => batch.process = read_process(&mut r)?,
                (2, TType::List) => batch.spans = r.read_list(TType::Struct, read_span)?,
                _ => r.skip(ttype)?,
            }
        }
        Ok(batch)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = BinaryWriter::new();
        w.write_field_begin(TType::Struct, 1);
        w.write_field_begin(TType::String, 1);
        w.write_string(&self.process.service_name);
        write_tags(&mut w, 2, &self.process.tags);
        w.write_field_stop();

        w.write_field_begin(TType::List, 2);
        w.write_list_begin(TType::Struct, self.spans.len());
        for span in &self.spans {
            write_span(&mut w, span);
        }
        w.write_field_stop();
        w.into_bytes()
    }
}

fn write_tags(w: &mut BinaryWriter, field_id: i16, tags: &[Tag]) {
    if tags.is_empty() {
        return;
    }
    w.write_field_begin(TType::List, field_id);
    w.write_list_begin(TType::Struct, tags.len());
    for tag in tags {
        w.write_field_begin(TType::String, 1);
        w.write_string(&tag.key);
        w.write_field_begin(TType::I32, 2);
        w.write_i32(tag.value.type_id());
        match &tag.value {
            TagValue::Str(s) => {
                w.write_field_begin(TType::String, 3);
                w.write_string(s);
            }
            TagValue::Double(d) => {
                w.write_field_begin(TType::Double, 4);
                w.write_double(*d);
            }
            TagValue::Bool(b) => {
                w.write_field_begin(TType::Bool, 5);
                w.write_bool(*b);
            }
            TagValue::Long(l) => {
                w.write_field_begin(TType::I64, 6);
                w.write_i64(*l);
            }
            TagValue::Binary(b) => {
                w.write_field_begin(TType::String, 7);
                w.write_binary(b);
            }
        }
        w.write_field_stop();
    }
}

fn write_span(w: &mut BinaryWriter, span: &JaegerSpan) {
    for (id, v) in [
        (1, span.trace_id_low),
        (2, span.trace_id_high),
        (3, span.span_id),
        (4, span.parent_span_id),
    ] {
        w.write_field_begin(TType::I64, id);
        w.write_i64(v);
    }
    w.write_field_begin(TType::String, 5);
    w.write_string(&span.operation_name);
    if !span.references.is_empty() {
        w.write_field_begin(TType::List, 6);
        w.write_list_begin(TType::Struct, span.references.len());
        for r in &span.references {
            w.write_field_begin(TType::I32, 1);
            w.write_i32(match r.ref_type {
                SpanRefType::ChildOf => 0,
                SpanRefType::FollowsFrom => 1,
            });
            for (id, v) in [(2, r.trace_id_low), (3, r.trace_id_high), (4, r.span_id)] {
                w.write_field_begin(TType::I64, id);
                w.write_i64(v);
            }
            w.write_field_stop();
        }
    }
    w.write_field_begin(TType::I32, 7);
    w.write_i32(span.flags);
    w.write_field_begin(TType::I64, 8);
    w.write_i64(span.start_time);
    w.write_field_begin(TType::I64, 9);
    w.write_i64(span.duration);
    write_tags(w, 10, &span.tags);
    if !span.logs.is_empty() {
        w.write_field_begin(TType::List, 11);
        w.write_list_begin(TType::Struct, span.logs.len());
        for log in &span.logs {
            w.write_field_begin(TType::I64, 1);
            w.write_i64(log.timestamp);
            write_tags(w, 2, &log.fields);
            w.write_field_stop();
        }
    }
    w.write_field_stop();
}

fn format_id(id: i64) -> String {
    format!("{:016x}", id as u64)
}

fn format_trace_id(low: i64, high: i64) -> String {
    if high == 0 {
        format_id(low)
    } else {
        format!("{:016x}{:016x}", high as u64, low as u64)
    }
}

fn ip_from_tag(value: &TagValue) -> Option<String> {
    match value {
        TagValue::Str(s) if !s.is_empty() => Some(s.clone()),
        TagValue::Long(l) => u32::try_from(*l).ok().map(|ip| Ipv4Addr::from(ip).to_string()),
        _ => None,
    }
}

fn span_kind(value: &str) -> Option<SpanKind> {
    match value.to_ascii_lowercase().as_str() {
        "client" => Some(SpanKind::Client),
        "server" => Some(SpanKind::Server),
        "producer" => Some(SpanKind::Producer),
        "consumer" => Some(SpanKind::Consumer),
        _ => None,
    }
}

/// A log with a single `event` field becomes that value. Anything else is
/// kept as a JSON object of its fields.
fn log_annotation(log: &Log) -> Annotation {
    let value = match log.fields.as_slice() {
        [Tag {
            key,
            value: TagValue::Str(event),
        }] if key == "event" => event.clone(),
        fields => {
            let obj = fields
                .iter()
                .map(|f| (f.key.clone(), f.value.as_json()))
                .collect::<Map<String, JsonValue>>();
            JsonValue::Object(obj).to_string()
        }
    };
    Annotation {
        timestamp: Some(log.timestamp),
        value: Some(value),
    }
}

fn convert_span(local: &Endpoint, process_tags: &HashMap<String, String>, js: JaegerSpan) -> Span {
    let parent_id = if js.parent_span_id != 0 {
        Some(format_id(js.parent_span_id))
    } else {
        js.references
            .iter()
            .find(|r| {
                r.ref_type == SpanRefType::ChildOf
                    && r.trace_id_low == js.trace_id_low
                    && r.trace_id_high == js.trace_id_high
            })
            .map(|r| format_id(r.span_id))
    };

    let mut span = Span {
        trace_id: format_trace_id(js.trace_id_low, js.trace_id_high),
        id: format_id(js.span_id),
        parent_id,
        name: Some(js.operation_name),
        timestamp: Some(js.start_time),
        duration: Some(js.duration),
        local_endpoint: Some(local.clone()),
        tags: process_tags.clone(),
        annotations: js.logs.iter().map(log_annotation).collect(),
        debug: (js.flags & DEBUG_FLAG != 0).then_some(true),
        ..Default::default()
    };

    let mut remote = Endpoint::default();
    for tag in js.tags {
        match tag.key.as_str() {
            "span.kind" => match span_kind(&tag.value.as_string()) {
                Some(kind) => span.kind = Some(kind),
                None => {
                    span.tags.insert(tag.key, tag.value.as_string());
                }
            },
            "peer.service" => remote.service_name = Some(tag.value.as_string()),
            "peer.ipv4" => remote.ipv4 = ip_from_tag(&tag.value),
            "peer.ipv6" => remote.ipv6 = Some(tag.value.as_string()),
            "peer.port" => {
                remote.port = match &tag.value {
                    TagValue::Long(l) => i32::try_from(*l).ok(),
                    other => other.as_string().parse().ok(),
                }
            }
            _ => {
                span.tags.insert(tag.key, tag.value.as_string());
            }
        }
    }
    if remote != Endpoint::default() {
        span.remote_endpoint = Some(remote);
    }

    normalize_ids(&mut span);
    span
}

/// Converts every span of a batch. The process provides the local endpoint
/// and its tags are copied onto each span.
pub fn batch_to_spans(batch: Batch) -> Vec<Span> {
    let mut local = Endpoint::with_service(batch.process.service_name);
    let mut process_tags = HashMap::new();
    for tag in batch.process.tags {
        if tag.key == "ip" {
            local.ipv4 = ip_from_tag(&tag.value);
        } else {
            process_tags.insert(tag.key, tag.value.as_string());
        }
    }

    batch
        .spans
        .into_iter()
        .map(|js| convert_span(&local, &process_tags, js))
        .collect()
}

/// Decodes a Jaeger Thrift batch posted to the receiver.
pub fn decode_thrift(body: &[u8]) -> Result<(Vec<Span>, ConversionErrors), DecodeError> {
    let batch = Batch::decode(body)?;
    Ok((batch_to_spans(batch), ConversionErrors::default()))
}
