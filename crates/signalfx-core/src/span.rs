// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Zipkin v2 shaped trace spans, the single span model every receiver
//! converts into.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Span meta key holding the IP address the span was received from.
pub const SOURCE_IP_META_KEY: &str = "sfx.source_ip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    Client,
    Server,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

impl Endpoint {
    pub fn with_service(service_name: impl Into<String>) -> Self {
        Endpoint {
            service_name: Some(service_name.into()),
            ..Default::default()
        }
    }

    /// Two endpoints are close enough when both lack a service name or both
    /// carry the same one.
    pub fn close_enough(&self, other: &Endpoint) -> bool {
        self.service_name == other.service_name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub trace_id: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SpanKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<Endpoint>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    /// Receiver-side metadata, never serialized.
    #[serde(skip)]
    pub meta: HashMap<String, String>,
}

impl Span {
    pub fn local_service_name(&self) -> Option<&str> {
        self.local_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
    }
}

/// Left-pads a hex id with zeros to 16 chars, or to 32 chars when it is
/// longer than 16. Ids of 32 chars or more are returned as is.
pub fn pad_id(id: &str) -> String {
    let expected = if id.len() < 16 {
        16
    } else if id.len() > 16 && id.len() < 32 {
        32
    } else {
        return id.to_string();
    };
    format!("{}{}", "0".repeat(expected - id.len()), id)
}

/// A parent id made only of zeros means "no parent".
pub fn normalize_parent_id(parent_id: Option<String>) -> Option<String> {
    parent_id.filter(|p| !p.chars().all(|c| c == '0'))
}
