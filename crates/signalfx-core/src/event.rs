// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::datapoint::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    UserDefined,
    Alert,
    Audit,
    Job,
    Collectd,
    ServiceDiscovery,
    Exception,
    Agent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub category: EventCategory,
    pub dimensions: HashMap<String, String>,
    pub properties: HashMap<String, Scalar>,
    pub timestamp: Option<DateTime<Utc>>,
    pub not_host_specific: bool,
}

impl Event {
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Event {
            event_type: event_type.into(),
            category,
            dimensions: HashMap::new(),
            properties: HashMap::new(),
            timestamp: None,
            not_host_specific: false,
        }
    }
}
