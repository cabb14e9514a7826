// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("invalid JSON format; please see correct format at https://zipkin.io/zipkin-api/#/default/post_spans")]
    InvalidJson,
    #[error("span cannot have binaryAnnotations with Zipkin V2 fields")]
    BinaryAnnotationsOnV2,
    #[error("invalid binary annotation type of {kind}, for key {key}")]
    InvalidBinaryAnnotation { key: String, kind: &'static str },
    #[error("span duration from {begin} to {end} overflows")]
    TimestampOverflow { begin: i64, end: i64 },
    #[error("invalid thrift payload: {0}")]
    Thrift(String),
    #[error("{count} errors encountered, last one was: {last}")]
    Conversion { count: usize, last: String },
}

/// Collects per-span conversion failures so one bad span does not reject the
/// rest of its request.
#[derive(Debug, Default)]
pub struct ConversionErrors {
    count: usize,
    last: Option<DecodeError>,
}

impl ConversionErrors {
    pub fn append(&mut self, err: DecodeError) {
        self.count += 1;
        self.last = Some(err);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn into_error(self) -> Option<DecodeError> {
        self.last.map(|last| DecodeError::Conversion {
            count: self.count,
            last: last.to_string(),
        })
    }
}
