// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod correlation;
pub mod errors;
pub mod http_utils;
pub mod jaeger;
pub mod processor;
pub mod receiver;
pub mod span_source;
pub mod thrift;
pub mod tracker;
pub mod zipkin;
