// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batcher;
pub mod config;
pub mod datapoint;
pub mod dimensions;
pub mod errors;
pub mod event;
pub mod filters;
pub mod forwarder;
pub mod http_utils;
pub mod internal_metrics;
pub mod kubernetes;
pub mod monitor;
pub mod output;
pub mod scheduler;
pub mod sink;
pub mod span;
pub mod writer;
