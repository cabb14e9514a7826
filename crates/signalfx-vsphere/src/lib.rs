// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod filter;
pub mod gateway;
pub mod inventory;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod paginator;
pub mod points;
pub mod soap;
pub mod testing;
pub mod xml;
