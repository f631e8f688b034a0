// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent-side telemetry export.
//!
//! Ships gauges, aggregates, traces and logs to the central collector with
//! per-call retry policies, and serves the collector's reverse command channel.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod address;
pub mod backoff;
pub mod command;
pub mod config;
pub mod config_sync;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod exporter;
pub mod identity;
pub mod log_forwarding;
pub mod logger;
pub mod rate_limited_log;
pub mod transport;
pub mod version;

pub use collector_proto as proto;
