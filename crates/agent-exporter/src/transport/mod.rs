// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector transport seam.
//!
//! The connection manager, exporter and command channel only ever talk to a
//! [`CollectorTransport`]. [`http::HttpTransport`] is the production
//! implementation; tests script their own.

use async_trait::async_trait;
use collector_proto::{
    AgentResponse, AggregateResponse, AggregateStreamMessage, CentralRequest, GaugeValueMessage,
    GaugeValueResponse, InitMessage, InitResponse, LogMessage, TraceStreamMessage,
};
use tokio::sync::mpsc;

use crate::error::Status;

pub mod http;

/// Both halves of an open downstream (command) stream.
///
/// Dropping `outbound` half-closes the stream; `inbound` yields `Err` once
/// when the stream fails and then ends.
pub struct DownstreamStream {
    pub outbound: mpsc::Sender<AgentResponse>,
    pub inbound: mpsc::Receiver<Result<CentralRequest, Status>>,
}

#[async_trait]
pub trait CollectorTransport: Send + Sync {
    /// Handshake.
    async fn init(&self, message: InitMessage) -> Result<InitResponse, Status>;

    async fn collect_gauge_values(
        &self,
        message: GaugeValueMessage,
    ) -> Result<GaugeValueResponse, Status>;

    /// Client stream: `StreamHeader`, then per group shared texts and one aggregate.
    async fn collect_aggregate_stream(
        &self,
        frames: Vec<AggregateStreamMessage>,
    ) -> Result<AggregateResponse, Status>;

    /// Client stream: `StreamHeader`, body frames, `StreamCounts`.
    async fn collect_trace_stream(&self, frames: Vec<TraceStreamMessage>) -> Result<(), Status>;

    async fn log(&self, message: LogMessage) -> Result<(), Status>;

    /// Opens the long-lived bidirectional command stream.
    async fn connect_downstream(&self) -> Result<DownstreamStream, Status>;

    /// Releases connections and background I/O tasks.
    async fn shutdown(&self) {}
}
