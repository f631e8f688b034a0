// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring helpers shared by the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use agent_exporter::command::{CommandChannel, CommandChannelSettings, CommandHandlers};
use agent_exporter::config_sync::ConfigSyncMarker;
use agent_exporter::connection::{ConnectionManager, RetrySettings};
use agent_exporter::exporter::TelemetryExporter;
use agent_exporter::identity::AgentIdentity;

use super::mocks::{MockDiagnostics, MockLocalConfig, MockTraceSource, ScriptedTransport};

pub const AGENT_ID: &str = "prod::web-1";
pub const AGENT_VERSION: &str = "0.14.2";

pub fn manager(transport: &Arc<ScriptedTransport>) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        transport.clone(),
        RetrySettings::default(),
    ))
}

pub fn exporter(
    manager: &Arc<ConnectionManager>,
    conf_dir: &Path,
    local_config: Arc<MockLocalConfig>,
) -> TelemetryExporter {
    TelemetryExporter::new(
        manager.clone(),
        AgentIdentity::from_id(AGENT_ID),
        AGENT_VERSION,
        ConfigSyncMarker::in_dir(conf_dir),
        local_config,
    )
}

pub fn command_channel(manager: &ConnectionManager) -> CommandChannel {
    CommandChannel::new(
        manager,
        AgentIdentity::from_id(AGENT_ID),
        CommandHandlers {
            diagnostics: Arc::new(MockDiagnostics::default()),
            traces: Arc::new(MockTraceSource),
        },
        CommandChannelSettings::default(),
    )
}

/// Text of `len` ASCII characters, distinct per `seed`.
pub fn long_text(seed: char, len: usize) -> String {
    std::iter::once(seed)
        .chain(std::iter::repeat('x'))
        .take(len)
        .collect()
}
