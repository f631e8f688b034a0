// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use agent_exporter::{
    address::AddressResolver,
    command::{CommandChannel, CommandHandlers},
    config::ExporterConfig,
    config_sync::ConfigSyncMarker,
    connection::ConnectionManager,
    exporter::{TelemetryExporter, STARTUP_LOGGER_NAME},
    log_forwarding::{spawn_log_forwarder, RemoteLogLayer, DEFAULT_FORWARD_BUFFER},
    logger::Formatter,
    proto::{Environment, GaugeValue},
    transport::http::{HttpTransport, HttpTransportOptions},
};

mod local;

use local::{FileLocalConfig, NoTraces, StandaloneDiagnostics};

const SELF_GAUGE_INTERVAL: Duration = Duration::from_secs(60);
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
pub async fn main() {
    let config = match ExporterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading agent exporter configuration: {e}");
            return;
        }
    };

    let (remote_logs, log_receiver) = RemoteLogLayer::new(DEFAULT_FORWARD_BUFFER);
    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,tungstenite=off,{}",
        config.log_level
    );
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level in configuration: {e}");
            return;
        }
    };
    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().event_format(Formatter))
        .with(remote_logs)
        .try_init()
    {
        eprintln!("setting default subscriber failed: {e}");
        return;
    }

    debug!("Logging subsystem enabled");

    if let Err(e) = run(config, log_receiver).await {
        error!("agent exporter stopped: {e:#}");
    }
}

async fn run(
    config: ExporterConfig,
    log_receiver: tokio::sync::mpsc::Receiver<agent_exporter::proto::LogEvent>,
) -> anyhow::Result<()> {
    let identity = config.identity();
    info!(target: STARTUP_LOGGER_NAME, agent_id = %identity, version = AGENT_VERSION, "starting agent exporter");

    let resolved = AddressResolver::resolve(&config.collector)
        .await
        .context("resolving collector address")?;
    let transport = HttpTransport::new(
        resolved,
        &HttpTransportOptions {
            request_timeout: config.request_timeout,
            ..HttpTransportOptions::default()
        },
    )
    .context("building collector transport")?;

    let manager = Arc::new(ConnectionManager::new(Arc::new(transport), config.retry));
    let local_config = Arc::new(FileLocalConfig::in_dir(
        &config.conf_dir,
        config.config_read_only,
    ));
    let exporter = TelemetryExporter::new(
        manager.clone(),
        identity.clone(),
        AGENT_VERSION,
        ConfigSyncMarker::in_dir(&config.conf_dir),
        local_config.clone(),
    );
    let forwarder = spawn_log_forwarder(
        exporter.clone(),
        log_receiver,
        manager.cancellation_token(),
    );

    let channel = CommandChannel::new(
        &manager,
        identity,
        CommandHandlers {
            diagnostics: Arc::new(StandaloneDiagnostics::new(local_config)),
            traces: Arc::new(NoTraces),
        },
        config.command,
    );

    tokio::select! {
        handshake = exporter.handshake(environment(&config.host_name)) => {
            handshake.context("handshake with the collector")?;
            channel.connect();
            report_self_gauges(&exporter).await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted before the handshake completed");
        }
    }

    info!("shutting down agent exporter");
    channel.close();
    manager.close();
    if let Err(e) = channel.await_close(config.shutdown_timeout).await {
        warn!("{e}");
    }
    if let Err(e) = manager.await_close(config.shutdown_timeout).await {
        warn!("{e}");
    }
    forwarder.abort();
    Ok(())
}

/// Sends the exporter's own health gauges until Ctrl-C.
async fn report_self_gauges(exporter: &TelemetryExporter) {
    let started = Instant::now();
    let mut gauge_interval = interval(SELF_GAUGE_INTERVAL);
    gauge_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = gauge_interval.tick() => {}
            _ = tokio::signal::ctrl_c() => return,
        }
        let capture_time = now_millis();
        let gauges = vec![
            GaugeValue {
                gauge_name: "agent.exporter:uptime.seconds".to_string(),
                value: started.elapsed().as_secs_f64(),
                weight: 1,
                capture_time,
            },
            GaugeValue {
                gauge_name: "agent.exporter:dedup.entries".to_string(),
                value: exporter.dedup_cache().len() as f64,
                weight: 1,
                capture_time,
            },
        ];
        debug!("Sending self gauges");
        // failures are logged by the connection manager
        let _ = exporter.send_gauge_values(gauges);
    }
}

fn environment(host_name: &str) -> Environment {
    Environment {
        host_name: host_name.to_string(),
        process_id: Some(std::process::id()),
        start_time_millis: now_millis(),
        runtime_version: format!("{}-{}", env::consts::OS, env::consts::ARCH),
        properties: Default::default(),
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
