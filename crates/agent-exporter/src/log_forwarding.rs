// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwards local WARN and ERROR events to the collector.
//!
//! [`RemoteLogLayer`] turns events into [`LogEvent`]s and hands them to a
//! bounded channel without blocking; [`spawn_log_forwarder`] drains that
//! channel into [`TelemetryExporter::send_log`]. Events recorded with
//! `suppress_remote = true` stay local.

use std::fmt::{self, Write as _};
use std::time::{SystemTime, UNIX_EPOCH};

use collector_proto::{LogEvent, LogLevel};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::connection::RemoteLogging;
use crate::exporter::TelemetryExporter;

pub const SUPPRESS_REMOTE_FIELD: &str = "suppress_remote";
pub const DEFAULT_FORWARD_BUFFER: usize = 256;

// transport libraries log about the very connection used for forwarding
const LOCAL_ONLY_TARGETS: &[&str] = &["h2", "hyper", "reqwest", "rustls", "tungstenite", "tokio_tungstenite"];

pub struct RemoteLogLayer {
    sender: mpsc::Sender<LogEvent>,
}

impl RemoteLogLayer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LogEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if level > Level::WARN {
            return;
        }
        let target = metadata.target();
        if LOCAL_ONLY_TARGETS
            .iter()
            .any(|prefix| target == *prefix || target.starts_with(&format!("{prefix}::")))
        {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        if visitor.suppress_remote {
            return;
        }

        let log_event = LogEvent {
            timestamp: now_millis(),
            level: if level == Level::ERROR {
                LogLevel::Error
            } else {
                LogLevel::Warn
            },
            logger_name: target.to_string(),
            message: visitor.into_message(),
            throwable: None,
        };
        // dropped when the forwarder falls behind
        let _ = self.sender.try_send(log_event);
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
    suppress_remote: bool,
}

impl EventVisitor {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for EventVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == SUPPRESS_REMOTE_FIELD {
            self.suppress_remote = value;
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Drains `receiver` into the exporter until `cancel` fires.
pub fn spawn_log_forwarder(
    exporter: TelemetryExporter,
    mut receiver: mpsc::Receiver<LogEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv() => event,
            };
            let Some(event) = event else { break };
            // the upload runs on the exporter's scheduler; its outcome is logged there
            let _ = exporter.send_log(event, RemoteLogging::Enabled);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn collect<F: FnOnce()>(emit: F) -> Vec<LogEvent> {
        let (layer, mut receiver) = RemoteLogLayer::new(16);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, emit);

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn forwards_warn_and_error_only() {
        let events = collect(|| {
            tracing::info!("startup complete");
            tracing::warn!(attempts = 3, "collector slow");
            tracing::error!("collector gone");
        });

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, LogLevel::Warn);
        assert_eq!(events[0].message, "collector slow attempts=3");
        assert_eq!(events[1].level, LogLevel::Error);
        assert_eq!(events[1].message, "collector gone");
    }

    #[test]
    fn suppressed_events_stay_local() {
        let events = collect(|| {
            tracing::warn!(suppress_remote = true, "log upload failed");
            tracing::warn!(suppress_remote = false, "gauge upload failed");
        });

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "gauge upload failed");
    }

    #[test]
    fn transport_library_events_stay_local() {
        let events = collect(|| {
            tracing::warn!(target: "hyper::proto", "connection reset");
            tracing::warn!(target: "hyperdrive", "not a transport library");
        });

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].logger_name, "hyperdrive");
    }
}
