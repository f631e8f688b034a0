// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reverse command channel.
//!
//! One long-lived downstream stream per agent. Every session starts with a
//! `Hello`; each inbound request is dispatched on its own task and answered
//! through the current [`ResponseSink`]. Reconnects follow their own policy
//! rather than the exporter's backoff: the first failure after a healthy
//! period reconnects immediately, further consecutive failures flag the
//! connection as down and reconnect after a fixed delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use collector_proto::{AgentResponse, CentralRequest};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{ShutdownError, Status};
use crate::identity::AgentIdentity;
use crate::rate_limited_log::RateLimitedLog;
use crate::transport::{CollectorTransport, DownstreamStream};

pub mod dispatch;
pub mod sink;

pub use dispatch::{dispatch, CommandHandlers, DiagnosticsService, HeapDumpFile, TraceDetailSource};
pub use sink::{ResponseSink, SinkUnavailable};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RESPONSE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandChannelSettings {
    /// Delay before reconnecting after consecutive stream failures.
    pub reconnect_delay: Duration,
    /// How long a response waits for a downstream connection.
    pub response_wait: Duration,
}

impl Default for CommandChannelSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            response_wait: DEFAULT_RESPONSE_WAIT,
        }
    }
}

/// How one downstream session ended.
enum SessionEnd {
    Cancelled,
    Failed { status: Status, received_any: bool },
}

#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn CollectorTransport>,
    state: Arc<ConnectionState>,
    identity: AgentIdentity,
    handlers: CommandHandlers,
    settings: CommandChannelSettings,
    sink: ResponseSink,
    outage_log: RateLimitedLog,
    started: AtomicBool,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl CommandChannel {
    pub fn new(
        manager: &ConnectionManager,
        identity: AgentIdentity,
        handlers: CommandHandlers,
        settings: CommandChannelSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport: manager.transport().clone(),
                state: manager.state().clone(),
                identity,
                handlers,
                settings,
                sink: ResponseSink::default(),
                outage_log: RateLimitedLog::default(),
                started: AtomicBool::new(false),
                tasks: TaskTracker::new(),
                cancel: manager.cancellation_token().child_token(),
            }),
        }
    }

    /// Opens the downstream stream and keeps it open until [`CommandChannel::close`].
    /// Calling it again is a no-op.
    pub fn connect(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        self.inner
            .tasks
            .spawn(async move { inner.run().await }.in_current_span());
    }

    /// True while a downstream writer is installed.
    pub fn is_connected(&self) -> bool {
        self.inner.sink.is_installed()
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.sink.clear();
        self.inner.tasks.close();
    }

    pub async fn await_close(&self, timeout: Duration) -> Result<(), ShutdownError> {
        tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .map_err(|_| ShutdownError::Timeout {
                resource: "command channel",
                timeout,
            })
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        // failures since the last inbound message
        let mut consecutive_failures = 0u32;

        loop {
            let (status, received_any) = match self.clone().session().await {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed {
                    status,
                    received_any,
                } => (status, received_any),
            };
            if received_any {
                consecutive_failures = 0;
            }
            consecutive_failures += 1;

            if consecutive_failures == 1 {
                debug!("downstream stream failed, reconnecting: {status}");
                continue;
            }

            self.state.set_connection_failure();
            if let Some(suppressed) = self.outage_log.permit() {
                warn!(
                    suppressed,
                    "unable to establish command channel with the collector (will keep trying): {status}"
                );
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
        self.sink.clear();
        debug!("command channel stopped");
    }

    async fn session(self: Arc<Self>) -> SessionEnd {
        if self.cancel.is_cancelled() {
            return SessionEnd::Cancelled;
        }
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
            connected = self.transport.connect_downstream() => connected,
        };
        let DownstreamStream {
            outbound,
            mut inbound,
        } = match connected {
            Ok(stream) => stream,
            Err(status) => {
                return SessionEnd::Failed {
                    status,
                    received_any: false,
                }
            }
        };

        if outbound
            .send(AgentResponse::hello(self.identity.as_str()))
            .await
            .is_err()
        {
            return SessionEnd::Failed {
                status: Status::unavailable("downstream closed before hello"),
                received_any: false,
            };
        }
        self.sink.install(outbound);

        let mut received_any = false;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                next = inbound.recv() => next,
            };
            match next {
                Some(Ok(request)) => {
                    received_any = true;
                    if self.state.clear_connection_failure() {
                        info!("re-established command channel with the collector");
                    }
                    self.spawn_dispatch(request);
                }
                Some(Err(status)) => {
                    self.sink.clear();
                    return SessionEnd::Failed {
                        status,
                        received_any,
                    };
                }
                None => {
                    self.sink.clear();
                    return SessionEnd::Failed {
                        status: Status::unavailable("downstream stream ended"),
                        received_any,
                    };
                }
            }
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, request: CentralRequest) {
        let inner = self.clone();
        let task = async move {
            let request_id = request.request_id;
            let Some(response) = dispatch(&inner.handlers, request).await else {
                return;
            };
            let sent = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                sent = inner.sink.send(response, inner.settings.response_wait) => sent,
            };
            if let Err(e) = sent {
                warn!(request_id, "unable to send command response: {e}");
            }
        };
        self.tasks.spawn(task.in_current_span());
    }
}
