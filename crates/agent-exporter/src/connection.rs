// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection lifecycle and retry execution.
//!
//! [`ConnectionManager`] owns the transport, the shared connection-failure
//! flag and the retry scheduler (a task tracker plus cancellation token).
//! Calls are plain closures receiving the transport; whatever the caller does
//! with the response happens after the returned future resolves.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use crate::backoff::{
    BackoffConfig, RetryPolicy, RetryState, DEFAULT_BASE_DELAY, DEFAULT_HANDSHAKE_MAX_DELAY,
    DEFAULT_MAX_TOTAL,
};
use crate::error::{CallError, Code, ShutdownError, Status};
use crate::rate_limited_log::RateLimitedLog;
use crate::transport::CollectorTransport;

/// Whether log lines about a call may be forwarded to the collector.
///
/// Calls that themselves forward logs run `Suppressed` so a failing log
/// upload does not produce another log upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteLogging {
    Enabled,
    Suppressed,
}

impl RemoteLogging {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, RemoteLogging::Suppressed)
    }
}

/// Per-call context threaded through the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSpec {
    pub name: &'static str,
    pub remote_logging: RemoteLogging,
}

impl CallSpec {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            remote_logging: RemoteLogging::Enabled,
        }
    }

    pub const fn with_remote_logging(mut self, remote_logging: RemoteLogging) -> Self {
        self.remote_logging = remote_logging;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub base: Duration,
    /// Default total budget for `call_with_retries`.
    pub max_total: Duration,
    pub handshake_max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max_total: DEFAULT_MAX_TOTAL,
            handshake_max_delay: DEFAULT_HANDSHAKE_MAX_DELAY,
        }
    }
}

/// The cross-component flags. These two cells are the only mutable state
/// shared between the exporter and the command channel.
#[derive(Debug, Default)]
pub struct ConnectionState {
    connection_failure: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionState {
    pub fn in_connection_failure(&self) -> bool {
        self.connection_failure.load(Ordering::Acquire)
    }

    /// Returns true when this call flipped the flag from clear to set.
    pub fn set_connection_failure(&self) -> bool {
        self.connection_failure
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true when this call flipped the flag from set to clear.
    pub fn clear_connection_failure(&self) -> bool {
        self.connection_failure
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn CollectorTransport>,
    state: Arc<ConnectionState>,
    settings: RetrySettings,
    failure_log: RateLimitedLog,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn CollectorTransport>, settings: RetrySettings) -> Self {
        Self {
            transport,
            state: Arc::new(ConnectionState::default()),
            settings,
            failure_log: RateLimitedLog::default(),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn CollectorTransport> {
        &self.transport
    }

    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    pub fn settings(&self) -> RetrySettings {
        self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Token cancelled by [`ConnectionManager::close`]; components with their
    /// own scheduler derive child tokens from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `future` on the retry scheduler.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(future.in_current_span())
    }

    /// Issues `call` exactly once.
    pub async fn call_once<T, F, Fut>(&self, spec: CallSpec, mut call: F) -> Result<T, CallError>
    where
        F: FnMut(Arc<dyn CollectorTransport>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        if self.is_closed() {
            return Err(CallError::Closed);
        }
        match call(self.transport.clone()).await {
            Ok(value) => Ok(value),
            Err(status) => {
                if status.is_connection_failure() {
                    self.record_failure(spec, &status);
                } else {
                    debug!(
                        call = spec.name,
                        suppress_remote = spec.remote_logging.is_suppressed(),
                        "collector rejected call: {status}"
                    );
                }
                Err(CallError::Status(status))
            }
        }
    }

    /// Issues `call`, retrying transient failures with jittered exponential
    /// backoff until `max_total` of wall-clock time would be exceeded.
    ///
    /// Skipped entirely while the connection is known to be down.
    pub async fn call_with_retries<T, F, Fut>(
        &self,
        spec: CallSpec,
        max_total: Duration,
        call: F,
    ) -> Result<T, CallError>
    where
        F: FnMut(Arc<dyn CollectorTransport>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        if self.is_closed() {
            return Err(CallError::Closed);
        }
        if self.state.in_connection_failure() {
            debug!(call = spec.name, "skipping call while the collector is unreachable");
            return Err(CallError::ConnectionDown);
        }
        let policy = RetryPolicy::Bounded {
            base: self.settings.base,
            max_total,
        };
        self.run(spec, policy, call).await
    }

    /// Issues the handshake `call`, retrying forever until it succeeds or the
    /// manager is closed. The very first failure is retried immediately.
    pub async fn call_handshake<T, F, Fut>(&self, spec: CallSpec, call: F) -> Result<T, CallError>
    where
        F: FnMut(Arc<dyn CollectorTransport>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        if self.is_closed() {
            return Err(CallError::Closed);
        }
        let policy = RetryPolicy::Handshake {
            base: self.settings.base,
            max_delay: self.settings.handshake_max_delay,
        };
        self.run(spec, policy, call).await
    }

    async fn run<T, F, Fut>(
        &self,
        spec: CallSpec,
        policy: RetryPolicy,
        mut call: F,
    ) -> Result<T, CallError>
    where
        F: FnMut(Arc<dyn CollectorTransport>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let Some(backoff) = BackoffConfig::for_policy(policy) else {
            return self.call_once(spec, call).await;
        };
        let handshake = matches!(policy, RetryPolicy::Handshake { .. });
        let budget = match policy {
            RetryPolicy::Bounded { max_total, .. } => Some(max_total),
            _ => None,
        };
        let max_attempts = policy.max_attempts();

        let start = Instant::now();
        let mut retry = RetryState::new(backoff);
        let mut attempts = 0u32;
        let mut free_retry_available = handshake;

        loop {
            if self.is_closed() {
                return Err(CallError::Closed);
            }
            attempts += 1;
            let status = match call(self.transport.clone()).await {
                Ok(value) => {
                    if handshake && self.state.clear_connection_failure() {
                        info!(
                            call = spec.name,
                            suppress_remote = spec.remote_logging.is_suppressed(),
                            "re-established connection to the collector"
                        );
                    }
                    return Ok(value);
                }
                Err(status) => status,
            };

            if !handshake && !status.is_retryable() {
                if status.code == Code::ResourceExhausted {
                    debug!(
                        call = spec.name,
                        suppress_remote = spec.remote_logging.is_suppressed(),
                        "collector is exhausted, not retrying: {status}"
                    );
                } else {
                    warn!(
                        call = spec.name,
                        suppress_remote = spec.remote_logging.is_suppressed(),
                        "collector rejected call: {status}"
                    );
                }
                return Err(CallError::Status(status));
            }

            if free_retry_available {
                free_retry_available = false;
                debug!(call = spec.name, "retrying immediately after first failure: {status}");
                continue;
            }

            if handshake || status.is_connection_failure() {
                self.record_failure(spec, &status);
            }

            let delay = retry.register_failure();
            if let Some(max_total) = budget {
                let elapsed = start.elapsed();
                let exhausted = max_attempts.is_some_and(|max| attempts >= max);
                if exhausted || elapsed + delay > max_total {
                    debug!(
                        call = spec.name,
                        attempts,
                        ?elapsed,
                        suppress_remote = spec.remote_logging.is_suppressed(),
                        "giving up on call: {status}"
                    );
                    return Err(CallError::GaveUp {
                        attempts,
                        elapsed,
                        last: status,
                    });
                }
            }

            debug!(call = spec.name, attempts, ?delay, "backing off before retry");
            if !self.sleep(delay).await {
                return Err(CallError::Closed);
            }
        }
    }

    /// Returns false when the sleep was cut short by `close`.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn record_failure(&self, spec: CallSpec, status: &Status) {
        self.state.set_connection_failure();
        if let Some(suppressed) = self.failure_log.permit() {
            warn!(
                call = spec.name,
                suppressed,
                suppress_remote = spec.remote_logging.is_suppressed(),
                "unable to reach the collector (will keep trying): {status}"
            );
        }
    }

    /// Flips the closed flag and stops accepting new scheduler work.
    pub fn close(&self) {
        self.state.mark_closed();
        self.cancel.cancel();
        self.tasks.close();
    }

    /// Waits for the retry scheduler and then the transport to wind down,
    /// each bounded by `timeout`.
    pub async fn await_close(&self, timeout: Duration) -> Result<(), ShutdownError> {
        if tokio::time::timeout(timeout, self.tasks.wait())
            .await
            .is_err()
        {
            return Err(ShutdownError::Timeout {
                resource: "retry scheduler",
                timeout,
            });
        }
        if tokio::time::timeout(timeout, self.transport.shutdown())
            .await
            .is_err()
        {
            return Err(ShutdownError::Timeout {
                resource: "transport channel",
                timeout,
            });
        }
        debug!("connection manager closed");
        Ok(())
    }
}
