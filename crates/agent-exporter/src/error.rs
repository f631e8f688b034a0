// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

/// Status codes reported by the collector transport.
///
/// The set follows gRPC so that a gRPC transport can map statuses one to one;
/// the HTTP transport maps response codes onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    ResourceExhausted,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// A failed transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    /// Transient failures worth another attempt.
    ///
    /// `ResourceExhausted` is an explicit backpressure signal and is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            Code::Unavailable
                | Code::DeadlineExceeded
                | Code::Internal
                | Code::Unknown
                | Code::Cancelled
        )
    }

    /// Failures that say the link itself is down, as opposed to the collector
    /// answering, even with an error.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self.code,
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled
        )
    }
}

/// Outcome of a call issued through the connection manager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("connection manager is closed")]
    Closed,

    #[error("skipped while the collector connection is in failure")]
    ConnectionDown,

    #[error("{0}")]
    Status(#[from] Status),

    #[error("gave up after {attempts} attempts over {elapsed:?}: {last}")]
    GaveUp {
        attempts: u32,
        elapsed: Duration,
        last: Status,
    },
}

impl CallError {
    /// True for the short-circuit variants where no call was issued at all.
    pub fn is_skipped(&self) -> bool {
        matches!(self, CallError::Closed | CallError::ConnectionDown)
    }
}

/// Errors raised while building the exporter from configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Collector addresses mix plaintext and TLS schemes: {0}")]
    MixedSchemes(String),

    #[error("Invalid collector address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Unable to resolve any collector address: {0}")]
    Unresolvable(String),
}

/// Errors from `close`/`await_close`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    #[error("{resource} did not terminate within {timeout:?}")]
    Timeout {
        resource: &'static str,
        timeout: Duration,
    },
}

/// Failure reported by a local collaborator (diagnostics, trace store, local config).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    Failed(String),

    #[error("not supported by this runtime: {0}")]
    Unsupported(String),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        CommandError::Failed(message.into())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(error: std::io::Error) -> Self {
        CommandError::Failed(error.to_string())
    }
}

/// Errors surfaced by the telemetry exporter to its callers.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("call failed: {0}")]
    Call(#[from] CallError),

    #[error("unable to read capture data: {0}")]
    Reader(String),

    #[error("config sync marker: {0}")]
    Marker(#[from] crate::config_sync::MarkerError),

    #[error("local config update failed: {0}")]
    LocalConfig(#[from] CommandError),

    #[error("background task failed: {0}")]
    Task(String),
}
