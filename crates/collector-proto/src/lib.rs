// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire models exchanged between the agent exporter and the central collector.
//!
//! Every RPC body and stream frame derives `serde` so the transport can carry
//! them as JSON. Capture payloads (aggregates, trace entries, profiles,
//! diagnostics) are produced by subsystems outside the exporter and travel as
//! opaque byte fields, base64 encoded on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// Base64 serialization for a single Vec<u8> field
pub(crate) mod serde_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// Base64 serialization for optional Vec<u8> field
pub(crate) mod serde_base64_option {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                serializer.serialize_some(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| {
            base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

/// Agent configuration document. Its schema belongs to the local config
/// collaborator; the exporter only moves it around.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentConfig(pub serde_json::Value);

/// Description of the monitored process sent with the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub host_name: String,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub start_time_millis: i64,
    #[serde(default)]
    pub runtime_version: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Handshake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    pub agent_id: String,
    pub agent_version: String,
    pub environment: Environment,
    pub agent_config: AgentConfig,
    /// When set the collector replaces its stored config with `agent_config`.
    pub overwrite_existing_agent_config: bool,
}

/// Handshake response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitResponse {
    /// Config held by the collector, returned when it should win over the local one.
    #[serde(default)]
    pub agent_config: Option<AgentConfig>,
    #[serde(default)]
    pub collector_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    pub gauge_name: String,
    pub value: f64,
    pub weight: i64,
    pub capture_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeValueMessage {
    pub agent_id: String,
    pub gauge_values: Vec<GaugeValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GaugeValueResponse {
    /// The collector lost its state for this agent and wants the handshake again.
    #[serde(default)]
    pub resend_init: bool,
}

/// Large text blob shared by reference across a stream.
///
/// Exactly one of `full_text` or (`truncated_text` + `full_text_sha`) is
/// populated; `truncated_end_text` is only used by trace streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedQueryText {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_end_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text_sha: Option<String>,
}

/// Frames of the aggregate client stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AggregateStreamMessage {
    StreamHeader {
        agent_id: String,
        capture_time: i64,
    },
    SharedQueryText(SharedQueryText),
    OverallAggregate {
        transaction_type: String,
        /// Stream-wide indexes of the shared query texts this aggregate references.
        shared_query_text_indexes: Vec<u32>,
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    TransactionAggregate {
        transaction_type: String,
        transaction_name: String,
        shared_query_text_indexes: Vec<u32>,
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResponse {
    /// Collector-suggested delay before the next aggregate upload.
    #[serde(default)]
    pub next_delay_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceQuery {
    pub shared_query_text_index: u32,
    #[serde(with = "serde_base64")]
    pub payload: Vec<u8>,
}

/// Frames of the trace client stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TraceStreamMessage {
    StreamHeader {
        agent_id: String,
        trace_id: String,
        update: bool,
    },
    Entry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shared_query_text_index: Option<u32>,
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    Queries {
        queries: Vec<TraceQuery>,
    },
    SharedQueryText(SharedQueryText),
    MainThreadProfile {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    AuxThreadProfile {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    Header {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    StreamCounts {
        entry_count: u32,
        shared_query_text_count: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: i64,
    pub level: LogLevel,
    pub logger_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throwable: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub agent_id: String,
    pub log_event: LogEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    pub parameter_types: Vec<String>,
    pub return_type: String,
    pub modifiers: Vec<String>,
}

/// Request pushed by the collector over the downstream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralRequest {
    pub request_id: i64,
    pub request: CentralRequestKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CentralRequestKind {
    HelloAck,
    ThreadDump,
    Jstack,
    AvailableDiskSpace {
        directory: String,
    },
    HeapDump {
        directory: String,
    },
    HeapHistogram,
    ExplicitGc,
    MbeanTree {
        #[serde(default)]
        include_attrs_for_object_names: Vec<String>,
    },
    MbeanMeta {
        object_name: String,
    },
    Capabilities,
    GlobalMeta,
    PreloadClasspathCache,
    MatchingClassNames {
        partial_class_name: String,
        limit: u32,
    },
    MatchingMethodNames {
        class_name: String,
        partial_method_name: String,
        limit: u32,
    },
    MethodSignatures {
        class_name: String,
        method_name: String,
    },
    Reweave,
    AgentConfigUpdate {
        agent_config: AgentConfig,
    },
    Header {
        trace_id: String,
    },
    Entries {
        trace_id: String,
    },
    Queries {
        trace_id: String,
    },
    MainThreadProfile {
        trace_id: String,
    },
    AuxThreadProfile {
        trace_id: String,
    },
    FullTrace {
        trace_id: String,
    },
    /// A known request type whose fields could not be decoded.
    #[serde(skip)]
    Malformed {
        error: String,
    },
    /// Any request type this agent does not know about.
    #[serde(other)]
    Unknown,
}

impl CentralRequestKind {
    /// Short label used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HelloAck => "hello-ack",
            Self::ThreadDump => "thread-dump",
            Self::Jstack => "jstack",
            Self::AvailableDiskSpace { .. } => "available-disk-space",
            Self::HeapDump { .. } => "heap-dump",
            Self::HeapHistogram => "heap-histogram",
            Self::ExplicitGc => "explicit-gc",
            Self::MbeanTree { .. } => "mbean-tree",
            Self::MbeanMeta { .. } => "mbean-meta",
            Self::Capabilities => "capabilities",
            Self::GlobalMeta => "global-meta",
            Self::PreloadClasspathCache => "preload-classpath-cache",
            Self::MatchingClassNames { .. } => "matching-class-names",
            Self::MatchingMethodNames { .. } => "matching-method-names",
            Self::MethodSignatures { .. } => "method-signatures",
            Self::Reweave => "reweave",
            Self::AgentConfigUpdate { .. } => "agent-config-update",
            Self::Header { .. } => "header",
            Self::Entries { .. } => "entries",
            Self::Queries { .. } => "queries",
            Self::MainThreadProfile { .. } => "main-thread-profile",
            Self::AuxThreadProfile { .. } => "aux-thread-profile",
            Self::FullTrace { .. } => "full-trace",
            Self::Malformed { .. } => "malformed",
            Self::Unknown => "unknown",
        }
    }
}

/// Just enough of a request to answer it.
#[derive(Deserialize)]
struct RequestEnvelope {
    request_id: i64,
}

impl CentralRequest {
    /// Decodes a downstream frame. A frame whose body does not decode but whose
    /// `request_id` does comes back as [`CentralRequestKind::Malformed`], so the
    /// collector still gets an answer. Fails only when no id can be read.
    pub fn from_json_lenient(text: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<CentralRequest>(text) {
            Ok(request) => Ok(request),
            Err(error) => match serde_json::from_str::<RequestEnvelope>(text) {
                Ok(envelope) => Ok(CentralRequest {
                    request_id: envelope.request_id,
                    request: CentralRequestKind::Malformed {
                        error: error.to_string(),
                    },
                }),
                Err(_) => Err(error),
            },
        }
    }
}

/// Message written by the agent over the downstream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub request_id: i64,
    pub response: AgentResponseKind,
}

impl AgentResponse {
    /// First message on every downstream connection.
    pub fn hello(agent_id: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            response: AgentResponseKind::Hello {
                agent_id: agent_id.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentResponseKind {
    Hello {
        agent_id: String,
    },
    ThreadDump {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    Jstack {
        jstack: String,
    },
    AvailableDiskSpace {
        available_bytes: i64,
    },
    HeapDump {
        file_path: String,
        file_size_bytes: i64,
    },
    HeapHistogram {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    ExplicitGc,
    MbeanTree {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    MbeanMeta {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    Capabilities {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    GlobalMeta {
        #[serde(with = "serde_base64")]
        payload: Vec<u8>,
    },
    PreloadClasspathCache,
    MatchingClassNames {
        class_names: Vec<String>,
    },
    MatchingMethodNames {
        method_names: Vec<String>,
    },
    MethodSignatures {
        signatures: Vec<MethodSignature>,
    },
    Reweave {
        class_update_count: u32,
    },
    AgentConfigUpdate,
    /// Trace detail payloads are absent when the trace is no longer held locally.
    Header {
        #[serde(default, with = "serde_base64_option")]
        payload: Option<Vec<u8>>,
    },
    Entries {
        #[serde(default, with = "serde_base64_option")]
        payload: Option<Vec<u8>>,
    },
    Queries {
        #[serde(default, with = "serde_base64_option")]
        payload: Option<Vec<u8>>,
    },
    MainThreadProfile {
        #[serde(default, with = "serde_base64_option")]
        payload: Option<Vec<u8>>,
    },
    AuxThreadProfile {
        #[serde(default, with = "serde_base64_option")]
        payload: Option<Vec<u8>>,
    },
    FullTrace {
        #[serde(default, with = "serde_base64_option")]
        payload: Option<Vec<u8>>,
    },
    UnknownRequest,
    Exception {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_uses_request_id_zero() {
        let hello = AgentResponse::hello("host-1");
        assert_eq!(hello.request_id, 0);
        assert_eq!(
            hello.response,
            AgentResponseKind::Hello {
                agent_id: "host-1".into()
            }
        );
    }

    #[test]
    fn request_names_are_stable() {
        assert_eq!(CentralRequestKind::ThreadDump.name(), "thread-dump");
        assert_eq!(
            CentralRequestKind::FullTrace {
                trace_id: "t".into()
            }
            .name(),
            "full-trace"
        );
        assert_eq!(CentralRequestKind::Unknown.name(), "unknown");
    }
}
