// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Maps each collector request onto exactly one collaborator call.

use std::sync::Arc;

use async_trait::async_trait;
use collector_proto::{
    AgentConfig, AgentResponse, AgentResponseKind, CentralRequest, CentralRequestKind,
    MethodSignature,
};
use tracing::{debug, warn, Instrument};

use crate::error::CommandError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDumpFile {
    pub file_path: String,
    pub file_size_bytes: i64,
}

/// On-demand diagnostics of the monitored process.
#[async_trait]
pub trait DiagnosticsService: Send + Sync {
    async fn thread_dump(&self) -> Result<Vec<u8>, CommandError>;

    async fn jstack(&self) -> Result<String, CommandError>;

    async fn available_disk_space(&self, directory: &str) -> Result<i64, CommandError>;

    async fn heap_dump(&self, directory: &str) -> Result<HeapDumpFile, CommandError>;

    async fn heap_histogram(&self) -> Result<Vec<u8>, CommandError>;

    async fn explicit_gc(&self) -> Result<(), CommandError>;

    async fn mbean_tree(&self, include_attrs_for_object_names: &[String])
        -> Result<Vec<u8>, CommandError>;

    async fn mbean_meta(&self, object_name: &str) -> Result<Vec<u8>, CommandError>;

    async fn capabilities(&self) -> Result<Vec<u8>, CommandError>;

    async fn global_meta(&self) -> Result<Vec<u8>, CommandError>;

    async fn preload_classpath_cache(&self) -> Result<(), CommandError>;

    async fn matching_class_names(
        &self,
        partial_class_name: &str,
        limit: u32,
    ) -> Result<Vec<String>, CommandError>;

    async fn matching_method_names(
        &self,
        class_name: &str,
        partial_method_name: &str,
        limit: u32,
    ) -> Result<Vec<String>, CommandError>;

    async fn method_signatures(
        &self,
        class_name: &str,
        method_name: &str,
    ) -> Result<Vec<MethodSignature>, CommandError>;

    /// Returns the number of classes retransformed.
    async fn reweave(&self) -> Result<u32, CommandError>;

    async fn update_agent_config(&self, agent_config: AgentConfig) -> Result<(), CommandError>;
}

/// Locally held trace details. `Ok(None)` means the trace has expired.
#[async_trait]
pub trait TraceDetailSource: Send + Sync {
    async fn header(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError>;

    async fn entries(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError>;

    async fn queries(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError>;

    async fn main_thread_profile(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError>;

    async fn aux_thread_profile(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError>;

    async fn full_trace(&self, trace_id: &str) -> Result<Option<Vec<u8>>, CommandError>;
}

/// Collaborators commands are dispatched to.
#[derive(Clone)]
pub struct CommandHandlers {
    pub diagnostics: Arc<dyn DiagnosticsService>,
    pub traces: Arc<dyn TraceDetailSource>,
}

/// Handles one request. Returns `None` only for requests that take no
/// response (`HelloAck`).
///
/// The collaborator runs in its own task so that a panic is reported to the
/// collector like any other failure.
pub async fn dispatch(handlers: &CommandHandlers, request: CentralRequest) -> Option<AgentResponse> {
    let CentralRequest {
        request_id,
        request,
    } = request;
    let name = request.name();

    let response = match request {
        CentralRequestKind::HelloAck => {
            debug!("collector acknowledged hello");
            return None;
        }
        CentralRequestKind::Unknown => {
            warn!(request_id, "unknown request from the collector");
            AgentResponseKind::UnknownRequest
        }
        CentralRequestKind::Malformed { error } => {
            warn!(request_id, "malformed request from the collector: {error}");
            AgentResponseKind::Exception {
                message: format!("malformed request: {error}"),
            }
        }
        request => {
            let handlers = handlers.clone();
            let outcome =
                tokio::spawn(async move { invoke(&handlers, request).await }.in_current_span())
                    .await;
            match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!(request_id, request = name, "command failed: {e}");
                    AgentResponseKind::Exception {
                        message: e.to_string(),
                    }
                }
                Err(join_error) => {
                    warn!(request_id, request = name, "command panicked: {join_error}");
                    AgentResponseKind::Exception {
                        message: format!("{name} failed unexpectedly"),
                    }
                }
            }
        }
    };
    Some(AgentResponse {
        request_id,
        response,
    })
}

async fn invoke(
    handlers: &CommandHandlers,
    request: CentralRequestKind,
) -> Result<AgentResponseKind, CommandError> {
    let diagnostics = handlers.diagnostics.as_ref();
    let traces = handlers.traces.as_ref();

    let response = match request {
        CentralRequestKind::ThreadDump => AgentResponseKind::ThreadDump {
            payload: diagnostics.thread_dump().await?,
        },
        CentralRequestKind::Jstack => AgentResponseKind::Jstack {
            jstack: diagnostics.jstack().await?,
        },
        CentralRequestKind::AvailableDiskSpace { directory } => {
            AgentResponseKind::AvailableDiskSpace {
                available_bytes: diagnostics.available_disk_space(&directory).await?,
            }
        }
        CentralRequestKind::HeapDump { directory } => {
            let file = diagnostics.heap_dump(&directory).await?;
            AgentResponseKind::HeapDump {
                file_path: file.file_path,
                file_size_bytes: file.file_size_bytes,
            }
        }
        CentralRequestKind::HeapHistogram => AgentResponseKind::HeapHistogram {
            payload: diagnostics.heap_histogram().await?,
        },
        CentralRequestKind::ExplicitGc => {
            diagnostics.explicit_gc().await?;
            AgentResponseKind::ExplicitGc
        }
        CentralRequestKind::MbeanTree {
            include_attrs_for_object_names,
        } => AgentResponseKind::MbeanTree {
            payload: diagnostics
                .mbean_tree(&include_attrs_for_object_names)
                .await?,
        },
        CentralRequestKind::MbeanMeta { object_name } => AgentResponseKind::MbeanMeta {
            payload: diagnostics.mbean_meta(&object_name).await?,
        },
        CentralRequestKind::Capabilities => AgentResponseKind::Capabilities {
            payload: diagnostics.capabilities().await?,
        },
        CentralRequestKind::GlobalMeta => AgentResponseKind::GlobalMeta {
            payload: diagnostics.global_meta().await?,
        },
        CentralRequestKind::PreloadClasspathCache => {
            diagnostics.preload_classpath_cache().await?;
            AgentResponseKind::PreloadClasspathCache
        }
        CentralRequestKind::MatchingClassNames {
            partial_class_name,
            limit,
        } => AgentResponseKind::MatchingClassNames {
            class_names: diagnostics
                .matching_class_names(&partial_class_name, limit)
                .await?,
        },
        CentralRequestKind::MatchingMethodNames {
            class_name,
            partial_method_name,
            limit,
        } => AgentResponseKind::MatchingMethodNames {
            method_names: diagnostics
                .matching_method_names(&class_name, &partial_method_name, limit)
                .await?,
        },
        CentralRequestKind::MethodSignatures {
            class_name,
            method_name,
        } => AgentResponseKind::MethodSignatures {
            signatures: diagnostics
                .method_signatures(&class_name, &method_name)
                .await?,
        },
        CentralRequestKind::Reweave => AgentResponseKind::Reweave {
            class_update_count: diagnostics.reweave().await?,
        },
        CentralRequestKind::AgentConfigUpdate { agent_config } => {
            diagnostics.update_agent_config(agent_config).await?;
            AgentResponseKind::AgentConfigUpdate
        }
        CentralRequestKind::Header { trace_id } => AgentResponseKind::Header {
            payload: traces.header(&trace_id).await?,
        },
        CentralRequestKind::Entries { trace_id } => AgentResponseKind::Entries {
            payload: traces.entries(&trace_id).await?,
        },
        CentralRequestKind::Queries { trace_id } => AgentResponseKind::Queries {
            payload: traces.queries(&trace_id).await?,
        },
        CentralRequestKind::MainThreadProfile { trace_id } => {
            AgentResponseKind::MainThreadProfile {
                payload: traces.main_thread_profile(&trace_id).await?,
            }
        }
        CentralRequestKind::AuxThreadProfile { trace_id } => AgentResponseKind::AuxThreadProfile {
            payload: traces.aux_thread_profile(&trace_id).await?,
        },
        CentralRequestKind::FullTrace { trace_id } => AgentResponseKind::FullTrace {
            payload: traces.full_trace(&trace_id).await?,
        },
        CentralRequestKind::HelloAck
        | CentralRequestKind::Malformed { .. }
        | CentralRequestKind::Unknown => AgentResponseKind::UnknownRequest,
    };
    Ok(response)
}
