// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collaborators for running the exporter outside an instrumented runtime.
//!
//! The agent config lives in a JSON file next to the config-sync marker.
//! Runtime diagnostics are not available here, so those commands are reported
//! to the collector as unsupported.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_exporter::command::{DiagnosticsService, HeapDumpFile, TraceDetailSource};
use agent_exporter::config_sync::LocalConfigService;
use agent_exporter::error::CommandError;
use agent_exporter::proto::{AgentConfig, MethodSignature};
use async_trait::async_trait;
use tracing::{debug, warn};

pub const AGENT_CONFIG_FILE_NAME: &str = "agent-config.json";

pub struct FileLocalConfig {
    path: PathBuf,
    read_only: bool,
}

impl FileLocalConfig {
    pub fn in_dir(conf_dir: &Path, read_only: bool) -> Self {
        Self {
            path: conf_dir.join(AGENT_CONFIG_FILE_NAME),
            read_only,
        }
    }

    fn read(&self) -> Result<AgentConfig, CommandError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CommandError::failed(format!("invalid {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Ok(AgentConfig(serde_json::Value::Object(Default::default())))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, config: &AgentConfig) -> Result<(), CommandError> {
        if self.read_only {
            return Err(CommandError::failed(format!(
                "{} is read only",
                self.path.display()
            )));
        }
        let bytes = serde_json::to_vec_pretty(config)
            .map_err(|e| CommandError::failed(e.to_string()))?;
        fs::write(&self.path, bytes)?;
        debug!(path = %self.path.display(), "agent config written");
        Ok(())
    }
}

impl LocalConfigService for FileLocalConfig {
    fn snapshot(&self) -> AgentConfig {
        self.read().unwrap_or_else(|e| {
            warn!("unable to read local agent config, sending an empty one: {e}");
            AgentConfig(serde_json::Value::Object(Default::default()))
        })
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn overwrite_from_collector(&self, config: AgentConfig) -> Result<(), CommandError> {
        self.write(&config)
    }
}

/// Answers every runtime diagnostic with `Unsupported`; only config updates
/// are carried out.
pub struct StandaloneDiagnostics {
    local_config: Arc<FileLocalConfig>,
}

impl StandaloneDiagnostics {
    pub fn new(local_config: Arc<FileLocalConfig>) -> Self {
        Self { local_config }
    }
}

fn unsupported<T>(operation: &str) -> Result<T, CommandError> {
    Err(CommandError::Unsupported(operation.to_string()))
}

#[async_trait]
impl DiagnosticsService for StandaloneDiagnostics {
    async fn thread_dump(&self) -> Result<Vec<u8>, CommandError> {
        unsupported("thread dump")
    }

    async fn jstack(&self) -> Result<String, CommandError> {
        unsupported("jstack")
    }

    async fn available_disk_space(&self, _directory: &str) -> Result<i64, CommandError> {
        unsupported("available disk space")
    }

    async fn heap_dump(&self, _directory: &str) -> Result<HeapDumpFile, CommandError> {
        unsupported("heap dump")
    }

    async fn heap_histogram(&self) -> Result<Vec<u8>, CommandError> {
        unsupported("heap histogram")
    }

    async fn explicit_gc(&self) -> Result<(), CommandError> {
        unsupported("explicit gc")
    }

    async fn mbean_tree(
        &self,
        _include_attrs_for_object_names: &[String],
    ) -> Result<Vec<u8>, CommandError> {
        unsupported("mbean tree")
    }

    async fn mbean_meta(&self, _object_name: &str) -> Result<Vec<u8>, CommandError> {
        unsupported("mbean meta")
    }

    async fn capabilities(&self) -> Result<Vec<u8>, CommandError> {
        Ok(b"{}".to_vec())
    }

    async fn global_meta(&self) -> Result<Vec<u8>, CommandError> {
        unsupported("global meta")
    }

    async fn preload_classpath_cache(&self) -> Result<(), CommandError> {
        Ok(())
    }

    async fn matching_class_names(
        &self,
        _partial_class_name: &str,
        _limit: u32,
    ) -> Result<Vec<String>, CommandError> {
        Ok(Vec::new())
    }

    async fn matching_method_names(
        &self,
        _class_name: &str,
        _partial_method_name: &str,
        _limit: u32,
    ) -> Result<Vec<String>, CommandError> {
        Ok(Vec::new())
    }

    async fn method_signatures(
        &self,
        _class_name: &str,
        _method_name: &str,
    ) -> Result<Vec<MethodSignature>, CommandError> {
        Ok(Vec::new())
    }

    async fn reweave(&self) -> Result<u32, CommandError> {
        Ok(0)
    }

    async fn update_agent_config(&self, agent_config: AgentConfig) -> Result<(), CommandError> {
        self.local_config.write(&agent_config)
    }
}

/// No traces are captured locally, so every lookup reports an expired trace.
pub struct NoTraces;

#[async_trait]
impl TraceDetailSource for NoTraces {
    async fn header(&self, _trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Ok(None)
    }

    async fn entries(&self, _trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Ok(None)
    }

    async fn queries(&self, _trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Ok(None)
    }

    async fn main_thread_profile(&self, _trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Ok(None)
    }

    async fn aux_thread_profile(&self, _trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Ok(None)
    }

    async fn full_trace(&self, _trace_id: &str) -> Result<Option<Vec<u8>>, CommandError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileLocalConfig::in_dir(dir.path(), false);

        assert_eq!(config.snapshot(), AgentConfig(serde_json::json!({})));
    }

    #[test]
    fn collector_config_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileLocalConfig::in_dir(dir.path(), false);
        let central = AgentConfig(serde_json::json!({"gauges": [{"mbeanObjectName": "java.lang:type=Memory"}]}));

        config.overwrite_from_collector(central.clone()).unwrap();

        assert_eq!(config.snapshot(), central);
        assert!(dir.path().join(AGENT_CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn read_only_config_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileLocalConfig::in_dir(dir.path(), true);

        let result = config.overwrite_from_collector(AgentConfig(serde_json::json!({})));

        assert!(matches!(result, Err(CommandError::Failed(_))));
        assert!(!dir.path().join(AGENT_CONFIG_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn diagnostics_report_unsupported_operations() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics =
            StandaloneDiagnostics::new(Arc::new(FileLocalConfig::in_dir(dir.path(), false)));

        assert_eq!(
            diagnostics.heap_dump("/tmp").await,
            Err(CommandError::Unsupported("heap dump".to_string()))
        );
        diagnostics
            .update_agent_config(AgentConfig(serde_json::json!({"ui": {}})))
            .await
            .unwrap();
        assert!(dir.path().join(AGENT_CONFIG_FILE_NAME).exists());
    }
}
