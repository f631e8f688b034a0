// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decides which side's agent config wins during the handshake.
//!
//! A marker file holding `agent.id=<id>` records that the collector already
//! holds this agent's config. With a matching marker the collector's copy is
//! trusted; without one the local config is pushed and the marker recreated.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use collector_proto::AgentConfig;

use crate::error::CommandError;

pub const MARKER_FILE_NAME: &str = "config-sync.properties";
const AGENT_ID_KEY: &str = "agent.id";

#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("unable to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("unable to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Local agent configuration, owned outside the exporter.
pub trait LocalConfigService: Send + Sync {
    fn snapshot(&self) -> AgentConfig;

    /// Read-only configs are always pushed and never overwritten.
    fn is_read_only(&self) -> bool;

    fn overwrite_from_collector(&self, config: AgentConfig) -> Result<(), CommandError>;
}

#[derive(Debug, Clone)]
pub struct ConfigSyncMarker {
    path: PathBuf,
}

impl ConfigSyncMarker {
    pub fn in_dir(conf_dir: impl AsRef<Path>) -> Self {
        Self {
            path: conf_dir.as_ref().join(MARKER_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file counts as "not synced".
    pub fn is_synced_for(&self, agent_id: &str) -> Result<bool, MarkerError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(MarkerError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(read_property(&contents, AGENT_ID_KEY).as_deref() == Some(agent_id))
    }

    pub fn write(&self, agent_id: &str) -> Result<(), MarkerError> {
        let contents = format!(
            "# written after the collector accepted this agent's config\n{}={}\n",
            AGENT_ID_KEY,
            escape_property_value(agent_id)
        );
        fs::write(&self.path, contents).map_err(|source| MarkerError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn read_property(contents: &str, key: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim_start)
        .filter(|line| !line.starts_with('#') && !line.starts_with('!'))
        .find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k.trim() == key).then(|| unescape_property_value(v.trim()))
        })
}

// properties-file escaping: `\`, `:` and `=` are backslash-escaped
fn escape_property_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ':' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn unescape_property_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                unescaped.push(next);
            }
        } else {
            unescaped.push(c);
        }
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_marker_is_not_synced() {
        let dir = tempfile::tempdir().unwrap();
        let marker = ConfigSyncMarker::in_dir(dir.path());
        assert!(!marker.is_synced_for("agent-1").unwrap());
    }

    #[test]
    fn written_marker_matches_only_its_id() {
        let dir = tempfile::tempdir().unwrap();
        let marker = ConfigSyncMarker::in_dir(dir.path());
        let id = r"web::host:\:a\b";

        marker.write(id).unwrap();

        assert!(marker.is_synced_for(id).unwrap());
        assert!(!marker.is_synced_for("other").unwrap());
    }

    #[test]
    fn reads_hand_written_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MARKER_FILE_NAME),
            "#comment\nother=1\n  agent.id = web\\:\\:host\n",
        )
        .unwrap();

        let marker = ConfigSyncMarker::in_dir(dir.path());
        assert!(marker.is_synced_for("web::host").unwrap());
    }

    #[test]
    fn unreadable_marker_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be
        fs::create_dir(dir.path().join(MARKER_FILE_NAME)).unwrap();

        let marker = ConfigSyncMarker::in_dir(dir.path());
        assert!(marker.is_synced_for("agent").is_err());
    }
}
