// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::address::TargetConfig;
use crate::command::CommandChannelSettings;
use crate::connection::RetrySettings;
use crate::error::ConfigError;
use crate::identity::{get_hostname, AgentIdentity};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_BASE_MILLIS: u64 = 2000;
const DEFAULT_RETRY_MAX_TOTAL_MILLIS: u64 = 30_000;
const DEFAULT_HANDSHAKE_MAX_DELAY_MILLIS: u64 = 15_000;
const DEFAULT_COMMAND_RECONNECT_DELAY_MILLIS: u64 = 1000;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub collector: TargetConfig,
    pub agent_id: Option<String>,
    /// Legacy slash-separated rollup path.
    pub rollup_id: Option<String>,
    pub host_name: String,
    /// Directory holding the config-sync marker.
    pub conf_dir: PathBuf,
    pub config_read_only: bool,
    pub log_level: String,
    pub request_timeout: Duration,
    pub retry: RetrySettings,
    pub command: CommandChannelSettings,
    pub shutdown_timeout: Duration,
}

impl ExporterConfig {
    /// Reads the configuration from `AGENT_*` environment variables.
    ///
    /// The collector address is parsed here, so a malformed or mixed-scheme
    /// address list fails before any network activity.
    pub fn from_env() -> Result<ExporterConfig, ConfigError> {
        let address = non_empty_var("AGENT_COLLECTOR_ADDRESS")
            .ok_or(ConfigError::Missing("AGENT_COLLECTOR_ADDRESS"))?;
        let authority = non_empty_var("AGENT_COLLECTOR_AUTHORITY");
        let collector = TargetConfig::parse(&address, authority.as_deref())?;

        let retry = RetrySettings {
            base: Duration::from_millis(parse_var(
                "AGENT_RETRY_BASE_MILLIS",
                DEFAULT_RETRY_BASE_MILLIS,
            )?),
            max_total: Duration::from_millis(parse_var(
                "AGENT_RETRY_MAX_TOTAL_MILLIS",
                DEFAULT_RETRY_MAX_TOTAL_MILLIS,
            )?),
            handshake_max_delay: Duration::from_millis(parse_var(
                "AGENT_HANDSHAKE_MAX_DELAY_MILLIS",
                DEFAULT_HANDSHAKE_MAX_DELAY_MILLIS,
            )?),
        };
        if retry.base.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "AGENT_RETRY_BASE_MILLIS must be greater than zero".to_string(),
            ));
        }

        let command = CommandChannelSettings {
            reconnect_delay: Duration::from_millis(parse_var(
                "AGENT_COMMAND_RECONNECT_DELAY_MILLIS",
                DEFAULT_COMMAND_RECONNECT_DELAY_MILLIS,
            )?),
            ..CommandChannelSettings::default()
        };

        Ok(ExporterConfig {
            collector,
            agent_id: non_empty_var("AGENT_ID"),
            rollup_id: non_empty_var("AGENT_ROLLUP_ID"),
            host_name: get_hostname(),
            conf_dir: non_empty_var("AGENT_CONF_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            config_read_only: parse_bool_var("AGENT_CONFIG_READ_ONLY")?,
            log_level: env::var("AGENT_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or_else(|_| "info".to_string()),
            request_timeout: Duration::from_secs(parse_var(
                "AGENT_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            retry,
            command,
            shutdown_timeout: Duration::from_secs(parse_var(
                "AGENT_SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?),
        })
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity::resolve(
            self.agent_id.as_deref(),
            self.rollup_id.as_deref(),
            &self.host_name,
        )
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(name) {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidConfig(format!("{name}: invalid value '{value}'"))),
    }
}

fn parse_bool_var(name: &'static str) -> Result<bool, ConfigError> {
    match non_empty_var(name).map(|value| value.to_lowercase()).as_deref() {
        None | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(ConfigError::InvalidConfig(format!(
            "{name}: invalid value '{other}'"
        ))),
    }
}
