// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent identity and host name detection.
//!
//! The identity is computed once at startup and sent with every call. When no
//! explicit id is configured it is derived from the host name, escaped so the
//! collector can split rollup paths on `::` unambiguously.

use std::env;
use std::fmt;

use tracing::warn;

const ROLLUP_SEPARATOR: &str = "::";

/// Immutable identity of this agent for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentity {
    id: String,
}

impl AgentIdentity {
    /// Uses `agent_id` verbatim when configured, otherwise the escaped host name,
    /// prefixed by the converted legacy rollup path when one is present.
    pub fn resolve(agent_id: Option<&str>, legacy_rollup: Option<&str>, host_name: &str) -> Self {
        if let Some(id) = agent_id.map(str::trim).filter(|id| !id.is_empty()) {
            return Self { id: id.to_string() };
        }
        let escaped = escape_host_name(host_name);
        let id = match legacy_rollup.map(convert_legacy_rollup) {
            Some(rollup) if !rollup.is_empty() => format!("{rollup}{ROLLUP_SEPARATOR}{escaped}"),
            _ => escaped,
        };
        Self { id }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Escapes a host name so it never contains the rollup separator.
///
/// `\` becomes `\\`, a leading `:` is prefixed with `\`, and every `::`
/// becomes `:\:` (repeated until no `::` remains, so `:::` becomes `:\:\:`).
pub fn escape_host_name(host_name: &str) -> String {
    let mut escaped = host_name.replace('\\', "\\\\");
    if escaped.starts_with(':') {
        escaped.insert(0, '\\');
    }
    while escaped.contains("::") {
        escaped = escaped.replace("::", ":\\:");
    }
    escaped
}

/// Inverse of [`escape_host_name`].
pub fn unescape_host_name(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.peek() {
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                // inserted before a colon by the escape rules
                Some(':') => {}
                _ => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Converts a legacy slash separated rollup (`/a/b/`) into `a::b`.
pub fn convert_legacy_rollup(rollup: &str) -> String {
    rollup
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(ROLLUP_SEPARATOR)
}

/// Get the system hostname
///
/// Tries, in order: `AGENT_HOSTNAME`, `HOSTNAME`, the system host name, and
/// finally `"unknown"`.
#[must_use]
pub fn get_hostname() -> String {
    for var in ["AGENT_HOSTNAME", "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname_osstr) => {
            if let Some(hostname_str) = hostname_osstr.to_str() {
                if !hostname_str.is_empty() {
                    return hostname_str.to_string();
                }
            }
        }
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
        }
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
