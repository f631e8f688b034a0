// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector address parsing and resolution.
//!
//! A single configured address is used directly. A comma separated list is
//! resolved target by target, the combined socket addresses are shuffled and
//! then handed out round robin. All targets of a list must share one scheme.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::join_all;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Plaintext,
    Tls,
}

impl Scheme {
    pub fn http(&self) -> &'static str {
        match self {
            Scheme::Plaintext => "http",
            Scheme::Tls => "https",
        }
    }

    pub fn websocket(&self) -> &'static str {
        match self {
            Scheme::Plaintext => "ws",
            Scheme::Tls => "wss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// `host:port`, bracketing IPv6 literals.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parsed, not yet resolved, collector address configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetConfig {
    Single {
        scheme: Scheme,
        target: Target,
        authority: Option<String>,
    },
    Multiple {
        scheme: Scheme,
        targets: Vec<Target>,
    },
}

impl TargetConfig {
    /// Parses `address` without touching the network.
    ///
    /// Mixed plaintext/TLS lists are rejected here so the error surfaces at
    /// startup rather than on the first call.
    pub fn parse(address: &str, authority: Option<&str>) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = address
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        let parsed = parts
            .iter()
            .map(|part| parse_one(part))
            .collect::<Result<Vec<_>, _>>()?;

        let authority = authority
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        match parsed.as_slice() {
            [] => Err(ConfigError::Missing("AGENT_COLLECTOR_ADDRESS")),
            [(scheme, target)] => Ok(TargetConfig::Single {
                scheme: *scheme,
                target: target.clone(),
                authority,
            }),
            [(first_scheme, _), rest @ ..] => {
                if rest.iter().any(|(scheme, _)| scheme != first_scheme) {
                    return Err(ConfigError::MixedSchemes(address.to_string()));
                }
                if authority.is_some() {
                    warn!("collector authority override ignored for a multi-address configuration");
                }
                Ok(TargetConfig::Multiple {
                    scheme: *first_scheme,
                    targets: parsed.into_iter().map(|(_, target)| target).collect(),
                })
            }
        }
    }

    pub fn scheme(&self) -> Scheme {
        match self {
            TargetConfig::Single { scheme, .. } | TargetConfig::Multiple { scheme, .. } => *scheme,
        }
    }
}

fn parse_one(raw: &str) -> Result<(Scheme, Target), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        address: raw.to_string(),
        reason: reason.to_string(),
    };

    let (scheme, rest) = if let Some(rest) = raw.strip_prefix("https://") {
        (Scheme::Tls, rest)
    } else if let Some(rest) = raw.strip_prefix("http://") {
        (Scheme::Plaintext, rest)
    } else if raw.contains("://") {
        return Err(invalid("unsupported scheme"));
    } else {
        (Scheme::Plaintext, raw)
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

    Ok((
        scheme,
        Target {
            host: host.to_string(),
            port,
        },
    ))
}

/// One connectable endpoint.
///
/// `addr` is pinned for multi-address configurations; single addresses are
/// left to the HTTP client's own resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub target: Target,
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTargets {
    pub scheme: Scheme,
    pub authority: Option<String>,
    pub endpoints: Vec<ResolvedEndpoint>,
}

pub struct AddressResolver;

impl AddressResolver {
    /// Resolves every target of a multi-address configuration concurrently,
    /// waits for all of them, and shuffles the combined list.
    pub async fn resolve(config: &TargetConfig) -> Result<ResolvedTargets, ConfigError> {
        match config {
            TargetConfig::Single {
                scheme,
                target,
                authority,
            } => Ok(ResolvedTargets {
                scheme: *scheme,
                authority: authority.clone(),
                endpoints: vec![ResolvedEndpoint {
                    target: target.clone(),
                    addr: None,
                }],
            }),
            TargetConfig::Multiple { scheme, targets } => {
                let lookups = targets.iter().map(|target| async move {
                    let result =
                        tokio::net::lookup_host((target.host.as_str(), target.port)).await;
                    (target, result)
                });

                let mut endpoints = Vec::new();
                for (target, result) in join_all(lookups).await {
                    match result {
                        Ok(addrs) => {
                            let before = endpoints.len();
                            endpoints.extend(addrs.map(|addr| ResolvedEndpoint {
                                target: target.clone(),
                                addr: Some(addr),
                            }));
                            debug!(
                                target = %target.host_port(),
                                count = endpoints.len() - before,
                                "resolved collector target"
                            );
                        }
                        Err(e) => {
                            warn!(target = %target.host_port(), "unable to resolve collector target: {e}");
                        }
                    }
                }

                if endpoints.is_empty() {
                    let names: Vec<String> = targets.iter().map(Target::host_port).collect();
                    return Err(ConfigError::Unresolvable(names.join(",")));
                }
                endpoints.shuffle(&mut rand::thread_rng());

                Ok(ResolvedTargets {
                    scheme: *scheme,
                    authority: None,
                    endpoints,
                })
            }
        }
    }
}

/// Round robin selection over a fixed, non-empty set.
#[derive(Debug)]
pub struct RoundRobin<T> {
    items: Vec<T>,
    next: AtomicUsize,
}

impl<T> RoundRobin<T> {
    /// Returns `None` for an empty set.
    pub fn new(items: Vec<T>) -> Option<Self> {
        if items.is_empty() {
            return None;
        }
        Some(Self {
            items,
            next: AtomicUsize::new(0),
        })
    }

    pub fn pick(&self) -> &T {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.items.len();
        &self.items[index]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
