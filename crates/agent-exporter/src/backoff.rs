// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry policies and the exponential backoff tracker used by the connection manager.

use std::time::Duration;

use rand::Rng;

/// First backoff delay for every retried call.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2000);
/// Total wall-clock budget for retried data calls.
pub const DEFAULT_MAX_TOTAL: Duration = Duration::from_secs(30);
/// Per-attempt delay ceiling for handshake calls, which retry forever.
pub const DEFAULT_HANDSHAKE_MAX_DELAY: Duration = Duration::from_secs(15);

/// How a logical call reacts to failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Issued exactly once.
    Once,
    /// Retried with jittered backoff until `max_total` has elapsed.
    Bounded { base: Duration, max_total: Duration },
    /// Retried forever, delay capped at `max_delay`, one free retry on the first failure.
    Handshake { base: Duration, max_delay: Duration },
}

impl RetryPolicy {
    pub fn bounded(max_total: Duration) -> Self {
        RetryPolicy::Bounded {
            base: DEFAULT_BASE_DELAY,
            max_total,
        }
    }

    pub fn handshake() -> Self {
        RetryPolicy::Handshake {
            base: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_HANDSHAKE_MAX_DELAY,
        }
    }

    /// Upper bound on the number of times a `Bounded` call is issued:
    /// `ceil(log2(max_total / base)) + 1`.
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            RetryPolicy::Once => Some(1),
            RetryPolicy::Bounded { base, max_total } => {
                let ratio = max_total.as_secs_f64() / base.as_secs_f64().max(f64::EPSILON);
                if ratio <= 1.0 {
                    return Some(1);
                }
                Some(ratio.log2().ceil() as u32 + 1)
            }
            RetryPolicy::Handshake { .. } => None,
        }
    }
}

/// Configuration parameters for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base: Duration,
    /// Ceiling the doubled delay never exceeds.
    pub cap: Duration,
    /// Apply +/-50% jitter to each delay.
    pub jitter: bool,
}

impl BackoffConfig {
    pub fn for_policy(policy: RetryPolicy) -> Option<Self> {
        match policy {
            RetryPolicy::Once => None,
            RetryPolicy::Bounded { base, max_total } => Some(Self {
                base,
                cap: max_total,
                jitter: true,
            }),
            RetryPolicy::Handshake { base, max_delay } => Some(Self {
                base,
                cap: max_delay,
                jitter: false,
            }),
        }
    }
}

/// Tracks the state of the exponential backoff algorithm for one logical call.
#[derive(Debug, Clone)]
pub struct RetryState {
    config: BackoffConfig,
    failures: u32,
}

impl RetryState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Number of failures registered so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// `min(base * 2^n, cap)` for the failure with zero-based index `n`.
    pub fn nominal_delay(&self, n: u32) -> Duration {
        // 2^20 * base is far beyond any cap in use
        let factor = 1u32 << n.min(20);
        self.config
            .base
            .checked_mul(factor)
            .unwrap_or(self.config.cap)
            .min(self.config.cap)
    }

    /// Registers a failure and returns the delay before the next attempt.
    pub fn register_failure(&mut self) -> Duration {
        let nominal = self.nominal_delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        if self.config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            nominal.mul_f64(factor)
        } else {
            nominal
        }
    }
}
