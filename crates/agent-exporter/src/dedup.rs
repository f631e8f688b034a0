// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Full-versus-truncated representation of large shared query texts.
//!
//! The cache only remembers content hashes the collector accepted within the
//! TTL window. A miss always sends the full text; a stale entry costs a
//! resend, never a truncated-only payload the collector cannot expand.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use collector_proto::SharedQueryText;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Characters kept at each truncated end.
pub const TRUNCATED_LENGTH: usize = 120;
pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Which ends of a long text survive truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    /// Aggregate query texts.
    Head,
    /// Trace query texts.
    HeadAndTail,
}

impl Truncation {
    /// Texts longer than this many characters are hashed.
    pub fn threshold(self) -> usize {
        match self {
            Truncation::Head => TRUNCATED_LENGTH,
            Truncation::HeadAndTail => 2 * TRUNCATED_LENGTH,
        }
    }
}

/// A text ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedText {
    pub message: SharedQueryText,
    /// Hash to mark as seen once the enclosing call succeeds.
    pub pending_hash: Option<String>,
}

pub struct PayloadDedupCache {
    seen: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl Default for PayloadDedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl PayloadDedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn prepare(&self, text: &str, truncation: Truncation) -> PreparedText {
        if text.chars().count() <= truncation.threshold() {
            return PreparedText {
                message: SharedQueryText {
                    full_text: Some(text.to_string()),
                    ..Default::default()
                },
                pending_hash: None,
            };
        }

        let sha = content_hash(text);
        if self.contains(&sha) {
            let truncated_end_text = match truncation {
                Truncation::Head => None,
                Truncation::HeadAndTail => Some(tail(text, TRUNCATED_LENGTH).to_string()),
            };
            PreparedText {
                message: SharedQueryText {
                    full_text: None,
                    truncated_text: Some(head(text, TRUNCATED_LENGTH).to_string()),
                    truncated_end_text,
                    full_text_sha: Some(sha),
                },
                pending_hash: None,
            }
        } else {
            PreparedText {
                message: SharedQueryText {
                    full_text: Some(text.to_string()),
                    ..Default::default()
                },
                pending_hash: Some(sha),
            }
        }
    }

    /// True when `hash` was marked within the TTL window.
    pub fn contains(&self, hash: &str) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match seen.get(hash) {
            Some(marked_at) if marked_at.elapsed() < self.ttl => true,
            Some(_) => {
                seen.pop(hash);
                false
            }
            None => false,
        }
    }

    pub fn mark_seen<I>(&self, hashes: I)
    where
        I: IntoIterator<Item = String>,
    {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for hash in hashes {
            seen.put(hash, now);
        }
    }

    pub fn len(&self) -> usize {
        match self.seen.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hex SHA-256 of the text's UTF-8 bytes.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn head(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn tail(text: &str, chars: usize) -> &str {
    let total = text.chars().count();
    if total <= chars {
        return text;
    }
    match text.char_indices().nth(total - chars) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// Assigns stream-wide indexes to shared texts within one outgoing stream.
///
/// A text repeated inside a stream is framed once; hashes of full texts are
/// collected so the caller can mark them after the stream is accepted.
pub struct SharedTextIndex<'a> {
    cache: &'a PayloadDedupCache,
    truncation: Truncation,
    indexes: HashMap<String, u32>,
    pending: Vec<String>,
}

impl<'a> SharedTextIndex<'a> {
    pub fn new(cache: &'a PayloadDedupCache, truncation: Truncation) -> Self {
        Self {
            cache,
            truncation,
            indexes: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Returns the index of `text` and, the first time it appears in this
    /// stream, the frame that must precede any reference to it.
    pub fn index_of(&mut self, text: &str) -> (u32, Option<SharedQueryText>) {
        if let Some(index) = self.indexes.get(text) {
            return (*index, None);
        }
        let index = self.indexes.len() as u32;
        self.indexes.insert(text.to_string(), index);
        let prepared = self.cache.prepare(text, self.truncation);
        if let Some(hash) = prepared.pending_hash {
            self.pending.push(hash);
        }
        (index, Some(prepared.message))
    }

    pub fn count(&self) -> u32 {
        self.indexes.len() as u32
    }

    pub fn into_pending_hashes(self) -> Vec<String> {
        self.pending
    }
}
