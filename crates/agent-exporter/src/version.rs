// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// `major.minor.patch` read from the leading digits of a version string.
/// Anything after the patch number (`-SNAPSHOT`, build metadata) is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

fn version_regex() -> Option<&'static Regex> {
    static VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    VERSION
        .get_or_init(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)").ok())
        .as_ref()
}

impl SemanticVersion {
    pub fn parse(version: &str) -> Option<Self> {
        let captures = version_regex()?.captures(version.trim())?;
        let part = |i: usize| captures.get(i)?.as_str().parse::<u64>().ok();
        Some(Self {
            major: part(1)?,
            minor: part(2)?,
            patch: part(3)?,
        })
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Result of comparing the agent version to the collector version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    AgentNewer,
    Compatible,
    /// One side did not parse; treated as not newer.
    Unparsable,
}

pub fn compare_versions(agent: &str, collector: &str) -> VersionCheck {
    match (SemanticVersion::parse(agent), SemanticVersion::parse(collector)) {
        (Some(agent), Some(collector)) => match agent.cmp(&collector) {
            Ordering::Greater => VersionCheck::AgentNewer,
            _ => VersionCheck::Compatible,
        },
        _ => VersionCheck::Unparsable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_leading_digits() {
        assert_eq!(
            SemanticVersion::parse("0.14.2-SNAPSHOT"),
            Some(SemanticVersion {
                major: 0,
                minor: 14,
                patch: 2
            })
        );
        assert_eq!(SemanticVersion::parse("v1.2.3"), None);
        assert_eq!(SemanticVersion::parse("1.2"), None);
        assert_eq!(SemanticVersion::parse(""), None);
    }

    #[test]
    fn numeric_not_lexical_ordering() {
        assert_eq!(compare_versions("0.10.0", "0.9.9"), VersionCheck::AgentNewer);
        assert_eq!(compare_versions("0.9.9", "0.10.0"), VersionCheck::Compatible);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), VersionCheck::Compatible);
    }

    #[test]
    fn unparsable_is_not_newer() {
        assert_eq!(compare_versions("dev", "0.1.0"), VersionCheck::Unparsable);
        assert_eq!(compare_versions("1.0.0", ""), VersionCheck::Unparsable);
    }
}
