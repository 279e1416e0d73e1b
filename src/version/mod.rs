// src/version/mod.rs

//! Version handling for upstream releases and Debian packages
//!
//! Upstream releases are ordered with dotted-numeric semantics: each
//! dot-separated component is compared as an integer, so `16.4.10` sorts
//! after `16.4.9`. Missing trailing components count as zero.
//!
//! Debian package versions use dpkg ordering, see [`DebianVersion`].

mod comparator;
mod debian;

pub use comparator::{Detection, VersionComparator};
pub use debian::DebianVersion;

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// An upstream release identifier drawn from a version-control tag
#[derive(Debug, Clone)]
pub struct UpstreamVersion {
    raw: String,
    components: Vec<u64>,
}

impl UpstreamVersion {
    /// Parse a dotted-numeric version, with an optional leading `v`
    ///
    /// Examples:
    /// - "16.4.8" → [16, 4, 8]
    /// - "v1.2" → [1, 2]
    pub fn parse(s: &str) -> Result<Self> {
        let raw = s.trim();
        let digits = raw.strip_prefix('v').unwrap_or(raw);
        if digits.is_empty() {
            return Err(Error::ParseError(format!("Empty version '{}'", s)));
        }

        let components = digits
            .split('.')
            .map(|part| {
                part.parse::<u64>().map_err(|_| {
                    Error::ParseError(format!(
                        "Version '{}' has non-numeric component '{}'",
                        s, part
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw: raw.to_string(),
            components,
        })
    }

    /// The version exactly as it appeared in the tag
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Components without trailing zeros, the canonical form for equality
    fn significant(&self) -> &[u64] {
        let end = self
            .components
            .iter()
            .rposition(|&c| c != 0)
            .map_or(0, |i| i + 1);
        &self.components[..end]
    }
}

impl Ord for UpstreamVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for UpstreamVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for UpstreamVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for UpstreamVersion {}

impl Hash for UpstreamVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl fmt::Display for UpstreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for UpstreamVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for UpstreamVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for UpstreamVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Mangle a Debian version the way git-buildpackage does for tag names
///
/// `~` becomes `_` and `:` becomes `%`.
pub fn mangle_for_tag(version: &str) -> String {
    version.replace('~', "_").replace(':', "%")
}

/// Expand an automated tag format such as `auto/debian/%(version)s`
pub fn format_tag(format: &str, full_version: &str) -> String {
    format.replace(
        crate::config::VERSION_PLACEHOLDER,
        &mangle_for_tag(full_version),
    )
}
