// src/version/comparator.rs

//! Determine which upstream releases are not packaged yet

use super::{UpstreamVersion, mangle_for_tag};
use crate::config::GitConfig;
use crate::error::{Error, Result};
use regex::Regex;
use tracing::{debug, warn};

/// Result of comparing upstream tags against packaging tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Highest upstream release
    pub latest_upstream: UpstreamVersion,

    /// Highest upstream version with a packaging tag
    pub packaged: UpstreamVersion,

    /// Packaging tags carrying `packaged` (several revisions may exist)
    pub packaged_tags: Vec<String>,

    /// Upstream versions strictly newer than `packaged`, oldest first
    pub pending: Vec<UpstreamVersion>,
}

/// Orders and filters upstream and packaging tags
pub struct VersionComparator {
    upstream_pattern: Regex,
    packaging_pattern: Regex,
    suffix: String,
}

impl VersionComparator {
    pub fn new(git: &GitConfig) -> Result<Self> {
        Ok(Self {
            upstream_pattern: Regex::new(&git.upstream_tags)?,
            packaging_pattern: Regex::new(&git.packaging_tags)?,
            suffix: git.version_suffix.clone(),
        })
    }

    /// Upstream release tags, sorted ascending
    pub fn upstream_versions(&self, tags: &[String]) -> Result<Vec<UpstreamVersion>> {
        let mut versions = Vec::new();
        for tag in tags.iter().filter(|t| self.upstream_pattern.is_match(t)) {
            let version = UpstreamVersion::parse(tag).map_err(|e| {
                Error::ConfigError(format!(
                    "Upstream tag pattern matched '{}', which is not a dotted-numeric version: {}",
                    tag, e
                ))
            })?;
            versions.push(version);
        }

        if versions.is_empty() {
            return Err(Error::ConfigError(format!(
                "Upstream tag pattern '{}' matched no tags",
                self.upstream_pattern.as_str()
            )));
        }

        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    /// Upstream version carried by a packaging tag, if the tag matches
    ///
    /// Group 1 of the pattern captures the version when present, otherwise
    /// the whole tag is used; the configured suffix is then stripped, in
    /// either its raw or its tag-mangled form.
    pub fn packaged_version(&self, tag: &str) -> Option<Result<UpstreamVersion>> {
        let captures = self.packaging_pattern.captures(tag)?;
        let captured = captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str())
            .unwrap_or(tag);
        let captured = captured.rsplit('/').next().unwrap_or(captured);

        let mangled = mangle_for_tag(&self.suffix);
        let stripped = if !self.suffix.is_empty() && captured.ends_with(&self.suffix) {
            &captured[..captured.len() - self.suffix.len()]
        } else if !mangled.is_empty() && captured.ends_with(&mangled) {
            &captured[..captured.len() - mangled.len()]
        } else {
            captured
                .split(['~', '_', '-', '+'])
                .next()
                .unwrap_or(captured)
        };

        Some(UpstreamVersion::parse(stripped).map_err(|e| {
            Error::ConfigError(format!(
                "Packaging tag '{}' does not carry a dotted-numeric version: {}",
                tag, e
            ))
        }))
    }

    /// Compute pending upstream versions from the full tag list
    pub fn detect(&self, tags: &[String]) -> Result<Detection> {
        let upstream = self.upstream_versions(tags)?;

        let mut packaged: Vec<(UpstreamVersion, &String)> = Vec::new();
        for tag in tags {
            if let Some(version) = self.packaged_version(tag) {
                packaged.push((version?, tag));
            }
        }
        let Some(latest_packaged) = packaged.iter().map(|(v, _)| v).max().cloned() else {
            return Err(Error::ConfigError(format!(
                "Packaging tag pattern '{}' matched no tags",
                self.packaging_pattern.as_str()
            )));
        };

        let mut packaged_tags: Vec<String> = packaged
            .iter()
            .filter(|(v, _)| *v == latest_packaged)
            .map(|(_, t)| (*t).clone())
            .collect();
        packaged_tags.sort();

        let pending: Vec<UpstreamVersion> = upstream
            .iter()
            .filter(|v| **v > latest_packaged)
            .cloned()
            .collect();

        let latest_upstream = upstream
            .last()
            .cloned()
            .ok_or_else(|| Error::ConfigError("No upstream versions".to_string()))?;

        if latest_upstream < latest_packaged {
            warn!(
                "Packaged version {} is newer than the latest upstream release {}",
                latest_packaged, latest_upstream
            );
        }
        debug!(
            "Latest upstream {}, latest packaged {}, {} pending",
            latest_upstream,
            latest_packaged,
            pending.len()
        );

        Ok(Detection {
            latest_upstream,
            packaged: latest_packaged,
            packaged_tags,
            pending,
        })
    }
}
