// src/config/mod.rs

//! Configuration for the packaging pipeline and drift monitor
//!
//! The configuration is a single TOML document. Relative paths are resolved
//! against the directory holding the configuration file, and a leading `~`
//! is expanded to the home directory.
//!
//! # Example autodeb.toml
//!
//! ```toml
//! [git]
//! work_dir = "~/src/frida"
//! upstream_remote = "upstream"
//! upstream_tags = '^\d+\.\d+\.\d+$'
//! packaging_remote = "origin"
//! packaging_branch = "debian/bookworm"
//! packaging_tags = '^debian/(\d+\.\d+\.\d+)_pirogue\d+$'
//! auto_branch = "auto/debian/bookworm"
//! auto_tag_format = "auto/debian/%(version)s"
//! version_suffix = "~pirogue1"
//!
//! [[builds]]
//! arch = "amd64"
//!
//! [[builds]]
//! arch = "arm64"
//! wrapper = "qemu-sbuild-wrapper"
//! timeout = "12h"
//!
//! [ppa]
//! work_dir = "~/ppa"
//! suite = "bookworm"
//! signing_key = "ABCDEF0123456789"
//! publish_url = "https://example.org/ppa/"
//! publish_wrapper = "rsync -a . host:/srv/ppa/"
//!
//! [discord]
//! webhook_url_file = "~/.config/autodeb/webhook"
//! ```

mod duration;

pub use duration::{parse_duration, parse_interval};

use crate::build::ExecutionContext;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file name, looked up in the current directory
pub const DEFAULT_CONFIG_PATH: &str = "autodeb.toml";

/// Placeholder that the automated tag format must contain
pub const VERSION_PLACEHOLDER: &str = "%(version)s";

/// Timeout for builds running directly on the host
pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

/// Timeout for builds running in an isolated/emulated context
pub const DEFAULT_ISOLATED_TIMEOUT: Duration = Duration::from_secs(12 * 3600);

/// Package index names a monitored repository may publish
const SUPPORTED_INDICES: &[&str] = &["Packages", "Packages.gz", "Packages.xz"];

/// Complete configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub git: GitConfig,

    /// Ordered build list, order defines the architecture gating sequence
    pub builds: Vec<BuildConfig>,

    pub ppa: PpaConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub discord: Option<DiscordConfig>,

    #[serde(default)]
    pub reference: Option<ReferenceConfig>,

    #[serde(default)]
    pub state: StateConfig,
}

/// Git repositories, tags and refs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Packaging working tree (shared, exclusively locked during runs)
    pub work_dir: PathBuf,

    /// Remote carrying upstream release tags
    pub upstream_remote: String,

    /// Pattern selecting upstream release tags
    pub upstream_tags: String,

    /// Remote carrying the packaging branch and tags
    pub packaging_remote: String,

    /// Human-curated packaging branch
    pub packaging_branch: String,

    /// Pattern selecting packaging release tags; group 1, when present,
    /// captures the upstream version
    pub packaging_tags: String,

    /// Branch advanced by the pipeline
    pub auto_branch: String,

    /// Automated tag format, e.g. `auto/debian/%(version)s`
    pub auto_tag_format: String,

    /// Suffix appended to upstream versions to form packaging versions
    pub version_suffix: String,

    /// Key used to sign automated tags
    #[serde(default)]
    pub signing_key: Option<String>,
}

/// One entry of the ordered build list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub arch: String,

    /// Wrapper command for an isolated context; absent means direct execution
    #[serde(default)]
    pub wrapper: Option<String>,

    /// Wall-clock timeout (`45m`, `2h`, `1d`)
    #[serde(default)]
    pub timeout: Option<String>,
}

impl BuildConfig {
    pub fn execution_context(&self) -> ExecutionContext {
        match &self.wrapper {
            Some(wrapper) => ExecutionContext::Isolated {
                wrapper: wrapper.clone(),
            },
            None => ExecutionContext::Direct,
        }
    }

    /// Effective timeout for this architecture
    pub fn timeout(&self) -> Result<Duration> {
        match &self.timeout {
            Some(value) => parse_duration(value),
            None if self.wrapper.is_some() => Ok(DEFAULT_ISOLATED_TIMEOUT),
            None => Ok(DEFAULT_DIRECT_TIMEOUT),
        }
    }
}

/// Staging repository and publication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpaConfig {
    pub work_dir: PathBuf,
    pub suite: String,
    pub signing_key: String,

    /// Public base URL, used for download links in notifications
    pub publish_url: String,

    /// Command run from `work_dir` after the index is refreshed
    #[serde(default)]
    pub publish_wrapper: Option<String>,
}

impl PpaConfig {
    /// Pool directory receiving staged artifacts
    pub fn suite_dir(&self) -> PathBuf {
        self.work_dir.join(&self.suite)
    }

    /// Public URL of the suite directory, without a trailing slash
    pub fn suite_url(&self) -> String {
        format!("{}/{}", self.publish_url.trim_end_matches('/'), self.suite)
    }

    /// Download link for a staged file
    pub fn file_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.suite_url(), file_name)
    }
}

/// External repositories watched for drift
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_dir")]
    pub work_dir: PathBuf,

    #[serde(default)]
    pub repos: Vec<MonitoredRepo>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            work_dir: default_monitoring_dir(),
            repos: Vec::new(),
        }
    }
}

fn default_monitoring_dir() -> PathBuf {
    PathBuf::from("monitoring")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredRepo {
    pub name: String,
    pub url: String,
    pub architectures: Vec<String>,
    pub components: Vec<String>,
    pub suites: Vec<String>,

    #[serde(default = "default_packages_index")]
    pub packages_index: String,

    /// Tracked package names
    pub packages: Vec<String>,
}

fn default_packages_index() -> String {
    "Packages".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// File holding the webhook URL, kept out of the configuration itself
    pub webhook_url_file: PathBuf,
}

/// Reference repository used to cross-check and debdiff builds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub url: String,
    pub work_dir: PathBuf,

    /// Binary package name looked up in the reference index
    pub package: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state.json")
}

impl StateConfig {
    /// Audit journal stored next to the state document
    pub fn journal_path(&self) -> PathBuf {
        self.path.with_extension("journal")
    }

    /// Lock file guarding the packaging working tree
    pub fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Build logs, next to the state document
    pub fn log_dir(&self) -> PathBuf {
        self.path.with_file_name("logs")
    }
}

impl Config {
    /// Load, resolve paths and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut config = Self::parse(&content)?;
        config.resolve_paths(base_dir);
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse a configuration document without touching paths
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &Path| resolve_path(base_dir, p);

        self.git.work_dir = resolve(&self.git.work_dir);
        self.ppa.work_dir = resolve(&self.ppa.work_dir);
        self.monitoring.work_dir = resolve(&self.monitoring.work_dir);
        self.state.path = resolve(&self.state.path);
        if let Some(discord) = self.discord.as_mut() {
            discord.webhook_url_file = resolve(&discord.webhook_url_file);
        }
        if let Some(reference) = self.reference.as_mut() {
            reference.work_dir = resolve(&reference.work_dir);
        }
    }

    /// Fail fast on malformed or contradictory settings
    pub fn validate(&self) -> Result<()> {
        Regex::new(&self.git.upstream_tags)?;
        Regex::new(&self.git.packaging_tags)?;

        if !self.git.auto_tag_format.contains(VERSION_PLACEHOLDER) {
            return Err(Error::ConfigError(format!(
                "git.auto_tag_format '{}' must contain {}",
                self.git.auto_tag_format, VERSION_PLACEHOLDER
            )));
        }
        if self.git.auto_branch == self.git.packaging_branch {
            return Err(Error::ConfigError(format!(
                "git.auto_branch must differ from git.packaging_branch ({})",
                self.git.packaging_branch
            )));
        }

        if self.builds.is_empty() {
            return Err(Error::ConfigError(
                "At least one [[builds]] entry is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for build in &self.builds {
            if build.arch.trim().is_empty() {
                return Err(Error::ConfigError("Empty build architecture".to_string()));
            }
            if !seen.insert(build.arch.as_str()) {
                return Err(Error::ConfigError(format!(
                    "Architecture {} is listed more than once in [[builds]]",
                    build.arch
                )));
            }
            let timeout = build.timeout()?;
            if timeout.is_zero() {
                return Err(Error::ConfigError(format!(
                    "Build timeout for {} must be positive",
                    build.arch
                )));
            }
        }

        if self.ppa.suite.trim().is_empty() {
            return Err(Error::ConfigError("ppa.suite must not be empty".to_string()));
        }

        for repo in &self.monitoring.repos {
            if !SUPPORTED_INDICES.contains(&repo.packages_index.as_str()) {
                return Err(Error::ConfigError(format!(
                    "Unsupported packages_index '{}' for {} (expected one of {:?})",
                    repo.packages_index, repo.name, SUPPORTED_INDICES
                )));
            }
            if repo.suites.is_empty()
                || repo.components.is_empty()
                || repo.architectures.is_empty()
                || repo.packages.is_empty()
            {
                return Err(Error::ConfigError(format!(
                    "Monitored repository {} needs suites, components, architectures and packages",
                    repo.name
                )));
            }
        }

        Ok(())
    }

    /// Architectures in gating order
    pub fn architectures(&self) -> Vec<String> {
        self.builds.iter().map(|b| b.arch.clone()).collect()
    }

    /// Packaging version for an upstream version
    pub fn full_version(&self, upstream: &str) -> String {
        format!("{}{}", upstream, self.git.version_suffix)
    }
}

/// Expand `~` and anchor relative paths at `base_dir`
pub fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    let home = dirs::home_dir();
    match (s, home) {
        ("~", Some(home)) => home,
        (s, Some(home)) if s.starts_with("~/") => home.join(&s[2..]),
        _ => path.to_path_buf(),
    }
}
