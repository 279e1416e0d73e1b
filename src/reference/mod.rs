// src/reference/mod.rs

//! Reference packages from the reviewed distribution channel
//!
//! The reference repository carries the packages that went through human
//! review. Its newest version must match the packaged version found in git,
//! and its `.deb` files serve as the baseline for debdiffs of new builds.

use crate::config::ReferenceConfig;
use crate::deb822::{Stanza, parse_stanzas};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::publish::sha256_file;
use crate::state::{DetectionRecord, ReferenceRecord};
use crate::version::DebianVersion;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Newest stanza of `package` for each architecture, and their common version
pub fn select_reference(
    content: &str,
    package: &str,
    architectures: &[String],
) -> Result<(String, BTreeMap<String, Stanza>)> {
    let mut best: BTreeMap<String, (DebianVersion, Stanza)> = BTreeMap::new();
    for stanza in parse_stanzas(content)? {
        if stanza.get("Package") != Some(package) {
            continue;
        }
        let arch = stanza.require("Architecture")?.to_string();
        if !architectures.contains(&arch) {
            continue;
        }
        let version = DebianVersion::parse(stanza.require("Version")?)?;
        if best.get(&arch).is_none_or(|(current, _)| version > *current) {
            best.insert(arch, (version, stanza));
        }
    }

    for arch in architectures {
        if !best.contains_key(arch) {
            return Err(Error::NotFound(format!(
                "No {} package for {} in the reference repository",
                package, arch
            )));
        }
    }

    let versions: BTreeSet<&str> = best
        .values()
        .filter_map(|(_, s)| s.get("Version"))
        .collect();
    if versions.len() != 1 {
        return Err(Error::ParseError(format!(
            "Reference repository has mixed {} versions: {:?}",
            package, versions
        )));
    }
    let version = versions.into_iter().next().unwrap_or_default().to_string();
    let stanzas = best.into_iter().map(|(arch, (_, s))| (arch, s)).collect();
    Ok((version, stanzas))
}

/// Whether `path` exists with the expected size and SHA-256
pub fn matches_metadata(path: &Path, size: u64, sha256: &str) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    if fs::metadata(path)?.len() != size {
        return Ok(false);
    }
    Ok(sha256_file(path)?.eq_ignore_ascii_case(sha256))
}

fn ensure_download(
    client: &HttpClient,
    url: &str,
    path: &Path,
    size: u64,
    sha256: &str,
) -> Result<()> {
    if matches_metadata(path, size, sha256)? {
        debug!("{} is up to date", path.display());
        return Ok(());
    }

    client.download_file(url, path)?;
    if !matches_metadata(path, size, sha256)? {
        return Err(Error::DownloadError(format!(
            "Size or SHA-256 mismatch for {}",
            path.display()
        )));
    }
    Ok(())
}

/// Download the reference index and packages for every build architecture
pub fn refresh_reference(
    config: &ReferenceConfig,
    architectures: &[String],
    client: &HttpClient,
) -> Result<ReferenceRecord> {
    let base = config.url.trim_end_matches('/');
    fs::create_dir_all(&config.work_dir)?;

    let content = client.fetch_text(&format!("{}/Packages", base))?;
    fs::write(config.work_dir.join("Packages"), &content)?;

    let (version, stanzas) = select_reference(&content, &config.package, architectures)?;
    let mut debs = BTreeMap::new();
    for (arch, stanza) in stanzas {
        let filename = stanza.require("Filename")?;
        let size = stanza.require("Size")?.parse::<u64>().map_err(|e| {
            Error::ParseError(format!("Invalid Size for {}: {}", filename, e))
        })?;
        let sha256 = stanza.require("SHA256")?;

        ensure_download(
            client,
            &format!("{}/{}", base, filename),
            &config.work_dir.join(filename),
            size,
            sha256,
        )?;
        debs.insert(arch, filename.to_string());
    }

    info!("Reference {} is at {}", config.package, version);
    Ok(ReferenceRecord { version, debs })
}

/// Packaged version in git and reference version must agree before building
pub fn check_consistency(
    detection: Option<&DetectionRecord>,
    reference: Option<&ReferenceRecord>,
) -> Result<()> {
    let packaged = detection
        .and_then(|d| d.packaged_debian.as_deref())
        .ok_or_else(|| Error::ConfigError("No packaged version known, run detect".to_string()))?;
    let reference = reference.ok_or_else(|| {
        Error::ConfigError("No reference version known, run refresh-reference".to_string())
    })?;

    if packaged != reference.version {
        return Err(Error::ConfigError(format!(
            "Inconsistent versions: {} (git) vs. {} (reference)",
            packaged, reference.version
        )));
    }
    Ok(())
}
