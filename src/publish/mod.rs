// src/publish/mod.rs

//! Staging of built artifacts into the suite pool, and index refresh
//!
//! Staging only copies files. Regenerating and signing the repository index
//! is a separate operation ([`refresh_index`]) that an operator runs
//! explicitly once the staged packages have been reviewed.

use crate::config::PpaConfig;
use crate::error::{Error, Result};
use crate::notify::{Mark, ReportLine};
use crate::process::{run_checked, run_status, split_command};
use crate::state::ReferenceRecord;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Architecture part of a binary package file name
static DEB_ARCH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_([^_]+)\.deb$").unwrap());

/// Mail address of the first user ID in `gpg --list-packets` output
static USER_ID_MAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^:user ID packet: ".*<(.+?)>"?"#).unwrap());

const SIGNING_KEY_FILE: &str = "signing-key.asc";

/// Result of staging one version
#[derive(Debug, Clone, Default)]
pub struct StagingReport {
    /// One line per debdiff against the reference packages
    pub debdiffs: Vec<ReportLine>,

    /// One line per staged file; a warning marks an overwritten file whose
    /// contents changed
    pub files: Vec<ReportLine>,
}

/// Capability to make built artifacts available in the staging repository
pub trait Publisher {
    /// Copy every artifact into the pool, fails with [`Error::PublishError`]
    fn stage(&self, artifacts: &[PathBuf]) -> Result<StagingReport>;
}

/// Reference packages used to debdiff new builds
#[derive(Debug, Clone)]
pub struct ReferenceDebs {
    pub dir: PathBuf,
    pub record: ReferenceRecord,
}

/// Publisher copying into `<ppa.work_dir>/<ppa.suite>`
pub struct StagingPublisher {
    pool_dir: PathBuf,
    reference: Option<ReferenceDebs>,
}

impl StagingPublisher {
    pub fn new(ppa: &PpaConfig, reference: Option<ReferenceDebs>) -> Self {
        Self {
            pool_dir: ppa.suite_dir(),
            reference,
        }
    }

    /// Debdiff each .deb against the reference package of its architecture
    ///
    /// Problems are warnings: the build itself is not at fault.
    fn debdiff(&self, artifacts: &[PathBuf], lines: &mut Vec<ReportLine>) -> Vec<PathBuf> {
        let Some(reference) = &self.reference else {
            debug!("No reference packages, skipping debdiff");
            return Vec::new();
        };

        let mut produced = Vec::new();
        for deb in artifacts.iter().filter(|p| p.extension().is_some_and(|e| e == "deb")) {
            let name = file_name(deb);
            let Some(arch) = DEB_ARCH.captures(&name).map(|c| c[1].to_string()) else {
                warn!("Cannot tell the architecture of {}", name);
                lines.push(ReportLine::with_detail("debdiff", Mark::Warning, name));
                continue;
            };
            let Some(reference_deb) = reference.record.debs.get(&arch) else {
                debug!("No reference package for {}", arch);
                continue;
            };

            match run_debdiff(&reference.dir.join(reference_deb), deb) {
                Ok(path) => {
                    lines.push(ReportLine::with_detail("debdiff", Mark::Success, arch));
                    produced.push(path);
                }
                Err(e) => {
                    warn!("debdiff for {} failed: {}", name, e);
                    lines.push(ReportLine::with_detail("debdiff", Mark::Warning, arch));
                }
            }
        }
        produced
    }
}

impl Publisher for StagingPublisher {
    fn stage(&self, artifacts: &[PathBuf]) -> Result<StagingReport> {
        let mut report = StagingReport::default();
        let debdiffs = self.debdiff(artifacts, &mut report.debdiffs);

        let mut queue: Vec<&PathBuf> = artifacts.iter().chain(debdiffs.iter()).collect();
        queue.sort_by_key(|p| file_name(p));

        fs::create_dir_all(&self.pool_dir).map_err(|e| {
            Error::PublishError(format!("Failed to create {}: {}", self.pool_dir.display(), e))
        })?;

        for source in queue {
            let name = file_name(source);
            let changed = stage_file(source, &self.pool_dir.join(&name)).map_err(|e| {
                Error::PublishError(format!("Failed to stage {}: {}", name, e))
            })?;
            if changed {
                warn!("{} already staged with different contents, overwritten", name);
                report.files.push(ReportLine::staged(name, Mark::Warning));
            } else {
                report.files.push(ReportLine::staged(name, Mark::Success));
            }
        }

        info!(
            "Staged {} files into {}",
            report.files.len(),
            self.pool_dir.display()
        );
        Ok(report)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Run debdiff and store its output as `<stem>.debdiff.txt` next to the
/// new package; exit codes 0 (identical) and 1 (differences) are fine
fn run_debdiff(reference: &Path, deb: &Path) -> Result<PathBuf> {
    let dir = deb.parent().unwrap_or_else(|| Path::new("."));
    let argv = [
        "debdiff".to_string(),
        reference.display().to_string(),
        deb.display().to_string(),
    ];
    let output = run_status(dir, &argv)?;
    match output.status.code() {
        Some(0) | Some(1) => {}
        code => {
            return Err(Error::CommandFailed(format!(
                "debdiff exited with {:?}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
    }

    let name = file_name(deb);
    let stem = name.strip_suffix(".deb").unwrap_or(&name);
    let path = dir.join(format!("{}.debdiff.txt", stem));
    fs::write(&path, &output.stdout)?;
    Ok(path)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Copy `source` to `dest`; returns whether an existing `dest` had
/// different contents
fn stage_file(source: &Path, dest: &Path) -> Result<bool> {
    let changed = if dest.exists() {
        sha256_file(source)? != sha256_file(dest)?
    } else {
        false
    };

    let tmp = dest.with_extension("partial");
    fs::copy(source, &tmp)?;
    fs::rename(&tmp, dest)?;
    Ok(changed)
}

/// Regenerate, sign and publish the staging repository index
///
/// Old `Packages*` and `Release*` files are removed first so that
/// apt-ftparchive does not index them.
pub fn refresh_index(ppa: &PpaConfig) -> Result<()> {
    let suite_dir = ppa.suite_dir();
    if !suite_dir.is_dir() {
        return Err(Error::NotFound(format!(
            "Suite directory {} does not exist",
            suite_dir.display()
        )));
    }

    for entry in fs::read_dir(&suite_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("Packages") || name.starts_with("Release") {
            debug!("Removing old index {}", name);
            fs::remove_file(entry.path())?;
        }
    }

    let packages = run_checked(&suite_dir, &["apt-ftparchive", "packages", "."])?;
    fs::write(suite_dir.join("Packages"), packages)?;
    run_checked(&suite_dir, &["xz", "-9", "-k", "Packages"])?;
    let release = run_checked(&suite_dir, &["apt-ftparchive", "release", "."])?;
    fs::write(suite_dir.join("Release"), release)?;

    let key = ppa.signing_key.as_str();
    run_checked(
        &suite_dir,
        &[
            "gpg", "--batch", "--yes", "--armor", "--local-user", key, "--detach-sign",
            "--output", "Release.gpg", "Release",
        ],
    )?;
    export_signing_key(&suite_dir, key)?;

    if let Some(wrapper) = &ppa.publish_wrapper {
        info!("Publishing {}", ppa.work_dir.display());
        let argv = split_command(wrapper)?;
        run_checked(&ppa.work_dir, &argv)
            .map_err(|e| Error::PublishError(format!("Publish command failed: {}", e)))?;
    }

    info!("Refreshed index of {}", suite_dir.display());
    Ok(())
}

/// Export the public key, named after the mail address of its first user
/// ID when there is one
fn export_signing_key(suite_dir: &Path, key: &str) -> Result<PathBuf> {
    run_checked(
        suite_dir,
        &[
            "gpg", "--batch", "--yes", "--armor", "--export", "--output", SIGNING_KEY_FILE, key,
        ],
    )?;
    let packets = run_checked(suite_dir, &["gpg", "--list-packets", SIGNING_KEY_FILE])?;

    let exported = suite_dir.join(SIGNING_KEY_FILE);
    match key_file_name(&packets) {
        Some(name) => {
            let target = suite_dir.join(name);
            fs::rename(&exported, &target)?;
            Ok(target)
        }
        None => Ok(exported),
    }
}

fn key_file_name(packets: &str) -> Option<String> {
    packets
        .lines()
        .find_map(|line| USER_ID_MAIL.captures(line))
        .map(|c| format!("{}.asc", &c[1]))
}
