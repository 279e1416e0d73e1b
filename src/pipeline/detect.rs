// src/pipeline/detect.rs

//! Refresh of the detection section of the state document

use crate::config::GitConfig;
use crate::error::{Error, Result};
use crate::git::GitRepo;
use crate::notify::RefreshReport;
use crate::state::{DetectionRecord, StateStore};
use crate::version::{DebianVersion, VersionComparator};
use tracing::{debug, info};

/// Highest Debian version among the packaging tags of one upstream version
///
/// Several packaging revisions may share an upstream version, so the exact
/// version is read from `debian/changelog` at each tag.
fn packaged_debian(repo: &GitRepo, tags: &[String]) -> Result<(String, String)> {
    let mut best: Option<(DebianVersion, String, String)> = None;
    for tag in tags {
        let raw = repo.changelog_version(tag)?;
        let version = DebianVersion::parse(&raw)?;
        debug!("Packaging tag {} carries {}", tag, raw);
        if best.as_ref().is_none_or(|(current, _, _)| version > *current) {
            best = Some((version, raw, tag.clone()));
        }
    }
    best.map(|(_, raw, tag)| (raw, tag))
        .ok_or_else(|| Error::NotFound("No packaging tag to read a version from".to_string()))
}

/// Metadata changes between two detections, and newly pending versions
pub fn detection_report(
    previous: Option<&DetectionRecord>,
    current: &DetectionRecord,
) -> RefreshReport {
    let mut report = RefreshReport::default();
    report.push_metadata(
        "Git upstream version",
        previous.map(|p| p.latest_upstream.as_str()),
        &current.latest_upstream,
    );
    if let Some(debian) = &current.packaged_debian {
        report.push_metadata(
            "Git package version",
            previous.and_then(|p| p.packaged_debian.as_deref()),
            debian,
        );
    }
    report.todo = current
        .pending
        .iter()
        .filter(|v| previous.is_none_or(|p| !p.pending.contains(v)))
        .cloned()
        .collect();
    report
}

/// Fetch remotes, compare tags and record the result
pub fn refresh_detection(
    git: &GitConfig,
    store: &mut StateStore,
    fetch: bool,
) -> Result<RefreshReport> {
    let repo = GitRepo::new(&git.work_dir);
    if fetch {
        repo.fetch(&git.packaging_remote)?;
        repo.fetch(&git.upstream_remote)?;
    } else {
        debug!("Skipping git fetch as requested");
    }

    let tags = repo.tags()?;
    let detection = VersionComparator::new(git)?.detect(&tags)?;
    let (debian, tag) = packaged_debian(&repo, &detection.packaged_tags)?;

    let record = DetectionRecord {
        latest_upstream: detection.latest_upstream.to_string(),
        packaged_upstream: detection.packaged.to_string(),
        packaged_debian: Some(debian),
        packaged_tag: Some(tag),
        pending: detection.pending.iter().map(|v| v.to_string()).collect(),
    };
    info!(
        "Latest upstream {}, packaged {}, {} pending",
        record.latest_upstream,
        record.packaged_upstream,
        record.pending.len()
    );

    let report = detection_report(store.detection(), &record);
    store.set_detection(record)?;
    Ok(report)
}
