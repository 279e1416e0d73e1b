// src/state/mod.rs

//! Durable per-version packaging state
//!
//! The state document is the single source of truth for pipeline progress.
//! It is only changed through [`StateStore`], which applies one change at a
//! time: the new document is written to a temporary file, fsynced and renamed
//! over the old one, so a crash leaves either the old or the new document,
//! never a mix. Each applied change is then appended to the audit journal.
//!
//! # Status flow
//!
//! ```text
//! pending → preparing → building(arch₀) → … → building(archₙ) → built → published
//!              │                 │
//!              └──────→ failed ←─┘
//! ```
//!
//! Only a rewind (or a retry, which is a rewind or a reset to `pending`) moves
//! a version backwards.

mod journal;

pub use journal::{AuditJournal, AuditRecord};

use crate::build::ExecutionContext;
use crate::config::StateConfig;
use crate::error::{Error, Result};
use crate::version::UpstreamVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Pipeline status of one upstream version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Preparing,
    Building,
    Built,
    Failed,
    Published,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Preparing => "preparing",
            Status::Building => "building",
            Status::Built => "built",
            Status::Failed => "failed",
            Status::Published => "published",
        };
        write!(f, "{}", s)
    }
}

/// Result of one architecture build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    NotAttempted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::NotAttempted => "not_attempted",
        };
        write!(f, "{}", s)
    }
}

/// Marker left on an attempt reset by an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindMark {
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
    pub previous_outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAttempt {
    pub arch: String,
    pub execution_context: ExecutionContext,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,

    /// Commit the build ran on
    #[serde(default)]
    pub commit: Option<String>,

    /// Produced files: .deb packages and the build log
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,

    /// Failure reason, or "cancelled"/"timed out"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Set when the attempt was reset to not_attempted by a rewind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewound: Option<RewindMark>,
}

impl BuildAttempt {
    pub fn success(
        arch: &str,
        execution_context: ExecutionContext,
        commit: &str,
        artifacts: Vec<PathBuf>,
    ) -> Self {
        Self {
            arch: arch.to_string(),
            execution_context,
            outcome: Outcome::Success,
            timestamp: Utc::now(),
            commit: Some(commit.to_string()),
            artifacts,
            detail: None,
            rewound: None,
        }
    }

    pub fn failure(
        arch: &str,
        execution_context: ExecutionContext,
        commit: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            arch: arch.to_string(),
            execution_context,
            outcome: Outcome::Failure,
            timestamp: Utc::now(),
            commit: Some(commit.to_string()),
            artifacts: Vec::new(),
            detail: Some(detail.into()),
            rewound: None,
        }
    }
}

/// Automated branch and tag created by preparation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRefs {
    pub branch: String,
    pub tag: String,
    pub commit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreparationFailure {
    MergeConflict,
    PatchFailure,
    Other,
}

impl PreparationFailure {
    /// Classify an error raised while preparing
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::MergeConflict { .. } => Self::MergeConflict,
            Error::PatchFailure { .. } => Self::PatchFailure,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for PreparationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PreparationFailure::MergeConflict => "merge conflict",
            PreparationFailure::PatchFailure => "patch failure",
            PreparationFailure::Other => "preparation error",
        };
        write!(f, "{}", s)
    }
}

/// Where a failed version stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FailureStage {
    Preparing { kind: PreparationFailure },
    Building { arch: String },
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Preparing { kind } => write!(f, "preparing ({})", kind),
            FailureStage::Building { arch } => write!(f, "building({})", arch),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(flatten)]
    pub stage: FailureStage,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Progress record of one upstream version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagingState {
    pub status: Status,

    /// One slot per architecture reached, in gating order
    #[serde(default)]
    pub attempts: Vec<BuildAttempt>,

    /// Attempts replaced after a rewind, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded: Vec<BuildAttempt>,

    #[serde(default)]
    pub auto_ref: Option<AutoRefs>,

    #[serde(default)]
    pub failure: Option<Failure>,

    pub updated_at: DateTime<Utc>,
}

impl PackagingState {
    fn new() -> Self {
        Self {
            status: Status::Pending,
            attempts: Vec::new(),
            superseded: Vec::new(),
            auto_ref: None,
            failure: None,
            updated_at: Utc::now(),
        }
    }

    /// Index of the next architecture to build: the first slot that is not
    /// a success
    pub fn next_build_index(&self) -> usize {
        self.attempts
            .iter()
            .position(|a| a.outcome != Outcome::Success)
            .unwrap_or(self.attempts.len())
    }

    pub fn attempt(&self, arch: &str) -> Option<&BuildAttempt> {
        self.attempts.iter().find(|a| a.arch == arch)
    }

    /// Artifacts of every successful attempt, in architecture order
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.attempts
            .iter()
            .filter(|a| a.outcome == Outcome::Success)
            .flat_map(|a| a.artifacts.iter().cloned())
            .collect()
    }
}

/// One pipeline event applied through [`StateStore::transition`]
#[derive(Debug, Clone)]
pub enum Event {
    Detected,
    PreparationStarted,
    Prepared(AutoRefs),
    PreparationFailed {
        kind: PreparationFailure,
        detail: String,
    },
    /// The automated branch was moved out of band since the last run
    RefMoved {
        commit: String,
    },
    BuildRecorded(BuildAttempt),
    Published,
}

impl Event {
    fn describe(&self) -> String {
        match self {
            Event::Detected => "detected".to_string(),
            Event::PreparationStarted => "preparation started".to_string(),
            Event::Prepared(refs) => format!("prepared {} at {}", refs.tag, refs.commit),
            Event::PreparationFailed { kind, .. } => format!("preparation failed: {}", kind),
            Event::RefMoved { commit } => format!("automated ref moved to {}", commit),
            Event::BuildRecorded(attempt) => {
                format!("build {} for {}", attempt.outcome, attempt.arch)
            }
            Event::Published => "published".to_string(),
        }
    }
}

/// Last detection results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub latest_upstream: String,
    pub packaged_upstream: String,
    #[serde(default)]
    pub packaged_debian: Option<String>,
    #[serde(default)]
    pub packaged_tag: Option<String>,
    #[serde(default)]
    pub pending: Vec<String>,
}

/// Reference packages downloaded for cross-checking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub version: String,
    /// Architecture → file name inside `reference.work_dir`
    pub debs: BTreeMap<String, String>,
}

/// On-disk state document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub versions: BTreeMap<String, PackagingState>,

    #[serde(default)]
    pub detection: Option<DetectionRecord>,

    #[serde(default)]
    pub reference: Option<ReferenceRecord>,
}

/// Owner of the state document
pub struct StateStore {
    path: PathBuf,
    journal: AuditJournal,
    architectures: Vec<String>,
    doc: StateDocument,
}

impl StateStore {
    /// Open the store; a missing document is an empty one
    pub fn open(config: &StateConfig, architectures: Vec<String>) -> Result<Self> {
        let doc = Self::load(&config.path)?;
        let journal = AuditJournal::open(&config.journal_path())?;
        debug!(
            "Opened state at {} ({} versions)",
            config.path.display(),
            doc.versions.len()
        );
        Ok(Self {
            path: config.path.clone(),
            journal,
            architectures,
            doc,
        })
    }

    /// Read a state document without opening the journal
    pub fn load(path: &Path) -> Result<StateDocument> {
        if !path.exists() {
            return Ok(StateDocument::default());
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::StateError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &StateDocument {
        &self.doc
    }

    pub fn read(&self, version: &UpstreamVersion) -> Option<&PackagingState> {
        self.doc.versions.get(version.as_str())
    }

    /// Versions with a record, ascending
    pub fn versions(&self) -> Vec<UpstreamVersion> {
        let mut versions: Vec<UpstreamVersion> = self
            .doc
            .versions
            .keys()
            .filter_map(|v| UpstreamVersion::parse(v).ok())
            .collect();
        versions.sort();
        versions
    }

    pub fn detection(&self) -> Option<&DetectionRecord> {
        self.doc.detection.as_ref()
    }

    pub fn reference(&self) -> Option<&ReferenceRecord> {
        self.doc.reference.as_ref()
    }

    /// Apply one event to a version
    pub fn transition(&mut self, version: &UpstreamVersion, event: Event) -> Result<PackagingState> {
        let key = version.as_str().to_string();
        let current = self.doc.versions.get(&key);
        let from = current.map(|s| s.status);
        let describe = event.describe();

        let next = apply(current, event, &self.architectures, version)?;
        let mut doc = self.doc.clone();
        doc.versions.insert(key.clone(), next.clone());

        self.commit(
            doc,
            AuditRecord::Transition {
                version: key,
                from,
                to: next.status,
                event: describe.clone(),
                timestamp: next.updated_at,
            },
        )?;
        info!(
            "{}: {} ({} → {})",
            version,
            describe,
            from.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()),
            next.status
        );
        Ok(next)
    }

    /// Reset `arch` and every later architecture to not_attempted
    ///
    /// Affected attempts keep their slot and get a [`RewindMark`]; the
    /// version goes back to `building`.
    pub fn rewind(&mut self, version: &UpstreamVersion, arch: &str, reason: Option<&str>) -> Result<()> {
        let key = version.as_str().to_string();
        let invalid = |detail: String| Error::InvalidTransition {
            version: key.clone(),
            detail,
        };

        let state = self
            .doc
            .versions
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("No state recorded for {}", version)))?;
        let start = self
            .architectures
            .iter()
            .position(|a| a == arch)
            .ok_or_else(|| invalid(format!("architecture {} is not configured", arch)))?;

        match (&state.status, &state.failure) {
            (Status::Building | Status::Built | Status::Published, _) => {}
            (Status::Failed, Some(Failure { stage: FailureStage::Building { .. }, .. })) => {}
            (status, _) => {
                return Err(invalid(format!("cannot rewind a {} version", status)));
            }
        }

        let now = Utc::now();
        let mut next = state.clone();
        let mut affected = Vec::new();
        for attempt in next.attempts.iter_mut().skip(start) {
            if attempt.outcome == Outcome::NotAttempted {
                continue;
            }
            attempt.rewound = Some(RewindMark {
                at: now,
                reason: reason.map(str::to_string),
                previous_outcome: attempt.outcome,
            });
            attempt.outcome = Outcome::NotAttempted;
            affected.push(attempt.arch.clone());
        }
        if affected.is_empty() {
            return Err(invalid(format!("no recorded attempt for {} or later", arch)));
        }

        next.status = Status::Building;
        next.failure = None;
        next.updated_at = now;

        let mut doc = self.doc.clone();
        doc.versions.insert(key.clone(), next);
        self.commit(
            doc,
            AuditRecord::Rewind {
                version: key,
                arch: arch.to_string(),
                reason: reason.map(str::to_string),
                affected: affected.clone(),
                timestamp: now,
            },
        )?;
        info!("{}: rewound {}", version, affected.join(", "));
        Ok(())
    }

    /// Clear a failure so the next run redoes the failed stage
    pub fn retry(&mut self, version: &UpstreamVersion, reason: Option<&str>) -> Result<()> {
        let key = version.as_str().to_string();
        let state = self
            .doc
            .versions
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("No state recorded for {}", version)))?;

        let stage = match (&state.status, &state.failure) {
            (Status::Failed, Some(failure)) => failure.stage.clone(),
            (status, _) => {
                return Err(Error::InvalidTransition {
                    version: key,
                    detail: format!("only failed versions can be retried, this one is {}", status),
                });
            }
        };

        match stage {
            FailureStage::Building { arch } => self.rewind(version, &arch, reason),
            FailureStage::Preparing { .. } => {
                let mut next = state.clone();
                next.status = Status::Pending;
                next.failure = None;
                next.auto_ref = None;
                next.updated_at = Utc::now();

                let mut doc = self.doc.clone();
                doc.versions.insert(key.clone(), next);
                self.commit(
                    doc,
                    AuditRecord::Retry {
                        version: key,
                        reason: reason.map(str::to_string),
                        timestamp: Utc::now(),
                    },
                )?;
                info!("{}: preparation failure cleared, back to pending", version);
                Ok(())
            }
        }
    }

    /// Replace detection results; unchanged results are not rewritten
    pub fn set_detection(&mut self, detection: DetectionRecord) -> Result<()> {
        if self.doc.detection.as_ref() == Some(&detection) {
            return Ok(());
        }
        let mut doc = self.doc.clone();
        let record = AuditRecord::Detection {
            latest_upstream: detection.latest_upstream.clone(),
            pending: detection.pending.clone(),
            timestamp: Utc::now(),
        };
        doc.detection = Some(detection);
        self.commit(doc, record)
    }

    /// Replace reference package information; unchanged data is not rewritten
    pub fn set_reference(&mut self, reference: ReferenceRecord) -> Result<()> {
        if self.doc.reference.as_ref() == Some(&reference) {
            return Ok(());
        }
        let mut doc = self.doc.clone();
        let record = AuditRecord::Reference {
            version: reference.version.clone(),
            timestamp: Utc::now(),
        };
        doc.reference = Some(reference);
        self.commit(doc, record)
    }

    fn commit(&mut self, doc: StateDocument, record: AuditRecord) -> Result<()> {
        write_atomic(&self.path, &doc)?;
        self.doc = doc;
        self.journal.append(&record)
    }
}

/// Compute the state following `event`, enforcing the status flow and the
/// architecture gating
fn apply(
    current: Option<&PackagingState>,
    event: Event,
    architectures: &[String],
    version: &UpstreamVersion,
) -> Result<PackagingState> {
    let invalid = |detail: String| Error::InvalidTransition {
        version: version.to_string(),
        detail,
    };
    let now = Utc::now();

    let Some(current) = current else {
        return match event {
            Event::Detected => Ok(PackagingState::new()),
            other => Err(invalid(format!("{} before detection", other.describe()))),
        };
    };

    let mut next = current.clone();
    next.updated_at = now;

    match (current.status, event) {
        (_, Event::Detected) => return Err(invalid("already recorded".to_string())),

        (Status::Pending | Status::Preparing, Event::PreparationStarted) => {
            next.status = Status::Preparing;
        }

        (Status::Preparing, Event::Prepared(refs)) => {
            next.status = Status::Building;
            next.auto_ref = Some(refs);
        }

        (Status::Preparing, Event::PreparationFailed { kind, detail }) => {
            next.status = Status::Failed;
            next.failure = Some(Failure {
                stage: FailureStage::Preparing { kind },
                detail,
                at: now,
            });
        }

        (Status::Building, Event::RefMoved { commit }) => {
            let refs = next
                .auto_ref
                .as_mut()
                .ok_or_else(|| invalid("no automated ref recorded".to_string()))?;
            refs.commit = commit;
        }

        (Status::Building, Event::BuildRecorded(attempt)) => {
            let index = current.next_build_index();
            let expected = architectures
                .get(index)
                .ok_or_else(|| invalid("every architecture already succeeded".to_string()))?;
            if attempt.arch != *expected {
                return Err(invalid(format!(
                    "build recorded for {} but the next architecture is {}",
                    attempt.arch, expected
                )));
            }
            if attempt.outcome == Outcome::NotAttempted {
                return Err(invalid("a build attempt must succeed or fail".to_string()));
            }

            let outcome = attempt.outcome;
            let detail = attempt.detail.clone();
            if index < next.attempts.len() {
                let replaced = std::mem::replace(&mut next.attempts[index], attempt);
                next.superseded.push(replaced);
            } else {
                next.attempts.push(attempt);
            }

            match outcome {
                Outcome::Failure => {
                    next.status = Status::Failed;
                    next.failure = Some(Failure {
                        stage: FailureStage::Building {
                            arch: expected.clone(),
                        },
                        detail: detail.unwrap_or_else(|| "build failed".to_string()),
                        at: now,
                    });
                }
                _ if index + 1 == architectures.len() => next.status = Status::Built,
                _ => next.status = Status::Building,
            }
        }

        (Status::Built, Event::Published) => {
            next.status = Status::Published;
        }

        (status, event) => {
            return Err(invalid(format!(
                "{} is not allowed while {}",
                event.describe(),
                status
            )));
        }
    }

    Ok(next)
}

/// Replace `path` with the JSON rendering of `doc` through a fsynced
/// temporary file in the same directory
pub(crate) fn write_atomic<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, doc)
        .map_err(|e| Error::StateError(format!("Failed to serialize {}: {}", path.display(), e)))?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        Error::StateError(format!("Failed to replace {}: {}", path.display(), e.error))
    })?;
    Ok(())
}
