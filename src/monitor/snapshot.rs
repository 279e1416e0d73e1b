// src/monitor/snapshot.rs

//! Last observed state of each monitored package

use crate::deb822::{Stanza, dependency_names};
use crate::error::{Error, Result};
use crate::lock::ExclusiveLock;
use crate::state::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SNAPSHOT_FILE: &str = "snapshots.json";
const LOCK_FILE: &str = "snapshots.lock";

/// Fields of a package index stanza kept between monitor runs
///
/// Only `version` and `depends` are compared; `filename` is kept to point
/// at the previous download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSnapshot {
    pub version: String,
    #[serde(default)]
    pub depends: Vec<String>,
    pub filename: String,
}

impl PackageSnapshot {
    pub fn from_stanza(stanza: &Stanza) -> Result<Self> {
        Ok(Self {
            version: stanza.require("Version")?.to_string(),
            depends: stanza.get("Depends").map(dependency_names).unwrap_or_default(),
            filename: stanza.require("Filename")?.to_string(),
        })
    }

    /// Whether the monitored fields differ
    pub fn drifted_from(&self, other: &PackageSnapshot) -> bool {
        self.version != other.version || self.depends != other.depends
    }
}

/// Snapshot document under exclusive lock for the lifetime of the store
pub struct SnapshotStore {
    path: PathBuf,
    snapshots: BTreeMap<String, PackageSnapshot>,
    dirty: bool,
    _lock: ExclusiveLock,
}

impl SnapshotStore {
    pub fn open(work_dir: &Path) -> Result<Self> {
        let lock = ExclusiveLock::try_acquire(work_dir.join(LOCK_FILE))?;
        let path = work_dir.join(SNAPSHOT_FILE);
        let snapshots = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::StateError(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            BTreeMap::new()
        };
        debug!("Loaded {} package snapshots", snapshots.len());

        Ok(Self {
            path,
            snapshots,
            dirty: false,
            _lock: lock,
        })
    }

    pub fn get(&self, key: &str) -> Option<&PackageSnapshot> {
        self.snapshots.get(key)
    }

    pub fn update(&mut self, key: String, snapshot: PackageSnapshot) {
        if self.snapshots.get(&key) != Some(&snapshot) {
            self.snapshots.insert(key, snapshot);
            self.dirty = true;
        }
    }

    /// Write pending updates to disk
    pub fn save(&mut self) -> Result<()> {
        if self.dirty {
            write_atomic(&self.path, &self.snapshots)?;
            self.dirty = false;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
