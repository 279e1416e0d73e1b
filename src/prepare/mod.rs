// src/prepare/mod.rs

//! Advance the automated packaging branch to a new upstream release
//!
//! Preparation works on the automated branch, never on the human-curated
//! packaging branch. The automated branch continues from its previous head
//! when that head already contains the packaging branch, so consecutive
//! automated releases stack; otherwise it restarts from the packaging branch.

pub mod actions;

use crate::config::GitConfig;
use crate::error::{Error, Result};
use crate::git::GitRepo;
use crate::state::AutoRefs;
use crate::version::{UpstreamVersion, format_tag};
use actions::Step;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Capability to turn an upstream release into a buildable packaging commit
pub trait Preparer {
    /// Verify the working tree can be used; fails before any state change
    fn check(&self) -> Result<()>;

    /// Merge, update the changelog, check patches and tag
    ///
    /// Fails with [`Error::MergeConflict`] or [`Error::PatchFailure`] when
    /// manual work is required.
    fn prepare(&self, version: &UpstreamVersion) -> Result<AutoRefs>;

    /// Commit the automated branch points to right now
    fn resolve(&self, refs: &AutoRefs) -> Result<String>;

    /// Publish the automated branch and tag
    fn push(&self, refs: &AutoRefs) -> Result<()>;
}

/// Preparer driving git, dch, quilt and gbp in the configured working tree
pub struct GitPreparer {
    repo: GitRepo,
    config: GitConfig,
}

impl GitPreparer {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            repo: GitRepo::new(&config.work_dir),
            config: config.clone(),
        }
    }

    fn remote_branch(&self) -> String {
        format!(
            "{}/{}",
            self.config.packaging_remote, self.config.packaging_branch
        )
    }

    fn run(&self, step: Step, variables: &BTreeMap<&str, String>) -> Result<()> {
        debug!("Running {} actions", step.name());
        actions::run(step, self.repo.work_dir(), variables)
    }

    fn clean(&self) -> Result<()> {
        self.run(Step::Clean, &BTreeMap::new())
    }

    /// Starting point for the automated branch
    fn base(&self) -> Result<String> {
        let packaging = &self.config.packaging_branch;
        let auto = format!("refs/heads/{}", self.config.auto_branch);
        if self.repo.rev_exists(&auto) && self.repo.is_ancestor(packaging, &auto)? {
            debug!("Continuing {} from its current head", self.config.auto_branch);
            Ok(auto)
        } else {
            debug!("Restarting {} from {}", self.config.auto_branch, packaging);
            Ok(packaging.clone())
        }
    }

    fn has_patches(&self) -> bool {
        let series = self.repo.work_dir().join("debian/patches/series");
        std::fs::read_to_string(series)
            .map(|s| s.lines().any(|l| !l.trim().is_empty() && !l.starts_with('#')))
            .unwrap_or(false)
    }
}

impl Preparer for GitPreparer {
    fn check(&self) -> Result<()> {
        let current = self.repo.current_branch()?;
        if current != self.config.packaging_branch && current != self.config.auto_branch {
            return Err(Error::ConfigError(format!(
                "Unexpected current branch '{}' in {} (should be {} or {})",
                current,
                self.repo.work_dir().display(),
                self.config.packaging_branch,
                self.config.auto_branch
            )));
        }

        self.clean()?;
        self.repo.checkout(&self.config.packaging_branch)?;

        let local = &self.config.packaging_branch;
        let remote = self.remote_branch();
        let local_is_ancestor = self.repo.is_ancestor(local, &remote)?;
        let remote_is_ancestor = self.repo.is_ancestor(&remote, local)?;
        match (local_is_ancestor, remote_is_ancestor) {
            (false, false) => {
                return Err(Error::ConfigError(format!(
                    "Local and remote {} branches have diverged, must be fixed manually",
                    local
                )));
            }
            (true, true) => debug!("Local and remote {} are equal", local),
            (false, true) => debug!("Local {} is ahead of the remote", local),
            (true, false) => {
                info!("Remote {} is ahead, fast-forwarding", remote);
                self.repo.merge_ff_only(&remote)?;
            }
        }
        Ok(())
    }

    fn prepare(&self, version: &UpstreamVersion) -> Result<AutoRefs> {
        let full_version = format!("{}{}", version, self.config.version_suffix);
        let tag = format_tag(&self.config.auto_tag_format, &full_version);

        self.clean()?;
        let base = self.base()?;
        self.repo.checkout_reset(&self.config.auto_branch, &base)?;

        let mut variables = BTreeMap::new();
        variables.insert("uversion", version.as_str().to_string());
        variables.insert("dversion", full_version.clone());
        variables.insert("tagformat", self.config.auto_tag_format.clone());
        if let Some(key) = &self.config.signing_key {
            variables.insert("keyid", key.clone());
        }

        if let Err(e) = self.run(Step::Merge, &variables) {
            // Only unmerged paths make it a conflict; a missing tag or an
            // interrupted git is an ordinary failure
            let conflicts = self.repo.conflicted_files().unwrap_or_default();
            self.repo.abort_merge();
            if conflicts.is_empty() {
                return Err(e);
            }
            return Err(Error::MergeConflict {
                version: version.to_string(),
                detail: format!("conflicts in {}", conflicts.join(", ")),
            });
        }
        self.run(Step::Prepare, &variables)?;

        if self.has_patches() {
            if let Err(e) = self.run(Step::Patch, &variables) {
                let _ = self.clean();
                return Err(Error::PatchFailure {
                    version: version.to_string(),
                    detail: e.to_string(),
                });
            }
        } else {
            debug!("No quilt series, skipping the patch check");
        }

        let release = match self.config.signing_key {
            Some(_) => Step::ReleaseSigned,
            None => Step::Release,
        };
        self.run(release, &variables)?;

        let commit = self.repo.rev_parse("HEAD")?;
        info!("Prepared {} as {} at {}", full_version, tag, commit);
        Ok(AutoRefs {
            branch: self.config.auto_branch.clone(),
            tag,
            commit,
        })
    }

    fn resolve(&self, refs: &AutoRefs) -> Result<String> {
        let commit = self.repo.rev_parse(&format!("refs/heads/{}", refs.branch))?;
        if commit != refs.commit {
            warn!(
                "{} moved from {} to {} since it was recorded",
                refs.branch, refs.commit, commit
            );
        }
        Ok(commit)
    }

    fn push(&self, refs: &AutoRefs) -> Result<()> {
        let mut variables = BTreeMap::new();
        variables.insert("remote", self.config.packaging_remote.clone());
        variables.insert("branch", refs.branch.clone());
        variables.insert("commit", refs.commit.clone());
        variables.insert("tag", refs.tag.clone());
        self.run(Step::Push, &variables).map_err(|e| {
            Error::PublishError(format!("Failed to push {}: {}", refs.tag, e))
        })?;
        info!("Pushed {} and {}", refs.branch, refs.tag);
        Ok(())
    }
}
