// src/git/mod.rs

//! Thin wrapper over the git command line for the packaging working tree

use crate::error::{Error, Result};
use crate::process::{run_checked, run_status};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A git working tree
#[derive(Debug, Clone)]
pub struct GitRepo {
    work_dir: PathBuf,
}

impl GitRepo {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("git");
        argv.extend_from_slice(args);
        run_checked(&self.work_dir, &argv)
    }

    /// Fetch a remote, tags included
    pub fn fetch(&self, remote: &str) -> Result<()> {
        self.git(&["fetch", "--tags", "--force", remote]).map_err(|e| {
            Error::DownloadError(format!("Failed to fetch {}: {}", remote, e))
        })?;
        Ok(())
    }

    pub fn tags(&self) -> Result<Vec<String>> {
        Ok(self
            .git(&["tag", "-l"])?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Name of the checked-out branch, empty when HEAD is detached
    pub fn current_branch(&self) -> Result<String> {
        Ok(self.git(&["branch", "--show-current"])?.trim().to_string())
    }

    /// Commit id a revision points to
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let spec = format!("{}^{{commit}}", rev);
        self.git(&["rev-parse", "--verify", "--quiet", &spec])
            .map(|out| out.trim().to_string())
            .map_err(|_| Error::NotFound(format!("Revision {} does not exist", rev)))
    }

    pub fn rev_exists(&self, rev: &str) -> bool {
        self.rev_parse(rev).is_ok()
    }

    /// Whether `ancestor` is reachable from `descendant`
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = run_status(
            &self.work_dir,
            &["git", "merge-base", "--is-ancestor", ancestor, descendant],
        )?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::CommandFailed(format!(
                "git merge-base --is-ancestor {} {}: {}",
                ancestor,
                descendant,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    pub fn merge_ff_only(&self, rev: &str) -> Result<()> {
        self.git(&["merge", "--ff-only", rev])?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", "-f", branch])?;
        Ok(())
    }

    /// Check out `branch`, creating or resetting it to `start`
    pub fn checkout_reset(&self, branch: &str, start: &str) -> Result<()> {
        debug!("Resetting {} to {}", branch, start);
        self.git(&["checkout", "-f", "-B", branch, start])?;
        Ok(())
    }

    /// Abort a merge left in progress, ignoring errors
    /// Paths left unmerged by a failed merge
    pub fn conflicted_files(&self) -> Result<Vec<String>> {
        Ok(self
            .git(&["diff", "--name-only", "--diff-filter=U"])?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn abort_merge(&self) {
        let _ = run_status(&self.work_dir, &["git", "merge", "--abort"]);
    }

    /// Contents of `path` at `rev`
    pub fn show_file(&self, rev: &str, path: &str) -> Result<String> {
        self.git(&["show", &format!("{}:{}", rev, path)])
    }

    /// Debian version recorded in `debian/changelog` at `rev`
    pub fn changelog_version(&self, rev: &str) -> Result<String> {
        parse_changelog_version(&self.show_file(rev, "debian/changelog")?)
    }
}

/// Version of the topmost changelog entry
///
/// The first line reads `source (version) distribution; urgency=...`.
pub fn parse_changelog_version(changelog: &str) -> Result<String> {
    let first = changelog
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::ParseError("Empty changelog".to_string()))?;

    let start = first.find('(');
    let end = first.find(')');
    match (start, end) {
        (Some(start), Some(end)) if start < end && end - start > 1 => {
            Ok(first[start + 1..end].trim().to_string())
        }
        _ => Err(Error::ParseError(format!(
            "No version in changelog line: {}",
            first
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_changelog_version() {
        let changelog = "\
frida (16.4.6~pirogue1) bookworm; urgency=medium

  * New upstream release.

 -- PiRogue Maintainers <maint@example.org>  Mon, 01 Jul 2024 10:00:00 +0200
";
        assert_eq!(parse_changelog_version(changelog).unwrap(), "16.4.6~pirogue1");
        assert!(parse_changelog_version("").is_err());
        assert!(parse_changelog_version("frida () unstable").is_err());
    }

    fn git(dir: &Path, args: &[&str]) {
        let mut argv = vec!["git", "-c", "user.name=Test", "-c", "user.email=test@example.org"];
        argv.extend_from_slice(args);
        run_checked(dir, &argv).unwrap();
    }

    #[test]
    fn test_repository_queries() {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-q", "-b", "debian/bookworm"]);
        fs::create_dir(dir.path().join("debian")).unwrap();
        fs::write(
            dir.path().join("debian/changelog"),
            "frida (16.4.6~pirogue1) bookworm; urgency=medium\n",
        )
        .unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "initial"]);
        git(dir.path(), &["tag", "debian/16.4.6_pirogue1"]);
        git(dir.path(), &["commit", "-q", "--allow-empty", "-m", "second"]);

        let repo = GitRepo::new(dir.path());
        assert_eq!(repo.current_branch().unwrap(), "debian/bookworm");
        assert_eq!(repo.tags().unwrap(), vec!["debian/16.4.6_pirogue1"]);
        assert_eq!(
            repo.changelog_version("debian/16.4.6_pirogue1").unwrap(),
            "16.4.6~pirogue1"
        );
        assert!(repo
            .is_ancestor("debian/16.4.6_pirogue1", "debian/bookworm")
            .unwrap());
        assert!(!repo
            .is_ancestor("debian/bookworm", "debian/16.4.6_pirogue1")
            .unwrap());
        assert!(repo.rev_exists("HEAD"));
        assert!(matches!(
            repo.rev_parse("no-such-branch"),
            Err(Error::NotFound(_))
        ));
    }
}
