// src/prepare/actions.rs

//! Command templates run against the packaging working tree
//!
//! Each step is a list of command lines with `%(name)s` placeholders. A
//! template is split into arguments first and interpolated second, so a
//! value containing spaces stays a single argument. Every variable a step
//! needs must be supplied before any of its commands runs.

use crate::error::{Error, Result};
use crate::process::run_checked_env;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\(([A-Za-z_]+)\)s").unwrap());

/// quilt looks for patches relative to the tree root
const ENVIRONMENT: &[(&str, &str)] = &[("QUILT_PATCHES", "debian/patches")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Clean,
    Merge,
    Prepare,
    Patch,
    Release,
    ReleaseSigned,
    Push,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Clean => "clean",
            Step::Merge => "merge",
            Step::Prepare => "prepare",
            Step::Patch => "patch",
            Step::Release | Step::ReleaseSigned => "release",
            Step::Push => "push",
        }
    }

    pub fn templates(&self) -> &'static [&'static str] {
        match self {
            Step::Clean => &[
                "git checkout -f",
                "git clean -xdf",
                "git submodule foreach --recursive git checkout -f",
                "git submodule foreach --recursive git clean -xdf",
            ],
            Step::Merge => &["git merge --no-edit %(uversion)s"],
            Step::Prepare => &[
                "git submodule update --init --recursive",
                r#"dch -v %(dversion)s "New upstream release.""#,
                "git add debian/changelog",
                r#"git commit -m "Bump changelog.""#,
            ],
            Step::Patch => &["quilt push -a", "quilt pop -a"],
            Step::Release => &[
                "rm -rf .pc",
                r#"dch -r """#,
                "git add debian/changelog",
                r#"git commit -m "Release %(dversion)s""#,
                // --retag: a tag left over from an earlier attempt is replaced
                "gbp tag --retag --ignore-branch --debian-tag=%(tagformat)s",
            ],
            Step::ReleaseSigned => &[
                "rm -rf .pc",
                r#"dch -r """#,
                "git add debian/changelog",
                r#"git commit -m "Release %(dversion)s""#,
                "gbp tag --retag --ignore-branch --sign-tags --keyid=%(keyid)s --debian-tag=%(tagformat)s",
            ],
            Step::Push => &[
                "git push -q -f %(remote)s %(commit)s:refs/heads/%(branch)s",
                "git push -q -f %(remote)s refs/tags/%(tag)s",
            ],
        }
    }
}

/// Variables referenced by a list of templates
pub fn required_variables(templates: &[&str]) -> BTreeSet<String> {
    templates
        .iter()
        .flat_map(|t| PLACEHOLDER.captures_iter(t))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Expand every placeholder of one argument in a single pass
fn interpolate(arg: &str, variables: &BTreeMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(arg, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Turn a step's templates into argument vectors
pub fn render(step: Step, variables: &BTreeMap<&str, String>) -> Result<Vec<Vec<String>>> {
    let templates = step.templates();
    for name in required_variables(templates) {
        if !variables.contains_key(name.as_str()) {
            return Err(Error::MissingVariable(format!(
                "{} (step {})",
                name,
                step.name()
            )));
        }
    }

    templates
        .iter()
        .map(|template| {
            let argv = shlex::split(template).ok_or_else(|| {
                Error::ConfigError(format!("Malformed action template: {}", template))
            })?;
            Ok(argv.iter().map(|a| interpolate(a, variables)).collect())
        })
        .collect()
}

/// Run every command of a step, stopping at the first failure
pub fn run(step: Step, work_dir: &Path, variables: &BTreeMap<&str, String>) -> Result<()> {
    for argv in render(step, variables)? {
        run_checked_env(work_dir, &argv, ENVIRONMENT)?;
    }
    Ok(())
}
