// src/version/debian.rs

//! Debian package versions with dpkg ordering
//!
//! Format: `[epoch:]upstream_version[-debian_revision]`. Comparison follows
//! dpkg: epochs numerically, then upstream and revision with alternating
//! non-digit/digit runs, where `~` sorts before anything, even the end of
//! the string.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone)]
pub struct DebianVersion {
    pub epoch: u64,
    pub upstream: String,
    pub revision: Option<String>,
}

impl DebianVersion {
    /// Parse a Debian version string
    ///
    /// Examples:
    /// - "16.4.8~pirogue1" → epoch=0, upstream="16.4.8~pirogue1", revision=None
    /// - "1:20230625-2+rpt3" → epoch=1, upstream="20230625", revision=Some("2+rpt3")
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (epoch, rest) = match s.split_once(':') {
            Some((e, rest)) => {
                let epoch = e.parse::<u64>().map_err(|_| {
                    Error::ParseError(format!("Invalid epoch in Debian version '{}'", s))
                })?;
                (epoch, rest)
            }
            None => (0, s),
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((u, r)) => (u, Some(r.to_string())),
            None => (rest, None),
        };

        if upstream.is_empty() || !upstream.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::ParseError(format!(
                "Debian version '{}' must start with a digit",
                s
            )));
        }

        Ok(Self {
            epoch,
            upstream: upstream.to_string(),
            revision,
        })
    }
}

/// Weight of a character in the non-digit part of a dpkg comparison
fn order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(b'~') => -1,
        Some(c) => c as i32 + 256,
    }
}

/// dpkg's `verrevcmp`
fn verrevcmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ac = order(a.get(i).copied());
            let bc = order(b.get(j).copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while i < a.len() && a[i].is_ascii_digit() && j < b.len() && b[j].is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }

        if i < a.len() && a[i].is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

impl Ord for DebianVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| verrevcmp(&self.upstream, &other.upstream))
            .then_with(|| {
                verrevcmp(
                    self.revision.as_deref().unwrap_or(""),
                    other.revision.as_deref().unwrap_or(""),
                )
            })
    }
}

impl PartialEq for DebianVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DebianVersion {}

impl PartialOrd for DebianVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DebianVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.upstream)?;
        if let Some(ref revision) = self.revision {
            write!(f, "-{}", revision)?;
        }
        Ok(())
    }
}
