// src/deb822.rs

//! Parser for RFC 822 style control data (Packages indices, .changes files)
//!
//! Paragraphs are separated by blank lines. Continuation lines start with
//! whitespace and are appended to the previous field, one per line, with a
//! lone `.` standing for an empty line. Field names are case-insensitive.

use crate::error::{Error, Result};

/// One paragraph of control data, fields kept in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stanza {
    fields: Vec<(String, String)>,
}

impl Stanza {
    /// Field value, looked up case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Field value, or a parse error naming the missing field
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            Error::ParseError(format!(
                "Missing {} field in stanza{}",
                name,
                self.get("Package")
                    .map(|p| format!(" for {}", p))
                    .unwrap_or_default()
            ))
        })
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn push(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    fn continue_last(&mut self, line: &str, line_num: usize) -> Result<()> {
        let Some((_, value)) = self.fields.last_mut() else {
            return Err(Error::ParseError(format!(
                "Continuation line {} without a field",
                line_num
            )));
        };
        let content = line.trim();
        value.push('\n');
        if content != "." {
            value.push_str(content);
        }
        Ok(())
    }
}

/// Parse every paragraph of a control file
pub fn parse_stanzas(content: &str) -> Result<Vec<Stanza>> {
    let mut stanzas = Vec::new();
    let mut current = Stanza::default();
    let mut in_armor_header = false;

    for (idx, line) in content.lines().enumerate() {
        let line_num = idx + 1;
        if line.starts_with("-----BEGIN PGP SIGNATURE") {
            break;
        }
        if line.starts_with("-----BEGIN PGP SIGNED MESSAGE") {
            in_armor_header = true;
            continue;
        }
        if line.trim().is_empty() {
            in_armor_header = false;
            if !current.fields.is_empty() {
                stanzas.push(std::mem::take(&mut current));
            }
            continue;
        }
        if in_armor_header {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            current.continue_last(line, line_num)?;
            continue;
        }

        let (name, value) = line.split_once(':').ok_or_else(|| {
            Error::ParseError(format!("Malformed line {}: {}", line_num, line))
        })?;
        current.push(name.trim(), value.trim());
    }

    if !current.fields.is_empty() {
        stanzas.push(current);
    }
    Ok(stanzas)
}

/// Split a dependency field into package names without version constraints
///
/// `libc6 (>= 2.36), firmware-misc | firmware-linux` yields
/// `["libc6", "firmware-misc | firmware-linux"]`: alternatives are kept
/// together, only the constraints are dropped.
pub fn dependency_names(field: &str) -> Vec<String> {
    field
        .split(',')
        .map(|entry| {
            entry
                .split('|')
                .map(strip_constraint)
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn strip_constraint(alternative: &str) -> String {
    let alternative = alternative.trim();
    let end = alternative
        .find(|c: char| c == '(' || c == '[' || c == '<' || c.is_whitespace())
        .unwrap_or(alternative.len());
    alternative[..end].trim().to_string()
}

/// File names listed in the `Files` field of a .changes file
pub fn changes_files(stanza: &Stanza) -> Result<Vec<String>> {
    let files = stanza.require("Files")?;
    Ok(files
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(|name| name.to_string())
        .collect())
}
