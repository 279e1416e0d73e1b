// src/state/journal.rs

//! Append-only audit journal for state changes
//!
//! Every transition, rewind and retry applied by the state store is recorded
//! here after the state document has been replaced, so an operator can tell
//! a forced redo from a build that never ran.
//!
//! Format: `{crc32_hex}|{json}\n`, fsynced after each record.

use super::Status;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A record in the audit journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditRecord {
    /// A pipeline event was applied to a version
    Transition {
        version: String,
        from: Option<Status>,
        to: Status,
        event: String,
        timestamp: DateTime<Utc>,
    },

    /// Attempts were reset to not_attempted by an operator
    Rewind {
        version: String,
        arch: String,
        reason: Option<String>,
        affected: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A failed preparation was cleared by an operator
    Retry {
        version: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Detection results were replaced
    Detection {
        latest_upstream: String,
        pending: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Reference packages were replaced
    Reference {
        version: String,
        timestamp: DateTime<Utc>,
    },
}

/// Append-only audit journal
pub struct AuditJournal {
    path: PathBuf,
    file: File,
}

impl AuditJournal {
    /// Open the journal for appending, creating it if needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record and fsync
    pub fn append(&mut self, record: &AuditRecord) -> Result<()> {
        let json = serde_json::to_string(record).map_err(|e| {
            Error::IoError(format!("Failed to serialize audit record: {}", e))
        })?;
        let crc = crc32fast::hash(json.as_bytes());
        writeln!(self.file, "{:08x}|{}", crc, json)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Read all valid records, stopping at the first corrupted one
    pub fn read_all(path: &Path) -> Result<Vec<AuditRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.is_empty() {
                continue;
            }

            let Some((crc, json)) = line.split_once('|') else {
                warn!("Malformed audit line {}: missing delimiter", line_num + 1);
                continue;
            };

            let expected_crc = u32::from_str_radix(crc, 16).map_err(|_| {
                Error::ParseError(format!("Invalid CRC32 at line {}: {}", line_num + 1, crc))
            })?;
            let actual_crc = crc32fast::hash(json.as_bytes());
            if expected_crc != actual_crc {
                warn!(
                    "CRC mismatch at line {}: expected {:08x}, got {:08x}",
                    line_num + 1,
                    expected_crc,
                    actual_crc
                );
                break;
            }

            let record: AuditRecord = serde_json::from_str(json).map_err(|e| {
                Error::ParseError(format!(
                    "Failed to parse audit record at line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;
            records.push(record);
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rewind_record() -> AuditRecord {
        AuditRecord::Rewind {
            version: "16.4.8".to_string(),
            arch: "arm64".to_string(),
            reason: Some("emulator was broken".to_string()),
            affected: vec!["arm64".to_string()],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json.journal");

        let mut journal = AuditJournal::open(&path).unwrap();
        journal
            .append(&AuditRecord::Transition {
                version: "16.4.8".to_string(),
                from: Some(Status::Building),
                to: Status::Built,
                event: "build recorded for arm64".to_string(),
                timestamp: Utc::now(),
            })
            .unwrap();
        journal.append(&rewind_record()).unwrap();

        let records = AuditJournal::read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1], AuditRecord::Rewind { ref arch, .. } if arch == "arm64"));
    }

    #[test]
    fn test_reading_stops_at_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        let mut journal = AuditJournal::open(&path).unwrap();
        journal.append(&rewind_record()).unwrap();
        drop(journal);

        let mut content = fs::read_to_string(&path).unwrap();
        let good_line = content.clone();
        content.push_str(&good_line.replace("arm64", "armhf"));
        content.push_str(&good_line);
        fs::write(&path, content).unwrap();

        let records = AuditJournal::read_all(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(AuditJournal::read_all(&dir.path().join("none")).unwrap().is_empty());
    }
}
