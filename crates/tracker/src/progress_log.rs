//! On-disk progress log: one pretty-printed JSON document per task, rewritten whole on
//! every append.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use crate::format::{format_remaining, round2};

/// Timestamp format for the `*_readable` fields
pub const READABLE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLog {
    pub metadata: LogMetadata,
    #[serde(default)]
    pub progress_entries: Vec<ProgressEntry>,
    #[serde(default)]
    pub skip_entries: Vec<SkipEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub created_time: DateTime<Local>,
    pub total_steps: u32,
    pub observed_duration_seconds: f64,
    pub observed_duration_formatted: String,
    #[serde(default)]
    pub dynamic_steps: BTreeMap<u32, bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Start,
    Progress,
    AutoUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatedRemaining {
    /// `None` when the observed duration is unknown
    pub seconds: Option<f64>,
    pub formatted: String,
}

impl EstimatedRemaining {
    pub fn unknown() -> Self {
        Self {
            seconds: None,
            formatted: "unknown".to_string(),
        }
    }

    pub fn from_seconds(seconds: f64) -> Self {
        let seconds = round2(seconds.max(0.0));
        Self {
            seconds: Some(seconds),
            formatted: format_remaining(seconds),
        }
    }
}

/// A `start`, `progress` or `auto_update` (heartbeat) entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Local>,
    #[serde(default)]
    pub timestamp_readable: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub step_current: u32,
    pub step_total: u32,
    pub progress_percentage: f64,
    pub step_name: String,
    pub estimated_remaining: EstimatedRemaining,
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub elapsed_formatted: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipEntry {
    pub timestamp: DateTime<Local>,
    #[serde(default)]
    pub timestamp_readable: String,
    /// Always `"skip"`
    #[serde(rename = "type", default = "skip_type")]
    pub kind: String,
    pub step_skipped: u32,
    pub reason: String,
}

fn skip_type() -> String {
    "skip".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEntry {
    pub timestamp: DateTime<Local>,
    #[serde(default)]
    pub timestamp_readable: String,
    pub status: CompletionStatus,
    pub error_message: Option<String>,
    pub total_elapsed_seconds: f64,
    #[serde(default)]
    pub total_elapsed_formatted: String,
}

impl ProgressLog {
    pub fn new(metadata: LogMetadata) -> Self {
        Self {
            metadata,
            progress_entries: Vec::new(),
            skip_entries: Vec::new(),
            completion: None,
        }
    }

    /// Read a log from disk. Returns `Ok(None)` when the file does not exist.
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read progress log: {}", path.display()))?;
        let log = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse progress log: {}", path.display()))?;
        Ok(Some(log))
    }

    /// Replace the file at `path` with this log.
    ///
    /// The document is written to a sibling temporary file and renamed over the target,
    /// so concurrent readers see either the previous or the new version in full.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize progress log")?;
        let tmp_path = temp_sibling(path);

        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temporary log: {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write temporary log: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temporary log: {}", tmp_path.display()))?;
        drop(file);

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to replace progress log: {}", path.display()))?;
        Ok(())
    }

    /// Most recent start/progress/heartbeat entry
    pub fn latest_progress(&self) -> Option<&ProgressEntry> {
        self.progress_entries.last()
    }

    /// Timestamp of the newest entry of any kind
    pub fn last_activity(&self) -> DateTime<Local> {
        let mut latest = self.metadata.created_time;
        let candidates = self
            .progress_entries
            .iter()
            .map(|e| e.timestamp)
            .chain(self.skip_entries.iter().map(|e| e.timestamp))
            .chain(self.completion.iter().map(|c| c.timestamp));
        for ts in candidates {
            if ts > latest {
                latest = ts;
            }
        }
        latest
    }

    pub fn is_terminal(&self) -> bool {
        self.completion.is_some()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "progress.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> LogMetadata {
        LogMetadata {
            created_time: Local::now(),
            total_steps: 3,
            observed_duration_seconds: 90.0,
            observed_duration_formatted: "1 min".to_string(),
            dynamic_steps: [(2, true)].into_iter().collect(),
        }
    }

    #[test]
    fn test_missing_log_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProgressLog::read_from(&dir.path().join("progress.json")).unwrap().is_none());
    }

    #[test]
    fn test_write_replaces_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let mut log = ProgressLog::new(metadata());
        log.write_to(&path).unwrap();
        log.skip_entries.push(SkipEntry {
            timestamp: Local::now(),
            timestamp_readable: String::new(),
            kind: skip_type(),
            step_skipped: 2,
            reason: "no outline supplied".to_string(),
        });
        log.write_to(&path).unwrap();

        let read = ProgressLog::read_from(&path).unwrap().unwrap();
        assert_eq!(read.skip_entries.len(), 1);
        assert_eq!(read.metadata.dynamic_steps.get(&2), Some(&true));
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn test_schema_field_names() {
        let mut log = ProgressLog::new(metadata());
        log.progress_entries.push(ProgressEntry {
            timestamp: Local::now(),
            timestamp_readable: String::new(),
            kind: EntryKind::AutoUpdate,
            step_current: 1,
            step_total: 3,
            progress_percentage: 33.3,
            step_name: "Transcription".to_string(),
            estimated_remaining: EstimatedRemaining::unknown(),
            elapsed_seconds: 1.5,
            elapsed_formatted: "0:00:01".to_string(),
        });

        let value = serde_json::to_value(&log).unwrap();
        let entry = &value["progress_entries"][0];
        assert_eq!(entry["type"], "auto_update");
        assert!(entry["estimated_remaining"]["seconds"].is_null());
        assert_eq!(value["metadata"]["dynamic_steps"]["2"], true);
        // Completion is only present once terminal
        assert!(value.get("completion").is_none());
    }

    #[test]
    fn test_minimal_document_parses() {
        let json = r#"{
            "metadata": {
                "created_time": "2024-05-01T10:00:00+08:00",
                "total_steps": 5,
                "observed_duration_seconds": 0.0,
                "observed_duration_formatted": "unknown"
            },
            "progress_entries": [],
            "completion": {
                "timestamp": "2024-05-01T10:05:00+08:00",
                "status": "error",
                "error_message": "boom",
                "total_elapsed_seconds": 300.0
            }
        }"#;
        let log: ProgressLog = serde_json::from_str(json).unwrap();
        assert!(log.skip_entries.is_empty());
        assert_eq!(log.completion.as_ref().unwrap().status, CompletionStatus::Error);
        assert!(log.is_terminal());
        assert_eq!(log.last_activity(), log.completion.unwrap().timestamp);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(&path, "{\"metadata\": ").unwrap();
        assert!(ProgressLog::read_from(&path).is_err());
    }
}
