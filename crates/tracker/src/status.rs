//! Task state reconstruction: a task's status and progress are derived from the metadata
//! record and the progress log on every call. Nothing here writes to disk.

use std::fmt;
use std::path::Path;
use chrono::{DateTime, Local};
use log::debug;
use serde::{Deserialize, Serialize};
use crate::config::TrackerConfig;
use crate::progress_log::{CompletionStatus, ProgressLog};
use crate::task::{self, TaskMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Unknown,
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Unknown => "unknown",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress as reported to pollers, taken from the newest progress/heartbeat entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current_step: u32,
    pub total_steps: u32,
    pub progress_percentage: f64,
    pub estimated_remaining: String,
    pub current_step_name: String,
}

impl ProgressSnapshot {
    pub fn waiting() -> Self {
        Self {
            current_step: 0,
            total_steps: 0,
            progress_percentage: 0.0,
            estimated_remaining: "unknown".to_string(),
            current_step_name: "waiting to start".to_string(),
        }
    }

    fn from_log(log: &ProgressLog) -> Self {
        match log.latest_progress() {
            Some(entry) => Self {
                current_step: entry.step_current,
                total_steps: entry.step_total,
                progress_percentage: entry.progress_percentage,
                estimated_remaining: entry.estimated_remaining.formatted.clone(),
                current_step_name: entry.step_name.clone(),
            },
            None => Self::waiting(),
        }
    }
}

/// Externally visible state of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub progress: ProgressSnapshot,
    /// Failure text from the completion entry of a failed task
    pub error_message: Option<String>,
    /// Timestamp of the newest log entry, if a log exists
    pub last_update: Option<DateTime<Local>>,
}

impl TaskState {
    fn without_log(status: TaskStatus) -> Self {
        Self {
            status,
            progress: ProgressSnapshot::waiting(),
            error_message: None,
            last_update: None,
        }
    }
}

/// Derive status from the task folder. Unreadable or unparsable files yield `Unknown`.
pub fn derive_status(folder: &Path, cfg: &TrackerConfig) -> TaskState {
    match task::read_metadata(folder, cfg) {
        Ok(Some(_)) => {}
        Ok(None) => return TaskState::without_log(TaskStatus::Unknown),
        Err(e) => {
            debug!("Unreadable metadata in {}: {:#}", folder.display(), e);
            return TaskState::without_log(TaskStatus::Unknown);
        }
    }
    derive_from_log(folder, cfg)
}

/// Same as [`derive_status`], also returning the metadata record for callers that display it
pub fn load_task(folder: &Path, cfg: &TrackerConfig) -> Option<(TaskMetadata, TaskState)> {
    match task::read_metadata(folder, cfg) {
        Ok(Some(metadata)) => Some((metadata, derive_from_log(folder, cfg))),
        Ok(None) => None,
        Err(e) => {
            debug!("Unreadable metadata in {}: {:#}", folder.display(), e);
            None
        }
    }
}

fn derive_from_log(folder: &Path, cfg: &TrackerConfig) -> TaskState {
    let log = match ProgressLog::read_from(&task::progress_path(folder, cfg)) {
        Ok(Some(log)) => log,
        Ok(None) => return TaskState::without_log(TaskStatus::Pending),
        Err(e) => {
            debug!("Unreadable progress log in {}: {:#}", folder.display(), e);
            return TaskState::without_log(TaskStatus::Unknown);
        }
    };

    let (status, error_message) = match &log.completion {
        Some(c) if c.status == CompletionStatus::Success => (TaskStatus::Completed, None),
        Some(c) => (TaskStatus::Failed, c.error_message.clone()),
        None if !log.progress_entries.is_empty() => (TaskStatus::Running, None),
        None => (TaskStatus::Pending, None),
    };

    TaskState {
        status,
        progress: ProgressSnapshot::from_log(&log),
        error_message,
        last_update: Some(log.last_activity()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use crate::recorder::ProgressRecorder;
    use crate::schedule::compute_schedule;

    fn setup() -> (tempfile::TempDir, TrackerConfig) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TrackerConfig {
            data_dir: dir.path().to_path_buf(),
            ..TrackerConfig::default_config()
        };
        (dir, cfg)
    }

    fn write_metadata(folder: &Path, cfg: &TrackerConfig) {
        fs::create_dir_all(folder).unwrap();
        let now = Local::now();
        let metadata = TaskMetadata {
            task_id: "123456".to_string(),
            course_name: "Chemistry".to_string(),
            teacher: "Ms. Park".to_string(),
            student_type: "high school".to_string(),
            folder_name: "123456_Chemistry".to_string(),
            upload_time: now,
            upload_time_readable: String::new(),
            video_file: "video.mp4".to_string(),
            outline_file: None,
        };
        task::save_metadata(folder, cfg, &metadata).unwrap();
    }

    fn recorder(folder: &Path, cfg: &TrackerConfig) -> ProgressRecorder {
        let budget = compute_schedule(1000.0, &cfg.step_schedule(), &[]);
        ProgressRecorder::new(task::progress_path(folder, cfg), budget, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_no_metadata_is_unknown() {
        let (dir, cfg) = setup();
        let state = derive_status(&dir.path().join("123456_x"), &cfg);
        assert_eq!(state.status, TaskStatus::Unknown);
        assert_eq!(state.progress, ProgressSnapshot::waiting());
    }

    #[test]
    fn test_metadata_without_log_is_pending() {
        let (dir, cfg) = setup();
        let folder = dir.path().join("123456_Chemistry");
        write_metadata(&folder, &cfg);
        assert_eq!(derive_status(&folder, &cfg).status, TaskStatus::Pending);
    }

    #[test]
    fn test_log_without_entries_is_pending() {
        let (dir, cfg) = setup();
        let folder = dir.path().join("123456_Chemistry");
        write_metadata(&folder, &cfg);
        let _recorder = recorder(&folder, &cfg);

        let state = derive_status(&folder, &cfg);
        assert_eq!(state.status, TaskStatus::Pending);
        assert!(state.last_update.is_some());
    }

    #[test]
    fn test_running_snapshot_uses_latest_entry() {
        let (dir, cfg) = setup();
        let folder = dir.path().join("123456_Chemistry");
        write_metadata(&folder, &cfg);
        let recorder = recorder(&folder, &cfg);
        recorder.start().unwrap();
        recorder.update_step(1, None).unwrap();
        recorder.update_step(3, None).unwrap();

        let state = derive_status(&folder, &cfg);
        assert_eq!(state.status, TaskStatus::Running);
        assert_eq!(state.progress.current_step, 3);
        assert_eq!(state.progress.total_steps, 6);
        assert_eq!(state.progress.progress_percentage, 50.0);
        assert_eq!(state.progress.current_step_name, "Video knowledge graph");

        // Idempotent with no intervening writes
        assert_eq!(derive_status(&folder, &cfg), state);
        recorder.stop(true, None).unwrap();
    }

    #[test]
    fn test_completed_and_failed() {
        let (dir, cfg) = setup();

        let ok_folder = dir.path().join("111111_ok");
        write_metadata(&ok_folder, &cfg);
        let ok = recorder(&ok_folder, &cfg);
        ok.start().unwrap();
        ok.stop(true, None).unwrap();
        assert_eq!(derive_status(&ok_folder, &cfg).status, TaskStatus::Completed);

        let bad_folder = dir.path().join("222222_bad");
        write_metadata(&bad_folder, &cfg);
        let bad = recorder(&bad_folder, &cfg);
        bad.start().unwrap();
        bad.stop(false, Some("x")).unwrap();
        let state = derive_status(&bad_folder, &cfg);
        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("x"));
    }

    #[test]
    fn test_corrupt_log_is_unknown() {
        let (dir, cfg) = setup();
        let folder = dir.path().join("123456_Chemistry");
        write_metadata(&folder, &cfg);
        fs::write(task::progress_path(&folder, &cfg), "{ \"metadata\": {").unwrap();

        let before = fs::read_to_string(task::progress_path(&folder, &cfg)).unwrap();
        assert_eq!(derive_status(&folder, &cfg).status, TaskStatus::Unknown);
        // Never mutates what it reads
        assert_eq!(fs::read_to_string(task::progress_path(&folder, &cfg)).unwrap(), before);
    }

    #[test]
    fn test_corrupt_metadata_is_unknown() {
        let (dir, cfg) = setup();
        let folder = dir.path().join("123456_Chemistry");
        fs::create_dir_all(&folder).unwrap();
        fs::write(task::metadata_path(&folder, &cfg), "not json").unwrap();
        assert_eq!(derive_status(&folder, &cfg).status, TaskStatus::Unknown);
        assert!(load_task(&folder, &cfg).is_none());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(TaskStatus::Completed).unwrap(), "completed");
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }
}
