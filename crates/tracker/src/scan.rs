use std::path::{Path, PathBuf};
use anyhow::Result;
use chrono::{DateTime, Local};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;
use crate::config::TrackerConfig;
use crate::status::{self, ProgressSnapshot, TaskState, TaskStatus};
use crate::task::task_id_from_folder_name;

/// One row of the list-all view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub course_name: String,
    pub teacher: String,
    pub student_type: String,
    pub upload_time: DateTime<Local>,
    pub folder: PathBuf,
    pub status: TaskStatus,
    pub progress: ProgressSnapshot,
    pub error_message: Option<String>,
    pub last_update: Option<DateTime<Local>>,
}

/// Find task folders (`<digits>_<name>`) directly under the data directory
pub fn scan_task_folders(data_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut folders = Vec::new();

    if !data_dir.exists() {
        warn!("Data directory does not exist: {}", data_dir.display());
        return Ok(folders);
    }

    for entry in WalkDir::new(data_dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_dir() {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        match task_id_from_folder_name(name) {
            Some(id) => folders.push((id.to_string(), entry.path().to_path_buf())),
            None => debug!("Ignoring non-task folder: {}", entry.path().display()),
        }
    }

    Ok(folders)
}

/// Every task with metadata, newest upload first
pub fn list_tasks(cfg: &TrackerConfig) -> Result<Vec<TaskSummary>> {
    let mut tasks: Vec<TaskSummary> = scan_task_folders(&cfg.data_dir)?
        .into_iter()
        .filter_map(|(_, folder)| {
            let (metadata, state) = status::load_task(&folder, cfg)?;
            Some(summarize(metadata, folder, state))
        })
        .collect();

    tasks.sort_by(|a, b| b.upload_time.cmp(&a.upload_time));
    Ok(tasks)
}

/// Look up a single task by id
pub fn find_task(cfg: &TrackerConfig, task_id: &str) -> Result<Option<TaskSummary>> {
    let found = scan_task_folders(&cfg.data_dir)?
        .into_iter()
        .filter(|(id, _)| id == task_id)
        .find_map(|(_, folder)| {
            let (metadata, state) = status::load_task(&folder, cfg)?;
            Some(summarize(metadata, folder, state))
        });
    Ok(found)
}

fn summarize(metadata: crate::task::TaskMetadata, folder: PathBuf, state: TaskState) -> TaskSummary {
    TaskSummary {
        task_id: metadata.task_id,
        course_name: metadata.course_name,
        teacher: metadata.teacher,
        student_type: metadata.student_type,
        upload_time: metadata.upload_time,
        folder,
        status: state.status,
        progress: state.progress,
        error_message: state.error_message,
        last_update: state.last_update,
    }
}
