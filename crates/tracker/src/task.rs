use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::debug;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::config::TrackerConfig;
use crate::instrument::TaskInputs;
use crate::progress_log::READABLE_FORMAT;
use crate::scan::scan_task_folders;

/// Immutable record written once when a task is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub task_id: String,
    pub course_name: String,
    pub teacher: String,
    pub student_type: String,
    pub folder_name: String,
    pub upload_time: DateTime<Local>,
    #[serde(default)]
    pub upload_time_readable: String,
    pub video_file: String,
    pub outline_file: Option<String>,
}

/// Details supplied when registering a new task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub course_name: String,
    pub teacher: String,
    pub student_type: String,
    pub video: PathBuf,
    pub outline: Option<PathBuf>,
}

impl TaskMetadata {
    /// Inputs for running the analysis pipeline on this task
    pub fn inputs(&self, folder: &Path) -> TaskInputs {
        TaskInputs {
            task_dir: folder.to_path_buf(),
            video_path: folder.join(&self.video_file),
            outline_path: self.outline_file.as_ref().map(|f| folder.join(f)),
        }
    }
}

/// Generate a 6-digit task identifier
pub fn generate_task_id() -> String {
    let value = Uuid::new_v4().as_u128() % 1_000_000;
    format!("{:06}", value)
}

/// Folder name for a task: `<id>_<course>` with the course name reduced to safe characters
pub fn task_folder_name(task_id: &str, course_name: &str) -> String {
    let safe: String = course_name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    format!("{}_{}", task_id, safe.trim().replace(' ', "_"))
}

/// Extract the task id from a folder name, if it follows the `<digits>_...` layout
pub fn task_id_from_folder_name(folder_name: &str) -> Option<&str> {
    let (id, _) = folder_name.split_once('_')?;
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id)
    } else {
        None
    }
}

/// Random ids drawn before giving up on finding a free one
const MAX_ID_ATTEMPTS: usize = 32;

/// Create the folder for a new task.
///
/// Returns `Ok(None)` when `task_id` is already taken, either by the exact folder or by
/// any other folder with the same `<id>_` prefix. An existing folder is never reused.
pub fn create_task_folder(data_dir: &Path, task_id: &str, course_name: &str) -> Result<Option<(PathBuf, String)>> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    if scan_task_folders(data_dir)?.iter().any(|(id, _)| id == task_id) {
        return Ok(None);
    }

    let folder_name = task_folder_name(task_id, course_name);
    let folder = data_dir.join(&folder_name);
    match fs::create_dir(&folder) {
        Ok(()) => Ok(Some((folder, folder_name))),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to create task folder: {}", folder.display())),
    }
}

/// Draw ids from `next_id` until one yields a fresh task folder
fn allocate_task_folder(
    data_dir: &Path,
    course_name: &str,
    mut next_id: impl FnMut() -> String,
) -> Result<(String, PathBuf, String)> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let task_id = next_id();
        match create_task_folder(data_dir, &task_id, course_name)? {
            Some((folder, folder_name)) => return Ok((task_id, folder, folder_name)),
            None => debug!("Task id {} already in use, drawing another", task_id),
        }
    }
    anyhow::bail!(
        "No free task id found in {} after {} attempts",
        data_dir.display(),
        MAX_ID_ATTEMPTS
    )
}

pub fn metadata_path(folder: &Path, cfg: &TrackerConfig) -> PathBuf {
    folder.join(&cfg.metadata_file_name)
}

pub fn progress_path(folder: &Path, cfg: &TrackerConfig) -> PathBuf {
    folder.join(&cfg.progress_file_name)
}

/// Write the metadata record
pub fn save_metadata(folder: &Path, cfg: &TrackerConfig, metadata: &TaskMetadata) -> Result<PathBuf> {
    let path = metadata_path(folder, cfg);
    let json = serde_json::to_string_pretty(metadata).context("Failed to serialize task metadata")?;
    fs::write(&path, json).with_context(|| format!("Failed to write task metadata: {}", path.display()))?;
    Ok(path)
}

/// Read the metadata record. Returns `Ok(None)` when the file does not exist.
pub fn read_metadata(folder: &Path, cfg: &TrackerConfig) -> Result<Option<TaskMetadata>> {
    let path = metadata_path(folder, cfg);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read task metadata: {}", path.display()))?;
    let metadata = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse task metadata: {}", path.display()))?;
    Ok(Some(metadata))
}

/// Create a task folder, copy the inputs into it and write its metadata.
///
/// The video is stored under the configured video file name; an outline keeps its
/// original extension as `outline.<ext>`.
pub fn register_task(cfg: &TrackerConfig, task: &NewTask) -> Result<(PathBuf, TaskMetadata)> {
    if !task.video.is_file() {
        anyhow::bail!("Video file does not exist: {}", task.video.display());
    }

    let (task_id, folder, folder_name) = allocate_task_folder(&cfg.data_dir, &task.course_name, generate_task_id)?;

    let video_dest = folder.join(&cfg.video_file_name);
    fs::copy(&task.video, &video_dest)
        .with_context(|| format!("Failed to copy video into {}", video_dest.display()))?;

    let outline_file = match &task.outline {
        Some(outline) => {
            let name = match outline.extension().and_then(|e| e.to_str()) {
                Some(ext) => format!("outline.{}", ext),
                None => "outline".to_string(),
            };
            let dest = folder.join(&name);
            fs::copy(outline, &dest).with_context(|| format!("Failed to copy outline into {}", dest.display()))?;
            Some(name)
        }
        None => None,
    };

    let now = Local::now();
    let metadata = TaskMetadata {
        task_id,
        course_name: task.course_name.clone(),
        teacher: task.teacher.clone(),
        student_type: task.student_type.clone(),
        folder_name,
        upload_time: now,
        upload_time_readable: now.format(READABLE_FORMAT).to_string(),
        video_file: cfg.video_file_name.clone(),
        outline_file,
    };
    save_metadata(&folder, cfg, &metadata)?;

    Ok((folder, metadata))
}
