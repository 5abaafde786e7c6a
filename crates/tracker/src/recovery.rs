//! Detection of tasks left "running" by a process that died without recording completion.
//!
//! A live recorder appends a heartbeat every interval, so a running task whose newest
//! entry is older than the stall timeout has no writer left.

use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{info, warn};
use crate::config::TrackerConfig;
use crate::format::{format_elapsed, round2};
use crate::progress_log::{CompletionEntry, CompletionStatus, ProgressLog, READABLE_FORMAT};
use crate::scan::scan_task_folders;
use crate::status::{derive_status, TaskStatus};
use crate::task::progress_path;

#[derive(Debug, Clone, PartialEq)]
pub struct StalledTask {
    pub task_id: String,
    pub folder: PathBuf,
    pub last_update: DateTime<Local>,
    pub idle: chrono::Duration,
}

/// Running tasks whose log has not been touched for longer than `stall_timeout_secs`
pub fn find_stalled_tasks(cfg: &TrackerConfig, now: DateTime<Local>) -> Result<Vec<StalledTask>> {
    let timeout = chrono::Duration::seconds(cfg.stall_timeout_secs as i64);
    let mut stalled = Vec::new();

    for (task_id, folder) in scan_task_folders(&cfg.data_dir)? {
        let state = derive_status(&folder, cfg);
        if state.status != TaskStatus::Running {
            continue;
        }
        let Some(last_update) = state.last_update else {
            continue;
        };
        let idle = now - last_update;
        if idle > timeout {
            stalled.push(StalledTask {
                task_id,
                folder,
                last_update,
                idle,
            });
        }
    }

    Ok(stalled)
}

/// Append an error completion to a log that has none.
///
/// Returns `false` when there is no log or it is already terminal.
pub fn mark_interrupted(folder: &Path, cfg: &TrackerConfig, reason: &str) -> Result<bool> {
    let path = progress_path(folder, cfg);
    let Some(mut log) = ProgressLog::read_from(&path)? else {
        return Ok(false);
    };
    if log.is_terminal() {
        return Ok(false);
    }

    let elapsed = log.latest_progress().map(|e| e.elapsed_seconds).unwrap_or(0.0);
    let now = Local::now();
    log.completion = Some(CompletionEntry {
        timestamp: now,
        timestamp_readable: now.format(READABLE_FORMAT).to_string(),
        status: CompletionStatus::Error,
        error_message: Some(reason.to_string()),
        total_elapsed_seconds: round2(elapsed),
        total_elapsed_formatted: format_elapsed(elapsed),
    });
    log.write_to(&path)
        .with_context(|| format!("Failed to record interruption for {}", folder.display()))?;
    Ok(true)
}

/// Mark every stalled task as failed. Returns how many were recovered.
pub fn recover_stalled_tasks(cfg: &TrackerConfig, now: DateTime<Local>) -> Result<usize> {
    let mut recovered = 0;

    for task in find_stalled_tasks(cfg, now)? {
        let reason = format!(
            "interrupted: no progress recorded since {}",
            task.last_update.format(READABLE_FORMAT)
        );
        match mark_interrupted(&task.folder, cfg, &reason) {
            Ok(true) => {
                warn!("Task {}: marked as failed ({})", task.task_id, reason);
                recovered += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("Task {}: could not record interruption: {:#}", task.task_id, e),
        }
    }

    if recovered > 0 {
        info!("Recovered {} stalled task(s)", recovered);
    }
    Ok(recovered)
}
