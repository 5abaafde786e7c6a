use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use chrono::Local;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use crate::error::{TrackerError, TrackerResult};
use crate::format::{format_elapsed, format_observed, round1, round2};
use crate::progress_log::{
    CompletionEntry, CompletionStatus, EntryKind, LogMetadata, ProgressEntry, ProgressLog, SkipEntry,
    READABLE_FORMAT,
};
use crate::schedule::TimeBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

/// Everything guarded by the recorder's single lock: the in-memory log, the
/// current stage and the file it is mirrored to.
struct RecorderState {
    phase: Phase,
    current_step: u32,
    budget: TimeBudget,
    log: ProgressLog,
    started_at: Option<Instant>,
}

struct Shared {
    log_path: PathBuf,
    state: Mutex<RecorderState>,
    wake: Condvar,
}

/// Durable, append-only record of one task's progress through its stages.
///
/// Every mutation (step transition, skip, heartbeat, completion) happens under one
/// mutex and ends with the whole log being rewritten, so the pipeline thread and the
/// heartbeat thread never interleave partial writes. The recorder is `Sync` and can be
/// shared by reference or through an `Arc`.
pub struct ProgressRecorder {
    shared: Arc<Shared>,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressRecorder {
    /// Create the log directory and write the initial log (metadata only).
    ///
    /// Failing to create the directory is a setup failure and the task must not start.
    pub fn new(log_path: impl Into<PathBuf>, budget: TimeBudget, heartbeat_interval: Duration) -> TrackerResult<Self> {
        let log_path = log_path.into();

        if let Some(dir) = log_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| TrackerError::Setup {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let metadata = LogMetadata {
            created_time: Local::now(),
            total_steps: budget.total_stages,
            observed_duration_seconds: budget.observed_duration,
            observed_duration_formatted: format_observed(budget.observed_duration),
            dynamic_steps: budget.dynamic_steps.clone(),
        };
        let log = ProgressLog::new(metadata);
        if let Err(e) = log.write_to(&log_path) {
            warn!("Failed to write initial progress log {}: {:#}", log_path.display(), e);
        }

        let state = RecorderState {
            phase: Phase::Idle,
            current_step: 0,
            budget,
            log,
            started_at: None,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                log_path,
                state: Mutex::new(state),
                wake: Condvar::new(),
            }),
            heartbeat_interval,
            heartbeat: Mutex::new(None),
        })
    }

    /// Record the `start` entry and launch the heartbeat thread
    pub fn start(&self) -> TrackerResult<()> {
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                Phase::Running => return Err(TrackerError::AlreadyStarted),
                Phase::Stopped => return Err(TrackerError::Stopped),
                Phase::Idle => {}
            }
            state.phase = Phase::Running;
            state.started_at = Some(Instant::now());
            state.current_step = 0;
            self.shared.append_progress(&mut state, EntryKind::Start);
        }

        let shared = Arc::clone(&self.shared);
        let interval = self.heartbeat_interval;
        let thread_name = format!(
            "heartbeat-{}",
            self.shared
                .log_path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("task")
        );
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || heartbeat_loop(shared, interval));

        match spawned {
            Ok(handle) => {
                *self.heartbeat.lock() = Some(handle);
                info!("Progress recording started: {}", self.shared.log_path.display());
                Ok(())
            }
            Err(e) => Err(self.abort_start(e)),
        }
    }

    /// Terminate a recorder whose heartbeat could not be launched. The `start` entry is
    /// already on disk, so an error completion is written to keep the log terminal.
    fn abort_start(&self, e: std::io::Error) -> TrackerError {
        {
            let mut state = self.shared.state.lock();
            if state.phase == Phase::Running {
                state.phase = Phase::Stopped;
                state.current_step = 0;
                let message = format!("heartbeat unavailable: {}", e);
                self.shared.complete(&mut state, false, Some(&message));
            }
        }
        self.shared.wake.notify_all();
        TrackerError::Heartbeat(e)
    }

    /// Move to stage `step`, optionally renaming it, and append a `progress` entry.
    ///
    /// Ordering is not enforced; the pipeline is trusted to advance monotonically.
    /// Indices above `total + 1` are rejected.
    pub fn update_step(&self, step: u32, name: Option<&str>) -> TrackerResult<()> {
        let mut state = self.shared.state.lock();
        ensure_running(state.phase)?;
        let max = state.budget.total_stages + 1;
        if step > max {
            return Err(TrackerError::InvalidStage { stage: step, max });
        }

        state.current_step = step;
        if let Some(name) = name {
            state.budget.rename(step, name);
        }
        self.shared.append_progress(&mut state, EntryKind::Progress);
        Ok(())
    }

    /// Zero the stage's estimate, annotate its name with `reason` and append a `skip` entry.
    ///
    /// Only declared stages `1..=total` can be skipped; the stage count never changes.
    pub fn skip_step(&self, step: u32, reason: &str) -> TrackerResult<()> {
        let mut state = self.shared.state.lock();
        ensure_running(state.phase)?;

        let max = state.budget.total_stages;
        if step == 0 || step > max || !state.budget.skip(step, reason) {
            return Err(TrackerError::InvalidStage { stage: step, max });
        }
        let now = Local::now();
        state.log.skip_entries.push(SkipEntry {
            timestamp: now,
            timestamp_readable: now.format(READABLE_FORMAT).to_string(),
            kind: "skip".to_string(),
            step_skipped: step,
            reason: reason.to_string(),
        });
        state.log.metadata.dynamic_steps = state.budget.dynamic_steps.clone();
        self.shared.persist(&state);

        info!("Step {} skipped: {}", step, reason);
        Ok(())
    }

    /// Halt the heartbeat and append the single `completion` entry.
    ///
    /// The current stage becomes `total` on success and 0 on failure. Afterwards every
    /// operation, including a second `stop`, returns [`TrackerError::Stopped`].
    pub fn stop(&self, success: bool, error_message: Option<&str>) -> TrackerResult<()> {
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                Phase::Idle => return Err(TrackerError::NotStarted),
                Phase::Stopped => return Err(TrackerError::Stopped),
                Phase::Running => {}
            }
            state.phase = Phase::Stopped;
            state.current_step = if success { state.budget.total_stages } else { 0 };
            let elapsed = self.shared.complete(&mut state, success, error_message);

            if success {
                info!("Processing finished successfully in {}", format_elapsed(elapsed));
            } else {
                warn!(
                    "Processing failed after {}: {}",
                    format_elapsed(elapsed),
                    error_message.unwrap_or("unknown error")
                );
            }
        }

        self.shared.wake.notify_all();
        self.join_heartbeat();
        Ok(())
    }

    pub fn current_step(&self) -> u32 {
        self.shared.state.lock().current_step
    }

    pub fn total_steps(&self) -> u32 {
        self.shared.state.lock().budget.total_stages
    }

    pub fn estimate_for(&self, step: u32) -> Option<f64> {
        self.shared.state.lock().budget.estimate_for(step)
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().phase == Phase::Running
    }

    pub fn log_path(&self) -> &Path {
        &self.shared.log_path
    }

    /// Copy of the in-memory log as last written
    pub fn snapshot(&self) -> ProgressLog {
        self.shared.state.lock().log.clone()
    }

    fn join_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            if handle.join().is_err() {
                warn!("Heartbeat thread panicked: {}", self.shared.log_path.display());
            }
        }
    }
}

impl Drop for ProgressRecorder {
    fn drop(&mut self) {
        // Leaves the log without a completion entry; recovery reports it once stale.
        let was_running = {
            let mut state = self.shared.state.lock();
            let running = state.phase == Phase::Running;
            state.phase = Phase::Stopped;
            running
        };
        if was_running {
            warn!("Progress recorder dropped while running: {}", self.shared.log_path.display());
        }
        self.shared.wake.notify_all();
        self.join_heartbeat();
    }
}

fn ensure_running(phase: Phase) -> TrackerResult<()> {
    match phase {
        Phase::Running => Ok(()),
        Phase::Idle => Err(TrackerError::NotStarted),
        Phase::Stopped => Err(TrackerError::Stopped),
    }
}

impl Shared {
    /// Append a start/progress/heartbeat entry and rewrite the log. Caller holds the lock.
    fn append_progress(&self, state: &mut RecorderState, kind: EntryKind) {
        let elapsed = state.started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
        let total = state.budget.total_stages;
        let percentage = if total == 0 {
            0.0
        } else {
            round1((state.current_step as f64 / total as f64 * 100.0).min(100.0))
        };
        let now = Local::now();

        let entry = ProgressEntry {
            timestamp: now,
            timestamp_readable: now.format(READABLE_FORMAT).to_string(),
            kind,
            step_current: state.current_step,
            step_total: total,
            progress_percentage: percentage,
            step_name: state.budget.name_for(state.current_step),
            estimated_remaining: state.budget.remaining(state.current_step, elapsed),
            elapsed_seconds: round2(elapsed),
            elapsed_formatted: format_elapsed(elapsed),
        };

        let line = format!(
            "[{}] step {}/{} ({:.1}%) - {} | remaining: {}",
            entry.timestamp_readable,
            entry.step_current,
            entry.step_total,
            entry.progress_percentage,
            entry.step_name,
            entry.estimated_remaining.formatted
        );
        if kind == EntryKind::AutoUpdate {
            debug!("{}", line);
        } else {
            info!("{}", line);
        }

        state.log.progress_entries.push(entry);
        self.persist(state);
    }

    /// Set the single completion entry and rewrite the log. Returns the elapsed seconds.
    fn complete(&self, state: &mut RecorderState, success: bool, error_message: Option<&str>) -> f64 {
        let elapsed = state.started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
        let now = Local::now();
        state.log.completion = Some(CompletionEntry {
            timestamp: now,
            timestamp_readable: now.format(READABLE_FORMAT).to_string(),
            status: if success { CompletionStatus::Success } else { CompletionStatus::Error },
            error_message: error_message.map(str::to_string),
            total_elapsed_seconds: round2(elapsed),
            total_elapsed_formatted: format_elapsed(elapsed),
        });
        self.persist(state);
        elapsed
    }

    /// Best-effort rewrite of the whole log file. Caller holds the lock.
    fn persist(&self, state: &RecorderState) {
        if let Err(e) = state.log.write_to(&self.log_path) {
            warn!("Failed to write progress log {}: {:#}", self.log_path.display(), e);
        }
    }
}

/// Append an `auto_update` entry every `interval` until the recorder leaves the running state
fn heartbeat_loop(shared: Arc<Shared>, interval: Duration) {
    let mut state = shared.state.lock();
    loop {
        let deadline = Instant::now() + interval;
        while state.phase == Phase::Running && Instant::now() < deadline {
            shared.wake.wait_until(&mut state, deadline);
        }
        if state.phase != Phase::Running {
            break;
        }
        shared.append_progress(&mut state, EntryKind::AutoUpdate);
    }
    debug!("Heartbeat stopped: {}", shared.log_path.display());
}
