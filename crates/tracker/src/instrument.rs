//! Wraps a multi-stage pipeline so that a progress recorder is always created, started and
//! terminated exactly once, whichever way the pipeline exits.

use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{info, warn};
use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::ffprobe;
use crate::recorder::ProgressRecorder;
use crate::schedule::{compute_schedule, SkipRequest, StepSchedule};

/// Source of the one observed duration signal
pub trait DurationProbe: Send + Sync {
    fn probe_duration(&self, video: &Path) -> anyhow::Result<f64>;
}

/// Measures duration with the ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeDuration {
    pub ffprobe_bin: PathBuf,
}

impl DurationProbe for FfprobeDuration {
    fn probe_duration(&self, video: &Path) -> anyhow::Result<f64> {
        ffprobe::probe_duration(&self.ffprobe_bin, video)
    }
}

/// Reports a fixed duration, for callers that already know the media length
#[derive(Debug, Clone, Copy)]
pub struct FixedDuration(pub f64);

impl DurationProbe for FixedDuration {
    fn probe_duration(&self, _video: &Path) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

/// Inputs of one pipeline invocation
#[derive(Debug, Clone)]
pub struct TaskInputs {
    /// Folder the progress log is written to
    pub task_dir: PathBuf,
    pub video_path: PathBuf,
    /// Optional outline document; when absent every skippable stage is skipped
    pub outline_path: Option<PathBuf>,
}

pub struct PipelineInstrumentor {
    schedule: StepSchedule,
    skip_reason: String,
    heartbeat_interval: Duration,
    progress_file_name: String,
    probe: Box<dyn DurationProbe>,
}

impl PipelineInstrumentor {
    pub fn new(schedule: StepSchedule, probe: impl DurationProbe + 'static) -> Self {
        Self {
            schedule,
            skip_reason: "no outline supplied".to_string(),
            heartbeat_interval: Duration::from_secs(60),
            progress_file_name: "progress.json".to_string(),
            probe: Box::new(probe),
        }
    }

    /// Instrumentor for the configured pipeline, probing duration with ffprobe
    pub fn from_config(cfg: &TrackerConfig) -> Self {
        Self::new(
            cfg.step_schedule(),
            FfprobeDuration {
                ffprobe_bin: cfg.ffprobe_bin.clone(),
            },
        )
        .with_skip_reason(&cfg.outline_skip_reason)
        .with_heartbeat_interval(cfg.heartbeat_interval())
        .with_progress_file_name(&cfg.progress_file_name)
    }

    pub fn with_skip_reason(mut self, reason: &str) -> Self {
        self.skip_reason = reason.to_string();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_progress_file_name(mut self, name: &str) -> Self {
        self.progress_file_name = name.to_string();
        self
    }

    pub fn log_path(&self, inputs: &TaskInputs) -> PathBuf {
        inputs.task_dir.join(&self.progress_file_name)
    }

    /// Observed media duration; a failed probe degrades to 0 (unknown)
    pub fn observe(&self, inputs: &TaskInputs) -> f64 {
        match self.probe.probe_duration(&inputs.video_path) {
            Ok(seconds) => seconds,
            Err(e) => {
                warn!(
                    "Could not determine media duration for {}, remaining time will be unknown: {:#}",
                    inputs.video_path.display(),
                    e
                );
                0.0
            }
        }
    }

    /// Stages to skip for this task: every skippable stage when no outline was supplied
    pub fn skip_set(&self, inputs: &TaskInputs) -> Vec<SkipRequest> {
        if inputs.outline_path.is_some() {
            return Vec::new();
        }
        self.schedule
            .skippable
            .iter()
            .map(|&stage| SkipRequest::new(stage, self.skip_reason.clone()))
            .collect()
    }

    /// Build the time budget, then create and start a recorder for it
    pub fn prepare(&self, inputs: &TaskInputs) -> TrackerResult<ProgressRecorder> {
        let observed = self.observe(inputs);
        let skips = self.skip_set(inputs);
        for skip in &skips {
            info!("Stage {} will be skipped: {}", skip.stage, skip.reason);
        }
        let budget = compute_schedule(observed, &self.schedule, &skips);

        let recorder = ProgressRecorder::new(self.log_path(inputs), budget, self.heartbeat_interval)?;
        recorder.start()?;
        Ok(recorder)
    }

    /// Run `pipeline` with a freshly started recorder.
    ///
    /// On `Ok` the recorder is stopped successfully and the value returned unchanged. On
    /// `Err` the failure is recorded and the same error returned. A panic is recorded and
    /// then resumed.
    pub fn run<T, E, F>(&self, inputs: &TaskInputs, pipeline: F) -> Result<T, E>
    where
        F: FnOnce(&ProgressRecorder) -> Result<T, E>,
        E: Display + From<TrackerError>,
    {
        let recorder = self.prepare(inputs)?;

        match panic::catch_unwind(AssertUnwindSafe(|| pipeline(&recorder))) {
            Ok(Ok(value)) => {
                finish(&recorder, true, None);
                Ok(value)
            }
            Ok(Err(e)) => {
                finish(&recorder, false, Some(&format!("{:#}", e)));
                Err(e)
            }
            Err(payload) => {
                finish(&recorder, false, Some(&panic_message(payload.as_ref())));
                panic::resume_unwind(payload)
            }
        }
    }
}

/// Higher-order form of [`PipelineInstrumentor::run`]: returns a function that runs the
/// instrumented pipeline for any task inputs.
pub fn instrument<T, E, F>(instrumentor: PipelineInstrumentor, pipeline: F) -> impl Fn(&TaskInputs) -> Result<T, E>
where
    F: Fn(&ProgressRecorder, &TaskInputs) -> Result<T, E>,
    E: Display + From<TrackerError>,
{
    move |inputs: &TaskInputs| instrumentor.run(inputs, |recorder| pipeline(recorder, inputs))
}

fn finish(recorder: &ProgressRecorder, success: bool, error_message: Option<&str>) {
    if let Err(e) = recorder.stop(success, error_message) {
        // Only reachable if the pipeline stopped the recorder itself
        warn!("Could not record completion for {}: {}", recorder.log_path().display(), e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: pipeline aborted".to_string()
    }
}
