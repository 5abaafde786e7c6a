use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::schedule::StepSchedule;

/// One analysis stage as declared in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Human-readable stage name shown in progress entries
    pub name: String,
    /// Fraction of the observed media duration this stage is expected to take
    pub weight: f64,
    /// Stage only makes sense when an outline document was uploaded
    #[serde(default)]
    pub requires_outline: bool,
    /// Program and arguments to execute. Supports `{video}`, `{outline}` and `{task_dir}`
    /// placeholders. An empty command makes the stage a no-op.
    #[serde(default)]
    pub command: Vec<String>,
}

impl StageConfig {
    fn new(name: &str, weight: f64, requires_outline: bool) -> Self {
        Self {
            name: name.to_string(),
            weight,
            requires_outline,
            command: Vec::new(),
        }
    }
}

/// Configuration for the progress tracker and its worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Root directory holding one folder per task
    pub data_dir: PathBuf,
    /// Name of the progress log inside each task folder
    pub progress_file_name: String,
    /// Name of the immutable metadata record inside each task folder
    pub metadata_file_name: String,
    /// Name the uploaded video is stored under inside each task folder
    pub video_file_name: String,
    /// Path to the ffprobe binary used to measure media duration
    pub ffprobe_bin: PathBuf,
    /// Interval in seconds between heartbeat entries while a task runs
    pub heartbeat_interval_secs: u64,
    /// A running task whose newest entry is older than this is considered abandoned
    pub stall_timeout_secs: u64,
    /// Interval in seconds between data directory scans in daemon mode
    pub scan_interval_secs: u64,
    /// Display name for stage 0
    pub start_label: String,
    /// Display name for stage N+1
    pub finish_label: String,
    /// Reason recorded when outline-dependent stages are skipped
    pub outline_skip_reason: String,
    /// Ordered pipeline stages, numbered from 1
    pub stages: Vec<StageConfig>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TrackerConfig {
    /// Create a default configuration matching the lesson analysis pipeline
    pub fn default_config() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            progress_file_name: "progress.json".to_string(),
            metadata_file_name: "basic_info.json".to_string(),
            video_file_name: "video.mp4".to_string(),
            ffprobe_bin: PathBuf::from("ffprobe"),
            heartbeat_interval_secs: 60,
            stall_timeout_secs: 300,
            scan_interval_secs: 30,
            start_label: "Starting".to_string(),
            finish_label: "Finished".to_string(),
            outline_skip_reason: "no outline supplied".to_string(),
            stages: vec![
                StageConfig::new("Audio extraction", 0.05, false),
                StageConfig::new("Transcription", 0.1, false),
                StageConfig::new("Video knowledge graph", 0.3, false),
                StageConfig::new("Outline knowledge graph", 0.3, true),
                StageConfig::new("New outline", 0.5, false),
                StageConfig::new("Teaching analysis report", 0.6, false),
            ],
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which recovery would fail tasks that are still alive.
    ///
    /// A live recorder only refreshes its log once per heartbeat, so the stall timeout
    /// must be longer than the heartbeat interval.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than 0");
        }
        if self.stall_timeout_secs <= self.heartbeat_interval_secs {
            anyhow::bail!(
                "stall_timeout_secs ({}) must be greater than heartbeat_interval_secs ({})",
                self.stall_timeout_secs,
                self.heartbeat_interval_secs
            );
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Build the step schedule described by `stages`.
    ///
    /// Stages are numbered from 1 in declaration order; stages that require an
    /// outline are the skippable ones.
    pub fn step_schedule(&self) -> StepSchedule {
        let mut weights = BTreeMap::new();
        let mut names = BTreeMap::new();
        let mut skippable = BTreeSet::new();

        for (stage, cfg) in (1u32..).zip(&self.stages) {
            weights.insert(stage, cfg.weight);
            names.insert(stage, cfg.name.clone());
            if cfg.requires_outline {
                skippable.insert(stage);
            }
        }

        StepSchedule {
            weights,
            names,
            skippable,
            start_label: self.start_label.clone(),
            finish_label: self.finish_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_returns_defaults() {
        let cfg = TrackerConfig::load_config(Some(Path::new("/nonexistent/tracker.toml"))).unwrap();
        assert_eq!(cfg.heartbeat_interval_secs, 60);
        assert_eq!(cfg.stages.len(), 6);
    }

    #[test]
    fn test_toml_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.toml");
        std::fs::write(&path, "data_dir = \"/srv/tasks\"\nheartbeat_interval_secs = 5\n").unwrap();

        let cfg = TrackerConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/tasks"));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
        // Unspecified fields keep their defaults
        assert_eq!(cfg.progress_file_name, "progress.json");
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(
            &path,
            r#"{"stages": [{"name": "Only", "weight": 1.0, "command": ["true"]}]}"#,
        )
        .unwrap();

        let cfg = TrackerConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.stages.len(), 1);
        assert!(!cfg.stages[0].requires_outline);
        assert_eq!(cfg.stages[0].command, vec!["true".to_string()]);
    }

    #[test]
    fn test_stall_timeout_must_exceed_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.toml");
        std::fs::write(&path, "heartbeat_interval_secs = 120\nstall_timeout_secs = 90\n").unwrap();

        let err = TrackerConfig::load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("stall_timeout_secs (90)"));

        let equal = TrackerConfig {
            heartbeat_interval_secs: 60,
            stall_timeout_secs: 60,
            ..TrackerConfig::default_config()
        };
        assert!(equal.validate().is_err());
        assert!(TrackerConfig::default_config().validate().is_ok());
    }

    #[test]
    fn test_step_schedule_numbering() {
        let schedule = TrackerConfig::default_config().step_schedule();
        assert_eq!(schedule.weights.len(), 6);
        assert_eq!(schedule.names.get(&1).map(String::as_str), Some("Audio extraction"));
        assert_eq!(schedule.skippable.iter().copied().collect::<Vec<_>>(), vec![4]);
    }
}
