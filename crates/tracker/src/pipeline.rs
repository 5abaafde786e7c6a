use std::process::Command;
use anyhow::{Context, Result};
use log::{debug, info};
use crate::config::{StageConfig, TrackerConfig};
use crate::instrument::{PipelineInstrumentor, TaskInputs};
use crate::recorder::ProgressRecorder;

/// Longest stderr tail carried into a stage failure message
const STDERR_TAIL: usize = 2000;

/// Run every configured stage in order, reporting transitions to `recorder`.
///
/// Stages that need an outline are skipped when the task has none. The first failing
/// stage aborts the pipeline with an error naming it.
pub fn run_configured_stages(cfg: &TrackerConfig, inputs: &TaskInputs, recorder: &ProgressRecorder) -> Result<()> {
    for (stage, stage_cfg) in (1u32..).zip(&cfg.stages) {
        if stage_cfg.requires_outline && inputs.outline_path.is_none() {
            recorder.skip_step(stage, &cfg.outline_skip_reason)?;
            continue;
        }

        recorder.update_step(stage, Some(&stage_cfg.name))?;
        run_stage_command(stage_cfg, inputs)
            .with_context(|| format!("Stage {} ({}) failed", stage, stage_cfg.name))?;
    }

    let finish = cfg.stages.len() as u32 + 1;
    recorder.update_step(finish, Some(&cfg.finish_label))?;
    Ok(())
}

/// Run the configured pipeline for one task under a progress recorder
pub fn analyze_task(cfg: &TrackerConfig, inputs: &TaskInputs) -> Result<()> {
    let instrumentor = PipelineInstrumentor::from_config(cfg);
    instrumentor.run(inputs, |recorder| run_configured_stages(cfg, inputs, recorder))
}

/// Substitute `{video}`, `{outline}` and `{task_dir}` in a command argument
fn expand_placeholders(arg: &str, inputs: &TaskInputs) -> String {
    let outline = inputs
        .outline_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    arg.replace("{video}", &inputs.video_path.display().to_string())
        .replace("{outline}", &outline)
        .replace("{task_dir}", &inputs.task_dir.display().to_string())
}

fn run_stage_command(stage: &StageConfig, inputs: &TaskInputs) -> Result<()> {
    let Some((program, args)) = stage.command.split_first() else {
        debug!("Stage '{}' has no command configured, nothing to run", stage.name);
        return Ok(());
    };

    let program = expand_placeholders(program, inputs);
    let args: Vec<String> = args.iter().map(|a| expand_placeholders(a, inputs)).collect();

    info!("Running stage '{}': {} {}", stage.name, program, args.join(" "));
    let output = Command::new(&program)
        .args(&args)
        .current_dir(&inputs.task_dir)
        .output()
        .with_context(|| format!("Failed to execute {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map(|(i, _)| i)
            .unwrap_or(0);
        anyhow::bail!(
            "{} exited with code {}: {}",
            program,
            output.status.code().unwrap_or(-1),
            &stderr[tail_start..]
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use crate::instrument::FixedDuration;
    use crate::progress_log::{CompletionStatus, ProgressLog};
    use crate::status::{derive_status, TaskStatus};
    use crate::task::{register_task, NewTask};

    fn stage(name: &str, weight: f64, requires_outline: bool, command: &[&str]) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            weight,
            requires_outline,
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn config(dir: &Path, stages: Vec<StageConfig>) -> TrackerConfig {
        TrackerConfig {
            data_dir: dir.join("data"),
            stages,
            ..TrackerConfig::default_config()
        }
    }

    fn new_task(dir: &Path, cfg: &TrackerConfig, with_outline: bool) -> (std::path::PathBuf, TaskInputs) {
        let video = dir.join("lecture.mp4");
        fs::write(&video, b"video").unwrap();
        let outline = if with_outline {
            let path = dir.join("plan.pdf");
            fs::write(&path, b"plan").unwrap();
            Some(path)
        } else {
            None
        };
        let task = NewTask {
            course_name: "Biology".to_string(),
            teacher: "T".to_string(),
            student_type: "S".to_string(),
            video,
            outline,
        };
        let (folder, metadata) = register_task(cfg, &task).unwrap();
        let inputs = metadata.inputs(&folder);
        (folder, inputs)
    }

    fn instrumentor(cfg: &TrackerConfig) -> PipelineInstrumentor {
        PipelineInstrumentor::new(cfg.step_schedule(), FixedDuration(1000.0))
            .with_skip_reason(&cfg.outline_skip_reason)
            .with_heartbeat_interval(Duration::from_secs(60))
    }

    #[test]
    fn test_placeholders() {
        let inputs = TaskInputs {
            task_dir: "/data/1_x".into(),
            video_path: "/data/1_x/video.mp4".into(),
            outline_path: None,
        };
        assert_eq!(expand_placeholders("--in={video}", &inputs), "--in=/data/1_x/video.mp4");
        assert_eq!(expand_placeholders("{outline}", &inputs), "");
        assert_eq!(expand_placeholders("{task_dir}/out", &inputs), "/data/1_x/out");
    }

    #[test]
    fn test_all_stages_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            vec![
                stage("Audio", 0.1, false, &["sh", "-c", "cp {video} audio.bin"]),
                stage("Outline graph", 0.05, true, &["true"]),
                stage("Report", 0.02, false, &[]),
            ],
        );
        let (folder, inputs) = new_task(dir.path(), &cfg, true);

        instrumentor(&cfg)
            .run(&inputs, |recorder| run_configured_stages(&cfg, &inputs, recorder))
            .unwrap();

        assert!(folder.join("audio.bin").is_file());
        let state = derive_status(&folder, &cfg);
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.progress.current_step, 4);
        assert_eq!(state.progress.current_step_name, cfg.finish_label);
    }

    #[test]
    fn test_missing_outline_records_single_skip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            vec![
                stage("Transcription", 0.1, false, &[]),
                stage("Video graph", 0.05, false, &[]),
                stage("Outline graph", 0.02, true, &[]),
                stage("New outline", 0.08, false, &[]),
                stage("Report", 0.05, false, &[]),
            ],
        );
        let (folder, inputs) = new_task(dir.path(), &cfg, false);

        instrumentor(&cfg)
            .run(&inputs, |recorder| run_configured_stages(&cfg, &inputs, recorder))
            .unwrap();

        let log = ProgressLog::read_from(&folder.join("progress.json")).unwrap().unwrap();
        assert_eq!(log.skip_entries.len(), 1);
        assert_eq!(log.skip_entries[0].step_skipped, 3);
        assert_eq!(log.skip_entries[0].reason, "no outline supplied");
        assert!(log.progress_entries.iter().all(|e| e.step_current != 3));
    }

    #[test]
    fn test_failing_stage_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            vec![
                stage("Audio", 0.1, false, &["true"]),
                stage("Transcription", 0.2, false, &["sh", "-c", "echo model not loaded >&2; exit 3"]),
                stage("Report", 0.1, false, &["true"]),
            ],
        );
        let (folder, inputs) = new_task(dir.path(), &cfg, true);

        let err = instrumentor(&cfg)
            .run(&inputs, |recorder| run_configured_stages(&cfg, &inputs, recorder))
            .unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.starts_with("Stage 2 (Transcription) failed"));
        assert!(message.contains("model not loaded"));

        let log = ProgressLog::read_from(&folder.join("progress.json")).unwrap().unwrap();
        let completion = log.completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::Error);
        assert_eq!(completion.error_message.as_deref(), Some(message.as_str()));

        let state = derive_status(&folder, &cfg);
        assert_eq!(state.status, TaskStatus::Failed);
        // The last progress entry still shows where it failed
        assert_eq!(state.progress.current_step, 2);
    }
}
