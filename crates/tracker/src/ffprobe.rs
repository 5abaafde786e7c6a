use std::path::Path;
use std::process::Command;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Subset of ffprobe's JSON output needed to measure media duration
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    /// Container duration in seconds, as a decimal string
    pub duration: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    /// Stream duration in seconds, as a decimal string
    pub duration: Option<String>,
}

impl FFProbeData {
    /// Media length in seconds.
    ///
    /// Prefers the first video stream's duration (what the transcription stages consume)
    /// and falls back to the container duration.
    pub fn duration_seconds(&self) -> Option<f64> {
        let from_video = self
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| parse_seconds(s.duration.as_deref()));

        from_video.or_else(|| {
            self.format
                .as_ref()
                .and_then(|f| parse_seconds(f.duration.as_deref()))
        })
    }
}

fn parse_seconds(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Run ffprobe on a media file and parse the JSON output
pub fn probe_media(ffprobe_bin: &Path, file_path: &Path) -> Result<FFProbeData> {
    use log::debug;

    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    debug!("ffprobe: probing {}", file_path.display());

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .output()
        .with_context(|| format!("Failed to execute {} for: {}", ffprobe_bin.display(), file_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}: {}",
            exit_code,
            file_path.display(),
            stderr.trim()
        );
    }

    let json_str = String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;

    let data: FFProbeData = serde_json::from_str(&json_str)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))?;

    Ok(data)
}

/// Measure the duration of a media file in seconds
pub fn probe_duration(ffprobe_bin: &Path, file_path: &Path) -> Result<f64> {
    let data = probe_media(ffprobe_bin, file_path)?;
    data.duration_seconds()
        .with_context(|| format!("ffprobe reported no duration for: {}", file_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_stream_duration_preferred() {
        let json = r#"{
            "streams": [
                {"index": 0, "codec_type": "audio", "codec_name": "aac", "duration": "12.0"},
                {"index": 1, "codec_type": "video", "codec_name": "h264", "duration": "1000.5"}
            ],
            "format": {"format_name": "mov,mp4", "duration": "1001.0"}
        }"#;
        let data: FFProbeData = serde_json::from_str(json).unwrap();
        assert_eq!(data.duration_seconds(), Some(1000.5));
    }

    #[test]
    fn test_format_duration_fallback() {
        let json = r#"{
            "streams": [{"index": 0, "codec_type": "video", "codec_name": "vp9"}],
            "format": {"format_name": "matroska,webm", "duration": "42.25"}
        }"#;
        let data: FFProbeData = serde_json::from_str(json).unwrap();
        assert_eq!(data.duration_seconds(), Some(42.25));
    }

    #[test]
    fn test_missing_or_bogus_duration() {
        let json = r#"{"streams": [{"index": 0, "codec_type": "video", "duration": "N/A"}]}"#;
        let data: FFProbeData = serde_json::from_str(json).unwrap();
        assert_eq!(data.duration_seconds(), None);
    }

    #[test]
    fn test_probe_missing_file_fails() {
        let result = probe_duration(Path::new("ffprobe"), Path::new("/nonexistent/video.mp4"));
        assert!(result.is_err());
    }
}
