//! FFmpeg-backed merge service
//!
//! Probes containers with `ffprobe` and renders compositions with `ffmpeg`.
//! Audio is padded with silence and the output cut to the composition's
//! time range, so a short side file leaves a silent tail and a long one is
//! trimmed.

use super::types::{
    Composition, ExportPreset, MergeError, MergeService, Transform, VideoTrackInfo,
};
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// How often a running export checks its cancel flag
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parse `ffprobe -print_format json` output for the first video stream
pub fn parse_probe_output(json: &str) -> Result<VideoTrackInfo, MergeError> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| MergeError::Probe(format!("Failed to parse ffprobe output: {}", e)))?;

    let stream = value
        .get("streams")
        .and_then(|s| s.as_array())
        .and_then(|streams| streams.first())
        .ok_or_else(|| MergeError::Probe("No video stream found".to_string()))?;

    let parse_secs = |v: Option<&serde_json::Value>| {
        v.and_then(|d| d.as_str())
            .and_then(|s| s.parse::<f64>().ok())
    };

    // Stream duration is exact; container duration is the fallback
    let duration_secs = parse_secs(stream.get("duration"))
        .or_else(|| parse_secs(value.get("format").and_then(|f| f.get("duration"))))
        .ok_or_else(|| MergeError::Probe("Video duration unknown".to_string()))?;

    // Older muxers write a rotate tag; newer ones a display matrix whose
    // rotation is counter-clockwise
    let rotation = stream
        .get("tags")
        .and_then(|t| t.get("rotate"))
        .and_then(|r| r.as_str())
        .and_then(|r| r.parse::<i32>().ok())
        .or_else(|| {
            stream
                .get("side_data_list")
                .and_then(|l| l.as_array())
                .and_then(|list| {
                    list.iter()
                        .find_map(|entry| entry.get("rotation").and_then(|r| r.as_f64()))
                })
                .map(|r| -(r.round() as i32))
        })
        .unwrap_or(0);

    Ok(VideoTrackInfo {
        duration_secs,
        transform: Transform::rotation(rotation),
    })
}

/// Build the ffmpeg command line that renders a composition
pub fn build_export_args(composition: &Composition, output: &Path, preset: ExportPreset) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-loglevel".to_string(), "error".to_string()];

    for track in [&composition.video, &composition.audio] {
        if track.insert_at_secs > 0.0 {
            args.extend(["-itsoffset".to_string(), track.insert_at_secs.to_string()]);
        }
        args.extend(["-i".to_string(), track.source.to_string_lossy().to_string()]);
    }

    if composition.time_range.start_secs > 0.0 {
        args.extend(["-ss".to_string(), composition.time_range.start_secs.to_string()]);
    }

    args.extend([
        "-map".to_string(),
        format!("0:v:{}", composition.video.source_track),
        "-map".to_string(),
        format!("1:a:{}", composition.audio.source_track),
    ]);

    match preset {
        ExportPreset::Highest => {
            args.extend(["-c:v".to_string(), "copy".to_string()]);
            // Stream copy keeps frames as stored; carry the orientation over
            if !composition.video_transform.is_identity() {
                args.extend([
                    "-metadata:s:v:0".to_string(),
                    format!("rotate={}", composition.video_transform.rotation_degrees),
                ]);
            }
        }
        ExportPreset::Balanced => {
            // Re-encoding applies the source rotation to the pixels
            args.extend([
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "medium".to_string(),
                "-crf".to_string(),
                "23".to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
            ]);
        }
    }

    let audio_bitrate = match preset {
        ExportPreset::Highest => "256k",
        ExportPreset::Balanced => "128k",
    };

    args.extend([
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        audio_bitrate.to_string(),
        "-af".to_string(),
        "apad".to_string(),
        "-t".to_string(),
        format!("{:.6}", composition.time_range.duration_secs),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().to_string(),
    ]);

    args
}

/// Drive `task` to completion unless `cancel` is raised first
async fn run_until_cancelled<F: Future>(task: F, cancel: &AtomicBool) -> Option<F::Output> {
    tokio::pin!(task);
    loop {
        tokio::select! {
            output = &mut task => return Some(output),
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                if cancel.swap(false, Ordering::SeqCst) {
                    return None;
                }
            }
        }
    }
}

/// Merge service running the `ffmpeg` and `ffprobe` binaries
#[derive(Debug, Clone)]
pub struct FfmpegMergeService {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    cancel_flag: Arc<AtomicBool>,
}

impl FfmpegMergeService {
    pub fn new() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_programs(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting this flag aborts a running export with `Cancelled`. Each
    /// export clears it when it starts.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }
}

impl Default for FfmpegMergeService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MergeService for FfmpegMergeService {
    async fn probe_video(&self, path: &Path) -> Result<VideoTrackInfo, MergeError> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .args(["-select_streams", "v:0"])
            .arg(path)
            .output()
            .await
            .map_err(|e| MergeError::Probe(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(MergeError::Probe(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn export(
        &self,
        composition: &Composition,
        output: &Path,
        preset: ExportPreset,
    ) -> Result<(), MergeError> {
        self.cancel_flag.store(false, Ordering::SeqCst);
        let args = build_export_args(composition, output, preset);
        tracing::info!("Starting FFmpeg export: {:?}", args);

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MergeError::Export(format!("Failed to start FFmpeg: {}", e)))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        let status = match run_until_cancelled(child.wait(), &self.cancel_flag).await {
            Some(status) => status?,
            None => {
                tracing::info!("Cancelling FFmpeg export");
                let _ = child.kill().await;
                return Err(MergeError::Cancelled);
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match status.code() {
            Some(0) => {
                tracing::info!("FFmpeg export finished: {:?}", output);
                Ok(())
            }
            // Killed by a signal
            None => Err(MergeError::Cancelled),
            Some(code) => Err(MergeError::Export(format!(
                "FFmpeg exited with code {}: {}",
                code,
                stderr.trim()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::types::VideoTrackInfo;

    fn composition(rotation: i32, duration: f64) -> Composition {
        Composition::video_with_audio(
            Path::new("/rec/out.mp4"),
            Path::new("/tmp/side.m4a"),
            &VideoTrackInfo {
                duration_secs: duration,
                transform: Transform::rotation(rotation),
            },
        )
    }

    #[test]
    fn test_parse_probe_stream_duration() {
        let json = r#"{
            "streams": [{ "codec_type": "video", "duration": "29.000000", "tags": { "rotate": "90" } }],
            "format": { "duration": "29.050000" }
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration_secs, 29.0);
        assert_eq!(info.transform.rotation_degrees, 90);
    }

    #[test]
    fn test_parse_probe_display_matrix() {
        let json = r#"{
            "streams": [{ "side_data_list": [{ "side_data_type": "Display Matrix", "rotation": -90 }] }],
            "format": { "duration": "12.5" }
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration_secs, 12.5);
        assert_eq!(info.transform.rotation_degrees, 90);
    }

    #[test]
    fn test_parse_probe_without_streams() {
        assert!(matches!(
            parse_probe_output(r#"{ "streams": [] }"#),
            Err(MergeError::Probe(_))
        ));
    }

    #[test]
    fn test_export_args_bound_to_video_duration() {
        let args = build_export_args(&composition(0, 29.0), Path::new("/rec/tmp.mp4"), ExportPreset::Highest);
        assert!(args.windows(2).any(|w| w == ["-t", "29.000000"]));
        assert!(args.windows(2).any(|w| w == ["-af", "apad"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-map", "1:a:0"]));
        assert!(!args.iter().any(|a| a.starts_with("rotate=")));
        assert_eq!(args.last().unwrap(), "/rec/tmp.mp4");
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_waiting() {
        let cancel = Arc::new(AtomicBool::new(false));
        let raise = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            raise.store(true, Ordering::SeqCst);
        });

        let output = run_until_cancelled(std::future::pending::<()>(), &cancel).await;

        assert!(output.is_none());
        assert!(!cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finished_task_wins_over_cancel_poll() {
        let cancel = AtomicBool::new(false);
        assert_eq!(run_until_cancelled(async { 7 }, &cancel).await, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_cancel_cleared_by_next_export() {
        let dir = tempfile::tempdir().unwrap();
        let service = FfmpegMergeService::with_programs("true", "true");
        let cancel = service.cancel_handle();

        // Raised with no export running
        cancel.store(true, Ordering::SeqCst);

        service
            .export(&composition(0, 1.0), &dir.path().join("merged.mp4"), ExportPreset::Highest)
            .await
            .unwrap();
        assert!(!cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_export_args_carry_rotation() {
        let args = build_export_args(&composition(270, 5.0), Path::new("/o.mp4"), ExportPreset::Highest);
        assert!(args.windows(2).any(|w| w == ["-metadata:s:v:0", "rotate=270"]));

        let args = build_export_args(&composition(270, 5.0), Path::new("/o.mp4"), ExportPreset::Balanced);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(!args.iter().any(|a| a.starts_with("rotate=")));
    }
}
