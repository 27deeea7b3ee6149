//! FFmpeg-backed container writer
//!
//! Streams raw RGBA frames into an `ffmpeg` process over stdin. FFmpeg reads
//! rawvideo at a constant frame rate, so presentation timestamps are mapped
//! onto that grid: frames landing on an already-written slot are dropped and
//! gaps are filled by repeating the previous frame. Gaps longer than
//! `MAX_FILL_SECS` are treated as a discontinuity and cut.
//!
//! Pipe writes happen on a dedicated thread; appends only queue frames, and
//! the writer reports not-ready while that queue is full.

use super::traits::{
    AudioSample, MediaWriter, Track, VideoFrame, WriterError, WriterFactory, WriterRequest,
};
use crate::recorder::clock::NativeTime;
use crate::recorder::config::{ContainerFormat, EncoderSettings};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

const DEFAULT_FPS: f64 = 30.0;

/// Longest capture gap filled with repeated frames
const MAX_FILL_SECS: f64 = 2.0;

/// Frames queued for the pipe before the writer reports not-ready
const MAX_QUEUED_FRAMES: usize = 8;

type RawFrame = Arc<Vec<u8>>;

/// Video parameters pulled out of the encoder settings
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSpec {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub bitrate: Option<u64>,
}

impl VideoSpec {
    pub fn from_settings(settings: &EncoderSettings) -> Result<Self, WriterError> {
        let dimension = |key: &str| -> Result<u32, WriterError> {
            settings
                .get_u64(key)
                .filter(|v| *v > 0 && *v <= u32::MAX as u64)
                .map(|v| v as u32)
                .ok_or_else(|| WriterError::Unavailable(format!("video setting '{}' is required", key)))
        };

        let width = dimension("width")?;
        let height = dimension("height")?;
        let fps = settings.get_f64("fps").unwrap_or(DEFAULT_FPS);
        if !(fps.is_finite() && fps > 0.0) {
            return Err(WriterError::Unavailable(format!("invalid fps: {}", fps)));
        }

        let codec = match settings.get_str("codec").unwrap_or("h264") {
            "h264" | "avc" | "libx264" => "libx264",
            "hevc" | "h265" | "libx265" => "libx265",
            "prores" => "prores_ks",
            other => {
                return Err(WriterError::Unavailable(format!(
                    "unsupported video codec: {}",
                    other
                )))
            }
        };

        Ok(Self {
            width,
            height,
            fps,
            codec: codec.to_string(),
            bitrate: settings.get_u64("bitrate"),
        })
    }

    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Repeated frames allowed for one gap
    fn max_fill_frames(&self) -> u64 {
        (self.fps * MAX_FILL_SECS).ceil() as u64
    }
}

/// How to reach the slot of an incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FillPlan {
    /// Copies of the previous frame to write first
    repeats: u64,
    /// Slots cut from the timeline
    skipped: u64,
}

/// `None` when `slot` is already written
fn plan_fill(written: u64, slot: u64, max_repeats: u64) -> Option<FillPlan> {
    let gap = slot.checked_sub(written)?;
    let repeats = gap.min(max_repeats);
    Some(FillPlan {
        repeats,
        skipped: gap - repeats,
    })
}

/// Build the ffmpeg command line for a writer
pub fn build_writer_args(spec: &VideoSpec, format: ContainerFormat, output: &Path) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "-s".to_string(),
        format!("{}x{}", spec.width, spec.height),
        "-r".to_string(),
        spec.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:v".to_string(),
        spec.codec.clone(),
    ];

    if let Some(bitrate) = spec.bitrate {
        args.extend(["-b:v".to_string(), bitrate.to_string()]);
    }

    if spec.codec != "prores_ks" {
        args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
    }

    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-f".to_string(),
        format.muxer().to_string(),
        output.to_string_lossy().to_string(),
    ]);

    args
}

/// Creates `FfmpegWriter`s
#[derive(Debug, Clone)]
pub struct FfmpegWriterFactory {
    program: PathBuf,
}

impl FfmpegWriterFactory {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }

    /// Use a specific ffmpeg binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegWriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn open(&self, request: &WriterRequest) -> Result<Box<dyn MediaWriter>, WriterError> {
        if request.audio_settings.is_some() {
            return Err(WriterError::Unavailable(
                "ffmpeg writer does not accept a direct audio input".to_string(),
            ));
        }

        let spec = VideoSpec::from_settings(&request.video_settings)?;
        let args = build_writer_args(&spec, request.format, &request.output_path);

        Ok(Box::new(FfmpegWriter::new(
            self.program.clone(),
            args,
            request.output_path.clone(),
            spec,
        )))
    }
}

/// Drains queued frames into FFmpeg's stdin
fn pipe_thread(
    mut stdin: ChildStdin,
    frames: Receiver<RawFrame>,
    queued: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
) {
    for data in frames {
        let result = stdin.write_all(&data);
        queued.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = result {
            tracing::error!("FFmpeg pipe closed: {}", e);
            failed.store(true, Ordering::Release);
            break;
        }
    }
    // Dropping stdin signals EOF to FFmpeg
}

pub struct FfmpegWriter {
    program: PathBuf,
    args: Vec<String>,
    output_path: PathBuf,
    spec: VideoSpec,
    process: Option<Child>,
    frames: Option<Sender<RawFrame>>,
    pipe: Option<JoinHandle<()>>,
    queued: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
    session_start: Option<NativeTime>,
    /// Slots cut by discontinuities
    slot_offset: u64,
    frames_written: u64,
    last_frame: Option<RawFrame>,
}

impl FfmpegWriter {
    fn new(program: PathBuf, args: Vec<String>, output_path: PathBuf, spec: VideoSpec) -> Self {
        Self {
            program,
            args,
            output_path,
            spec,
            process: None,
            frames: None,
            pipe: None,
            queued: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicBool::new(false)),
            session_start: None,
            slot_offset: 0,
            frames_written: 0,
            last_frame: None,
        }
    }

    fn queue(&mut self, data: RawFrame) -> Result<(), WriterError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(WriterError::AppendFailed("FFmpeg pipe closed".to_string()));
        }
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| WriterError::AppendFailed("writer is not running".to_string()))?;

        self.queued.fetch_add(1, Ordering::AcqRel);
        if frames.send(data).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.failed.store(true, Ordering::Release);
            return Err(WriterError::AppendFailed("FFmpeg pipe closed".to_string()));
        }
        self.frames_written += 1;
        Ok(())
    }

    /// Index of the frame slot `at` falls on
    fn slot(&self, at: NativeTime) -> u64 {
        let start = self.session_start.map(|s| s.as_secs_f64()).unwrap_or(0.0);
        let raw = ((at.as_secs_f64() - start).max(0.0) * self.spec.fps).round() as u64;
        raw.saturating_sub(self.slot_offset)
    }

    /// Stop feeding FFmpeg and kill it. The pipe thread exits on its own
    /// once the process is gone.
    fn kill(&mut self) {
        drop(self.frames.take());
        drop(self.pipe.take());
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

#[async_trait]
impl MediaWriter for FfmpegWriter {
    fn start_writing(&mut self) -> Result<(), WriterError> {
        tracing::info!("Starting FFmpeg writer: {:?}", self.args);

        let mut process = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WriterError::StartFailed(format!("Failed to start FFmpeg: {}", e)))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| WriterError::StartFailed("Failed to capture FFmpeg stdin".to_string()))?;

        let (tx, rx) = mpsc::channel();
        let queued = self.queued.clone();
        let failed = self.failed.clone();
        let pipe = std::thread::Builder::new()
            .name("ffmpeg-video-pipe".to_string())
            .spawn(move || pipe_thread(stdin, rx, queued, failed));
        let pipe = match pipe {
            Ok(pipe) => pipe,
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(WriterError::StartFailed(format!(
                    "Failed to start FFmpeg pipe thread: {}",
                    e
                )));
            }
        };

        self.process = Some(process);
        self.frames = Some(tx);
        self.pipe = Some(pipe);
        Ok(())
    }

    fn start_session(&mut self, at: NativeTime) {
        if self.session_start.is_none() {
            self.session_start = Some(at);
        }
    }

    fn end_session(&mut self, at: NativeTime) {
        tracing::debug!(
            "FFmpeg writer session segment ends at {:.3}s ({} frames)",
            at.as_secs_f64(),
            self.frames_written
        );
    }

    fn is_ready(&self, track: Track) -> bool {
        track == Track::Video
            && self.frames.is_some()
            && !self.failed.load(Ordering::Acquire)
            && self.queued.load(Ordering::Acquire) < MAX_QUEUED_FRAMES
    }

    fn append_video(&mut self, frame: &VideoFrame, at: NativeTime) -> Result<(), WriterError> {
        if frame.data.len() != self.spec.frame_size() {
            return Err(WriterError::AppendFailed(format!(
                "frame is {} bytes, expected {} ({}x{} RGBA)",
                frame.data.len(),
                self.spec.frame_size(),
                self.spec.width,
                self.spec.height
            )));
        }

        let max_repeats = match self.last_frame {
            Some(_) => self.spec.max_fill_frames(),
            None => 0,
        };
        let Some(plan) = plan_fill(self.frames_written, self.slot(at), max_repeats) else {
            // Slot already filled
            return Ok(());
        };

        if plan.skipped > 0 {
            tracing::warn!(
                "Capture gap of {:.3}s at frame {}, cutting {} frames",
                (plan.repeats + plan.skipped) as f64 / self.spec.fps,
                self.frames_written,
                plan.skipped
            );
            self.slot_offset += plan.skipped;
        }

        if let Some(previous) = self.last_frame.clone() {
            for _ in 0..plan.repeats {
                self.queue(previous.clone())?;
            }
        }

        let data = Arc::new(frame.data.clone());
        self.queue(data.clone())?;
        self.last_frame = Some(data);
        Ok(())
    }

    fn append_audio(&mut self, _sample: &AudioSample, _at: NativeTime) -> Result<(), WriterError> {
        Err(WriterError::AppendFailed(
            "ffmpeg writer has no audio input".to_string(),
        ))
    }

    async fn finish(&mut self) -> Result<(), WriterError> {
        // The pipe thread drains what is queued, then closes stdin
        drop(self.frames.take());
        let pipe = self.pipe.take();

        let process = self
            .process
            .take()
            .ok_or_else(|| WriterError::FinishFailed("writer was never started".to_string()))?;

        let output = tokio::task::spawn_blocking(move || {
            if let Some(pipe) = pipe {
                let _ = pipe.join();
            }
            process.wait_with_output()
        })
        .await
        .map_err(|e| WriterError::FinishFailed(format!("FFmpeg wait task failed: {}", e)))?
        .map_err(|e| WriterError::FinishFailed(format!("Failed to wait for FFmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WriterError::FinishFailed(format!(
                "FFmpeg exited with error: {}",
                stderr
            )));
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(WriterError::FinishFailed(
                "FFmpeg pipe closed before all frames were written".to_string(),
            ));
        }

        tracing::info!(
            "FFmpeg writer finished: {} frames written to {:?}",
            self.frames_written,
            self.output_path
        );
        Ok(())
    }

    fn cancel(&mut self) {
        self.kill();
        if let Err(e) = std::fs::remove_file(&self.output_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove partial output {:?}: {}", self.output_path, e);
            }
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EncoderSettings {
        EncoderSettings::new()
            .with("width", 640)
            .with("height", 480)
            .with("fps", 25)
    }

    #[test]
    fn test_spec_from_settings() {
        let spec = VideoSpec::from_settings(&settings().with("bitrate", 2_000_000)).unwrap();
        assert_eq!(spec.width, 640);
        assert_eq!(spec.fps, 25.0);
        assert_eq!(spec.codec, "libx264");
        assert_eq!(spec.bitrate, Some(2_000_000));
    }

    #[test]
    fn test_spec_requires_dimensions() {
        let err = VideoSpec::from_settings(&EncoderSettings::new().with("width", 640)).unwrap_err();
        assert!(err.to_string().contains("height"));
    }

    #[test]
    fn test_spec_rejects_unknown_codec() {
        assert!(VideoSpec::from_settings(&settings().with("codec", "theora")).is_err());
    }

    #[test]
    fn test_writer_args() {
        let spec = VideoSpec::from_settings(&settings()).unwrap();
        let args = build_writer_args(&spec, ContainerFormat::Mov, Path::new("/tmp/out.mov"));
        assert!(args.windows(2).any(|w| w == ["-s", "640x480"]));
        assert!(args.windows(2).any(|w| w == ["-f", "mov"]));
        assert!(args.windows(2).any(|w| w == ["-movflags", "+faststart"]));
        assert_eq!(args.last().unwrap(), "/tmp/out.mov");
    }

    #[test]
    fn test_plan_fill() {
        assert_eq!(plan_fill(5, 4, 50), None);
        assert_eq!(plan_fill(5, 5, 50), Some(FillPlan { repeats: 0, skipped: 0 }));
        assert_eq!(plan_fill(5, 8, 50), Some(FillPlan { repeats: 3, skipped: 0 }));
        assert_eq!(
            plan_fill(1, 25_000, 50),
            Some(FillPlan {
                repeats: 50,
                skipped: 24_949
            })
        );
        assert_eq!(plan_fill(0, 7, 0), Some(FillPlan { repeats: 0, skipped: 7 }));
    }

    #[test]
    fn test_max_fill_frames() {
        let spec = VideoSpec::from_settings(&settings()).unwrap();
        assert_eq!(spec.max_fill_frames(), 50);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_long_gap_is_cut() {
        let spec = VideoSpec {
            width: 2,
            height: 2,
            fps: 25.0,
            codec: "libx264".to_string(),
            bitrate: None,
        };
        let mut writer = FfmpegWriter::new(
            PathBuf::from("sh"),
            vec!["-c".to_string(), "cat > /dev/null".to_string()],
            PathBuf::from("/tmp/dualcap-unused.mp4"),
            spec,
        );
        writer.start_writing().unwrap();
        writer.start_session(NativeTime::zero(600));

        let frame = VideoFrame::new(2, 2, vec![0; 16]);
        writer.append_video(&frame, NativeTime::zero(600)).unwrap();
        // A thousand seconds later
        writer
            .append_video(&frame, NativeTime { value: 600_000, timescale: 600 })
            .unwrap();
        assert_eq!(writer.frames_written, 52);

        // Later frames keep their spacing after the cut
        writer
            .append_video(&frame, NativeTime { value: 600_024, timescale: 600 })
            .unwrap();
        assert_eq!(writer.frames_written, 53);

        writer.finish().await.unwrap();
    }

    #[test]
    fn test_factory_refuses_direct_audio() {
        let request = WriterRequest {
            output_path: PathBuf::from("/tmp/out.mp4"),
            format: ContainerFormat::Mp4,
            video_settings: settings(),
            video_format_hint: None,
            audio_settings: Some(EncoderSettings::new().with("codec", "aac")),
            audio_format_hint: None,
            timescale: 600,
        };
        let err = FfmpegWriterFactory::new().open(&request).err().unwrap();
        assert!(matches!(err, WriterError::Unavailable(_)));
    }
}
