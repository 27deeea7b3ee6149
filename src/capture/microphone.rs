//! Microphone side recorder
//!
//! Captures the input device with cpal on a dedicated thread (cpal streams
//! are not `Send`) and pipes PCM into an ffmpeg AAC encoder that writes the
//! side file. Samples are discarded until the start lead has elapsed and
//! while paused.

use crate::sink::traits::{AudioRecorderError, AudioRecorderFactory, SideAudioRecorder};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn find_input_device(device_name: Option<&str>) -> Option<Device> {
    let host = cpal::default_host();
    match device_name {
        Some(name) => host
            .input_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
        None => host.default_input_device(),
    }
}

/// Decides whether captured samples are kept
#[derive(Debug, Clone)]
struct Gate {
    opens_at: Instant,
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl Gate {
    fn is_open(&self, now: Instant) -> bool {
        now >= self.opens_at
            && !self.paused.load(Ordering::Relaxed)
            && !self.stopped.load(Ordering::Relaxed)
    }
}

/// Creates `CpalSideRecorder`s on the default (or a named) input device
#[derive(Debug, Clone, Default)]
pub struct CpalRecorderFactory {
    device_name: Option<String>,
    ffmpeg: Option<PathBuf>,
}

impl CpalRecorderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn with_ffmpeg(mut self, program: impl Into<PathBuf>) -> Self {
        self.ffmpeg = Some(program.into());
        self
    }
}

impl AudioRecorderFactory for CpalRecorderFactory {
    fn create(&self, path: &Path) -> Result<Box<dyn SideAudioRecorder>, AudioRecorderError> {
        let device =
            find_input_device(self.device_name.as_deref()).ok_or(AudioRecorderError::NoDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let config = device.default_input_config().map_err(|e| {
            AudioRecorderError::CreateFailed(format!("Failed to get audio config: {}", e))
        })?;

        tracing::info!(
            "Microphone recorder created: {} ({}Hz, {}ch, {:?})",
            device_name,
            config.sample_rate().0,
            config.channels(),
            config.sample_format()
        );

        Ok(Box::new(CpalSideRecorder {
            device_name: self.device_name.clone(),
            ffmpeg: self.ffmpeg.clone().unwrap_or_else(|| PathBuf::from("ffmpeg")),
            path: path.to_path_buf(),
            paused: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            thread: None,
        }))
    }
}

pub struct CpalSideRecorder {
    device_name: Option<String>,
    ffmpeg: PathBuf,
    path: PathBuf,
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), String>>>,
}

#[async_trait]
impl SideAudioRecorder for CpalSideRecorder {
    async fn record(&mut self, lead: Duration) -> Result<(), AudioRecorderError> {
        if self.thread.is_some() {
            return Ok(());
        }

        let gate = Gate {
            opens_at: Instant::now() + lead,
            paused: self.paused.clone(),
            stopped: self.stopped.clone(),
        };
        let device_name = self.device_name.clone();
        let ffmpeg = self.ffmpeg.clone();
        let path = self.path.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = std::thread::Builder::new()
            .name("side-audio".to_string())
            .spawn(move || capture_thread(device_name, ffmpeg, path, gate, ready_tx))
            .map_err(|e| AudioRecorderError::StartFailed(e.to_string()))?;

        // A thread that failed setup returns right after reporting; it is
        // left to exit on its own
        match ready_rx.await {
            Ok(Ok(())) => {
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(message)) => Err(AudioRecorderError::StartFailed(message)),
            Err(_) => Err(AudioRecorderError::StartFailed(
                "capture thread exited before starting".to_string(),
            )),
        }
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    async fn stop(&mut self) -> Result<(), AudioRecorderError> {
        self.stopped.store(true, Ordering::Relaxed);

        let Some(handle) = self.thread.take() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|e| AudioRecorderError::StopFailed(e.to_string()))?
            .map_err(|_| AudioRecorderError::StopFailed("capture thread panicked".to_string()))?
            .map_err(AudioRecorderError::StopFailed)
    }
}

/// Signals the capture thread and detaches it. The thread closes the
/// stream and the encoder by itself; `stop` is the way to wait for that.
impl Drop for CpalSideRecorder {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
        if self.thread.take().is_some() {
            tracing::debug!("Side audio recorder dropped while capturing: {:?}", self.path);
        }
    }
}

fn encoder_args(sample_rate: u32, channels: u16, path: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "f32le".to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-ac".to_string(),
        channels.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        "-f".to_string(),
        "ipod".to_string(),
        path.to_string_lossy().to_string(),
    ]
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    gate: Gate,
    tx: Sender<Vec<f32>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if gate.is_open(Instant::now()) {
                let _ = tx.send(data.iter().map(|s| s.to_sample::<f32>()).collect());
            }
        },
        |err| tracing::error!("Audio stream error: {}", err),
        None,
    )
}

/// Owns the cpal stream and the encoder for the lifetime of the recording
fn capture_thread(
    device_name: Option<String>,
    ffmpeg: PathBuf,
    path: PathBuf,
    gate: Gate,
    ready: oneshot::Sender<Result<(), String>>,
) -> Result<(), String> {
    let stopped = gate.stopped.clone();

    let setup = || -> Result<(cpal::Stream, std::process::Child, Receiver<Vec<f32>>), String> {
        let device = find_input_device(device_name.as_deref())
            .ok_or_else(|| "audio input device disappeared".to_string())?;
        let supported = device
            .default_input_config()
            .map_err(|e| format!("Failed to get audio config: {}", e))?;
        let config: StreamConfig = supported.config();

        let child = Command::new(&ffmpeg)
            .args(encoder_args(config.sample_rate.0, config.channels, &path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("Failed to start audio encoder: {}", e))?;

        let (tx, rx) = mpsc::channel();
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, gate.clone(), tx),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, gate.clone(), tx),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, gate.clone(), tx),
            other => return Err(format!("Unsupported sample format: {:?}", other)),
        }
        .map_err(|e| format!("Failed to build input stream: {}", e))?;

        stream
            .play()
            .map_err(|e| format!("Failed to start input stream: {}", e))?;

        Ok((stream, child, rx))
    };

    let (stream, mut child, rx) = match setup() {
        Ok(parts) => {
            let _ = ready.send(Ok(()));
            parts
        }
        Err(message) => {
            let _ = ready.send(Err(message.clone()));
            return Err(message);
        }
    };

    let mut stdin = child.stdin.take();
    let mut write_chunk = |chunk: Vec<f32>| {
        if let Some(pipe) = stdin.as_mut() {
            let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
            if let Err(e) = pipe.write_all(&bytes) {
                tracing::error!("Audio encoder pipe closed: {}", e);
                stdin = None;
            }
        }
    };

    loop {
        match rx.recv_timeout(DRAIN_POLL_INTERVAL) {
            Ok(chunk) => write_chunk(chunk),
            Err(RecvTimeoutError::Timeout) if stopped.load(Ordering::Relaxed) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(stream);
    for chunk in rx.try_iter() {
        write_chunk(chunk);
    }
    drop(write_chunk);
    drop(stdin);

    let status = child
        .wait()
        .map_err(|e| format!("Failed to wait for audio encoder: {}", e))?;
    if !status.success() {
        return Err(format!("Audio encoder exited with {}", status));
    }

    tracing::info!("Side audio written: {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(lead: Duration) -> (Gate, Instant) {
        let now = Instant::now();
        (
            Gate {
                opens_at: now + lead,
                paused: Arc::new(AtomicBool::new(false)),
                stopped: Arc::new(AtomicBool::new(false)),
            },
            now,
        )
    }

    #[test]
    fn test_gate_waits_for_lead() {
        let (gate, now) = gate(Duration::from_millis(200));
        assert!(!gate.is_open(now));
        assert!(!gate.is_open(now + Duration::from_millis(199)));
        assert!(gate.is_open(now + Duration::from_millis(200)));
    }

    #[test]
    fn test_gate_closed_while_paused_or_stopped() {
        let (gate, now) = gate(Duration::ZERO);
        gate.paused.store(true, Ordering::Relaxed);
        assert!(!gate.is_open(now));
        gate.paused.store(false, Ordering::Relaxed);
        assert!(gate.is_open(now));
        gate.stopped.store(true, Ordering::Relaxed);
        assert!(!gate.is_open(now));
    }

    #[test]
    fn test_encoder_args() {
        let args = encoder_args(48000, 2, Path::new("/tmp/a.m4a"));
        assert!(args.windows(2).any(|w| w == ["-ar", "48000"]));
        assert!(args.windows(2).any(|w| w == ["-ac", "2"]));
        assert_eq!(args.last().unwrap(), "/tmp/a.m4a");
    }

    #[tokio::test]
    async fn test_record_reports_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = CpalSideRecorder {
            device_name: Some("dualcap-no-such-input".to_string()),
            ffmpeg: PathBuf::from("ffmpeg"),
            path: dir.path().join("side.m4a"),
            paused: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            thread: None,
        };

        let err = recorder.record(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, AudioRecorderError::StartFailed(_)));
        assert!(recorder.thread.is_none());

        // Nothing to wait for after a failed start
        recorder.stop().await.unwrap();
    }
}
