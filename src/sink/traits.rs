//! Sink-side collaborator traits
//!
//! The container writer and the standalone audio recorder are external to
//! the session; these traits are the contract the session relies on.

use crate::recorder::clock::NativeTime;
use crate::recorder::config::{ContainerFormat, EncoderSettings};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// A decoded video frame (tightly packed RGBA)
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { width, height, data }
    }
}

/// An opaque chunk of encoded or PCM audio for direct mode
#[derive(Debug, Clone)]
pub struct AudioSample {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Tracks a container writer can accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Video,
    Audio,
}

/// Everything a writer needs to create the container
#[derive(Debug, Clone)]
pub struct WriterRequest {
    pub output_path: PathBuf,
    pub format: ContainerFormat,
    pub video_settings: EncoderSettings,
    pub video_format_hint: Option<String>,
    /// Present only in direct audio mode
    pub audio_settings: Option<EncoderSettings>,
    pub audio_format_hint: Option<String>,
    pub timescale: u32,
}

/// Container writer errors
#[derive(Error, Debug)]
pub enum WriterError {
    /// Writer could not be created or cannot take an input with these settings
    #[error("Writer unavailable: {0}")]
    Unavailable(String),

    #[error("Writer failed to start: {0}")]
    StartFailed(String),

    #[error("Failed to append sample: {0}")]
    AppendFailed(String),

    #[error("Failed to finish writing: {0}")]
    FinishFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The underlying container writer.
///
/// Appends are only valid between `start_session` and `end_session`, and
/// only when `is_ready` reports the track can take more data.
#[async_trait]
pub trait MediaWriter: Send {
    fn start_writing(&mut self) -> Result<(), WriterError>;

    fn start_session(&mut self, at: NativeTime);

    fn end_session(&mut self, at: NativeTime);

    fn is_ready(&self, track: Track) -> bool;

    fn append_video(&mut self, frame: &VideoFrame, at: NativeTime) -> Result<(), WriterError>;

    fn append_audio(&mut self, sample: &AudioSample, at: NativeTime) -> Result<(), WriterError>;

    /// Flush and close. Resolves once the container is complete on disk.
    async fn finish(&mut self) -> Result<(), WriterError>;

    /// Abandon without flushing. Best effort.
    fn cancel(&mut self);
}

/// Creates container writers
pub trait WriterFactory: Send + Sync {
    fn open(&self, request: &WriterRequest) -> Result<Box<dyn MediaWriter>, WriterError>;
}

/// Side audio recorder errors
#[derive(Error, Debug)]
pub enum AudioRecorderError {
    #[error("No audio input device available")]
    NoDevice,

    #[error("Failed to create audio recorder: {0}")]
    CreateFailed(String),

    #[error("Failed to start audio recorder: {0}")]
    StartFailed(String),

    #[error("Failed to stop audio recorder: {0}")]
    StopFailed(String),
}

/// Standalone audio recorder writing to its own file
#[async_trait]
pub trait SideAudioRecorder: Send {
    /// Begin recording `lead` after now. Resolves once capture is running
    /// or has failed to start.
    async fn record(&mut self, lead: Duration) -> Result<(), AudioRecorderError>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Stop and close the file. Resolves once the file is complete.
    async fn stop(&mut self) -> Result<(), AudioRecorderError>;
}

/// Creates side audio recorders writing to a given path
pub trait AudioRecorderFactory: Send + Sync {
    fn create(&self, path: &Path) -> Result<Box<dyn SideAudioRecorder>, AudioRecorderError>;
}
