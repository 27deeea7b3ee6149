//! Write-side adapters
//!
//! - `VideoSink` wraps the container writer's video input
//! - `AudioSink` drives the side recorder or the writer's audio input
//! - `FfmpegWriterFactory` is a container writer backed by an ffmpeg process

pub mod audio;
pub mod ffmpeg;
pub mod traits;
pub mod video;

pub use audio::AudioSink;
pub use ffmpeg::FfmpegWriterFactory;
pub use traits::{
    AudioRecorderError, AudioRecorderFactory, AudioSample, MediaWriter, SideAudioRecorder, Track,
    VideoFrame, WriterError, WriterFactory, WriterRequest,
};
pub use video::{Appended, VideoSink};
