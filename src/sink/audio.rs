//! Audio sink
//!
//! Either drives a standalone recorder writing a private side file (merged
//! after finish) or appends samples straight into the container writer.
//! A side recorder that cannot be created or started degrades the session
//! to silent video; it never fails it.

use super::traits::{
    AudioRecorderFactory, AudioSample, MediaWriter, SideAudioRecorder, Track, WriterError,
};
use crate::recorder::clock::NativeTime;
use crate::recorder::config::AudioMode;
use crate::recorder::scratch::{ScratchFile, ScratchSpace};
use crate::utils::error::SessionWarning;
use std::time::Duration;

/// Side audio file extension
pub const SIDE_AUDIO_EXTENSION: &str = "m4a";

/// Side recorder plus the scratch file it writes
pub struct SideFileAudio {
    recorder: Box<dyn SideAudioRecorder>,
    file: ScratchFile,
    lead: Duration,
    recording: bool,
}

pub enum AudioSink {
    SideFile(SideFileAudio),
    Direct { dropped: u64 },
    /// Side recorder unavailable; output will be silent
    Silent,
}

impl AudioSink {
    /// Create a side recorder writing to a fresh scratch file
    pub fn side_file(
        factory: &dyn AudioRecorderFactory,
        scratch: &ScratchSpace,
        lead: Duration,
    ) -> (Self, Option<SessionWarning>) {
        let file = scratch.allocate(SIDE_AUDIO_EXTENSION);
        match factory.create(file.path()) {
            Ok(recorder) => {
                tracing::info!("Side audio recorder created: {:?}", file.path());
                (
                    AudioSink::SideFile(SideFileAudio {
                        recorder,
                        file,
                        lead,
                        recording: false,
                    }),
                    None,
                )
            }
            Err(e) => {
                tracing::warn!("Side audio unavailable, recording video only: {}", e);
                (
                    AudioSink::Silent,
                    Some(SessionWarning::AudioUnavailable(e.to_string())),
                )
            }
        }
    }

    pub fn direct() -> Self {
        AudioSink::Direct { dropped: 0 }
    }

    pub fn mode(&self) -> AudioMode {
        match self {
            AudioSink::Direct { .. } => AudioMode::Direct,
            AudioSink::SideFile(_) | AudioSink::Silent => AudioMode::SideFile,
        }
    }

    /// Start or resume capture alongside the video session
    pub async fn resume(&mut self) -> Option<SessionWarning> {
        let AudioSink::SideFile(side) = self else {
            return None;
        };

        if side.recording {
            side.recorder.resume();
            return None;
        }

        match side.recorder.record(side.lead).await {
            Ok(()) => {
                tracing::info!("Side audio recording, lead {:?}", side.lead);
                side.recording = true;
                None
            }
            Err(e) => {
                tracing::warn!("Side audio failed to start, recording video only: {}", e);
                // Dropping the side recorder releases and deletes its file
                *self = AudioSink::Silent;
                Some(SessionWarning::AudioUnavailable(e.to_string()))
            }
        }
    }

    pub fn pause(&mut self) {
        if let AudioSink::SideFile(side) = self {
            if side.recording {
                side.recorder.pause();
            }
        }
    }

    /// Direct mode: append into the container, dropping when not ready.
    /// Returns whether the sample was written.
    pub fn append(
        &mut self,
        writer: &mut dyn MediaWriter,
        sample: &AudioSample,
        at: NativeTime,
    ) -> Result<bool, WriterError> {
        let AudioSink::Direct { dropped } = self else {
            return Ok(false);
        };
        if !writer.is_ready(Track::Audio) {
            *dropped += 1;
            return Ok(false);
        }
        writer.append_audio(sample, at)?;
        Ok(true)
    }

    /// Stop the side recorder and hand over its finished file.
    ///
    /// Returns `None` when there is nothing to merge. The sink is left
    /// silent either way.
    pub async fn finish(&mut self) -> (Option<ScratchFile>, Option<SessionWarning>) {
        let mut side = match std::mem::replace(self, AudioSink::Silent) {
            AudioSink::SideFile(side) => side,
            other => {
                *self = other;
                return (None, None);
            }
        };

        if !side.recording {
            return (None, None);
        }

        match side.recorder.stop().await {
            Ok(()) => {
                tracing::info!("Side audio stopped: {:?}", side.file.path());
                (Some(side.file), None)
            }
            Err(e) => {
                tracing::warn!("Side audio failed to stop cleanly: {}", e);
                (None, Some(SessionWarning::AudioUnavailable(e.to_string())))
            }
        }
    }

    /// Stop capture and delete the side file
    pub async fn cancel(&mut self) -> Option<SessionWarning> {
        let mut side = match std::mem::replace(self, AudioSink::Silent) {
            AudioSink::SideFile(side) => side,
            other => {
                *self = other;
                return None;
            }
        };

        if side.recording {
            if let Err(e) = side.recorder.stop().await {
                tracing::debug!("Ignoring side audio stop error on cancel: {}", e);
            }
        }
        // Release the recorder's handle before deleting
        drop(side.recorder);

        match side.file.remove() {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Failed to delete side audio file: {}", e);
                Some(SessionWarning::CleanupFailed(e.to_string()))
            }
        }
    }
}
