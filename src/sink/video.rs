//! Video sink
//!
//! Wraps the container writer's video input. Frames the writer is not ready
//! for are dropped on the spot: real-time media has no backlog budget.

use super::traits::{MediaWriter, Track, VideoFrame, WriterError, WriterFactory, WriterRequest};
use crate::recorder::clock::{Clock, NativeTime};
use crate::utils::error::{RecorderError, RecorderResult};

/// Result of a single append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Written,
    /// Writer was not ready for more data
    DroppedNotReady,
    /// Timestamp did not advance past the previous frame
    DroppedOutOfOrder,
}

pub struct VideoSink {
    writer: Box<dyn MediaWriter>,
    session_open: bool,
    last_pts: Option<NativeTime>,
    appended: u64,
    dropped: u64,
}

impl VideoSink {
    /// Create the writer and start it.
    ///
    /// Fails with `Setup` if the writer cannot be created for these settings
    /// and `WriterStart` if it refuses to start.
    pub fn open(factory: &dyn WriterFactory, request: &WriterRequest) -> RecorderResult<Self> {
        let mut writer = factory.open(request).map_err(|e| {
            tracing::error!("Failed to open writer for {:?}: {}", request.output_path, e);
            RecorderError::Setup(e.to_string())
        })?;

        if let Err(e) = writer.start_writing() {
            tracing::error!("Writer rejected start for {:?}: {}", request.output_path, e);
            writer.cancel();
            return Err(RecorderError::WriterStart(e.to_string()));
        }

        tracing::info!(
            "Video sink opened: {:?} ({})",
            request.output_path,
            request.format.extension()
        );

        Ok(Self {
            writer,
            session_open: false,
            last_pts: None,
            appended: 0,
            dropped: 0,
        })
    }

    pub fn start_session(&mut self, at: NativeTime) {
        if self.session_open {
            return;
        }
        tracing::debug!("Video session start at {:.3}s", at.as_secs_f64());
        self.writer.start_session(at);
        self.session_open = true;
    }

    pub fn end_session(&mut self, at: NativeTime) {
        if !self.session_open {
            return;
        }
        tracing::debug!("Video session end at {:.3}s", at.as_secs_f64());
        self.writer.end_session(at);
        self.session_open = false;
    }

    pub fn is_session_open(&self) -> bool {
        self.session_open
    }

    /// Append a frame at session time `at_secs`
    pub fn append(
        &mut self,
        frame: &VideoFrame,
        at_secs: f64,
        clock: &Clock,
    ) -> Result<Appended, WriterError> {
        let pts = clock.to_native(at_secs);

        if self.last_pts.is_some_and(|last| pts <= last) {
            self.dropped += 1;
            return Ok(Appended::DroppedOutOfOrder);
        }
        if !self.session_open || !self.writer.is_ready(Track::Video) {
            self.dropped += 1;
            tracing::trace!("Writer not ready, dropping frame at {:.3}s", at_secs);
            return Ok(Appended::DroppedNotReady);
        }

        self.writer.append_video(frame, pts)?;
        self.last_pts = Some(pts);
        self.appended += 1;
        Ok(Appended::Written)
    }

    pub fn last_pts(&self) -> Option<NativeTime> {
        self.last_pts
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Flush and close the container
    pub async fn finish(&mut self) -> Result<(), WriterError> {
        tracing::info!(
            "Finishing video sink: {} frames written, {} dropped",
            self.appended,
            self.dropped
        );
        self.writer.finish().await
    }

    pub fn cancel(&mut self) {
        tracing::info!("Cancelling video sink");
        self.writer.cancel();
    }

    /// Direct-mode audio shares the container writer
    pub(crate) fn writer_mut(&mut self) -> &mut dyn MediaWriter {
        self.writer.as_mut()
    }
}
