//! Session clock
//!
//! Maps capture timestamps (seconds on the capture subsystem's clock) onto
//! the session timeline written into the container.

use serde::{Deserialize, Serialize};

/// A time value in the writer's native representation: `value / timescale`
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NativeTime {
    pub value: i64,
    pub timescale: u32,
}

impl NativeTime {
    pub fn zero(timescale: u32) -> Self {
        Self { value: 0, timescale }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.value as f64 / self.timescale as f64
    }
}

/// Session clock.
///
/// `start_offset` is fixed by the first video frame after the session starts
/// recording and is never reset. Paused intervals are accumulated separately
/// so session time, and therefore duration, only counts time spent
/// recording.
#[derive(Debug, Clone)]
pub struct Clock {
    timescale: u32,
    start_offset: Option<f64>,
    paused_total: f64,
    last_frame: Option<f64>,
    frame_interval: f64,
    resume_pending: bool,
}

impl Clock {
    pub fn new(timescale: u32) -> Self {
        Self {
            timescale,
            start_offset: None,
            paused_total: 0.0,
            last_frame: None,
            frame_interval: 0.0,
            resume_pending: false,
        }
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn to_native(&self, seconds: f64) -> NativeTime {
        NativeTime {
            value: (seconds * self.timescale as f64).round() as i64,
            timescale: self.timescale,
        }
    }

    pub fn start_offset(&self) -> Option<f64> {
        self.start_offset
    }

    pub fn is_started(&self) -> bool {
        self.start_offset.is_some()
    }

    /// Recorded time at capture timestamp `seconds`, never negative
    pub fn elapsed(&self, seconds: f64) -> f64 {
        self.session_time(seconds).unwrap_or(0.0).max(0.0)
    }

    /// Position of `seconds` on the session timeline, if the session has
    /// started
    pub fn session_time(&self, seconds: f64) -> Option<f64> {
        self.start_offset
            .map(|start| seconds - start - self.paused_total)
    }

    /// Recording was paused; the gap before the next frame is not recorded
    pub fn mark_paused(&mut self) {
        if self.start_offset.is_some() {
            self.resume_pending = true;
        }
    }

    /// Account for a video frame captured at `seconds` and return its
    /// session time.
    ///
    /// The first frame fixes the start offset. The first frame after a pause
    /// is placed one frame interval after the last frame before it, or one
    /// tick after it when no interval has been measured yet.
    pub fn observe_frame(&mut self, seconds: f64) -> f64 {
        if self.start_offset.is_none() {
            self.start_offset = Some(seconds);
        }

        if let Some(last) = self.last_frame {
            let delta = seconds - last;
            if self.resume_pending {
                let step = if self.frame_interval > 0.0 {
                    self.frame_interval
                } else {
                    1.0 / self.timescale as f64
                };
                self.paused_total += (delta - step).max(0.0);
            } else if delta > 0.0 {
                self.frame_interval = delta;
            }
        }
        self.resume_pending = false;
        self.last_frame = Some(seconds);

        self.elapsed(seconds)
    }
}
