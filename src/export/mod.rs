//! Post-recording merge module
//!
//! Composes the video-only container with the side audio file and swaps
//! the result into place.

pub mod ffmpeg;
pub mod merge;
pub mod types;

pub use ffmpeg::FfmpegMergeService;
pub use merge::{MergeEngine, MergeOutcome, MergeReport};
pub use types::{
    Composition, CompositionTrack, ExportPreset, MediaKind, MergeError, MergeService, TimeRange,
    Transform, VideoTrackInfo,
};
