//! Merge types and the export service contract
//!
//! A `Composition` arranges tracks sourced from separate files on one
//! timeline. The export service renders it to a file; it is treated as an
//! opaque collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Orientation carried by a video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    /// Clockwise display rotation, normalized to 0, 90, 180 or 270
    pub rotation_degrees: i32,
}

impl Transform {
    pub fn rotation(degrees: i32) -> Self {
        let normalized = ((degrees % 360) + 360) % 360;
        Self {
            rotation_degrees: (normalized + 45) / 90 % 4 * 90,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.rotation_degrees == 0
    }
}

/// What the probe learned about the container's video track
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoTrackInfo {
    pub duration_secs: f64,
    pub transform: Transform,
}

/// Kind of media in a composition track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// One track of a composition, sourced from a track of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionTrack {
    pub kind: MediaKind,
    pub source: PathBuf,
    /// Index of the track among the source's tracks of this kind
    pub source_track: usize,
    /// Where the track starts on the composition timeline
    pub insert_at_secs: f64,
}

/// Active range of the composition timeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start_secs: f64,
    pub duration_secs: f64,
}

/// One video track plus one audio track on a shared timeline.
///
/// The export renders exactly `time_range`: audio shorter than the range
/// leaves a silent tail, audio longer than it is cut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    pub video: CompositionTrack,
    pub audio: CompositionTrack,
    pub video_transform: Transform,
    pub time_range: TimeRange,
}

impl Composition {
    /// Both tracks at time zero, range bounded by the video track
    pub fn video_with_audio(video_path: &Path, audio_path: &Path, info: &VideoTrackInfo) -> Self {
        Self {
            video: CompositionTrack {
                kind: MediaKind::Video,
                source: video_path.to_path_buf(),
                source_track: 0,
                insert_at_secs: 0.0,
            },
            audio: CompositionTrack {
                kind: MediaKind::Audio,
                source: audio_path.to_path_buf(),
                source_track: 0,
                insert_at_secs: 0.0,
            },
            video_transform: info.transform,
            time_range: TimeRange {
                start_secs: 0.0,
                duration_secs: info.duration_secs.max(0.0),
            },
        }
    }
}

/// Export quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportPreset {
    /// Best available quality: video passes through untouched
    #[default]
    Highest,
    /// Re-encode video at a moderate quality
    Balanced,
}

/// Merge errors
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Side audio file is missing: {0}")]
    MissingAudio(PathBuf),

    #[error("Failed to read source video: {0}")]
    Probe(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Export cancelled")]
    Cancelled,

    #[error("Failed to replace output: {0}")]
    Replace(String),
}

/// The composition and export engine
#[async_trait]
pub trait MergeService: Send + Sync {
    /// Inspect the first video track of a container
    async fn probe_video(&self, path: &Path) -> Result<VideoTrackInfo, MergeError>;

    /// Render `composition` to `output`, progressive-playback friendly
    async fn export(
        &self,
        composition: &Composition,
        output: &Path,
        preset: ExportPreset,
    ) -> Result<(), MergeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_normalized() {
        assert_eq!(Transform::rotation(-90).rotation_degrees, 270);
        assert_eq!(Transform::rotation(450).rotation_degrees, 90);
        assert_eq!(Transform::rotation(179).rotation_degrees, 180);
        assert!(Transform::rotation(360).is_identity());
    }

    #[test]
    fn test_composition_bounded_by_video() {
        let info = VideoTrackInfo {
            duration_secs: 29.0,
            transform: Transform::rotation(90),
        };
        let composition =
            Composition::video_with_audio(Path::new("/v.mp4"), Path::new("/a.m4a"), &info);

        assert_eq!(composition.time_range.duration_secs, 29.0);
        assert_eq!(composition.video.insert_at_secs, 0.0);
        assert_eq!(composition.audio.insert_at_secs, 0.0);
        assert_eq!(composition.audio.kind, MediaKind::Audio);
        assert_eq!(composition.video_transform.rotation_degrees, 90);
    }
}
