//! Post-recording merge
//!
//! Combines the finished video-only container with the side audio file,
//! then atomically swaps the result over the container. Every path through
//! here consumes the side audio file and leaves no export artifact behind;
//! on failure the original container stays as a video-only output.

use super::types::{Composition, ExportPreset, MergeError, MergeService};
use crate::recorder::scratch::ScratchFile;
use crate::utils::error::SessionWarning;
use std::path::Path;
use std::sync::Arc;

/// Prefix for the in-progress export next to the output
const EXPORT_PREFIX: &str = ".dualcap-export-";

/// How the merge ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Output now holds video and audio
    Merged,
    /// Output is the untouched video-only container
    VideoOnly { reason: String },
}

/// Merge result plus any cleanup problems
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    pub warnings: Vec<SessionWarning>,
}

pub struct MergeEngine {
    service: Arc<dyn MergeService>,
    preset: ExportPreset,
}

impl MergeEngine {
    pub fn new(service: Arc<dyn MergeService>) -> Self {
        Self {
            service,
            preset: ExportPreset::Highest,
        }
    }

    pub fn with_preset(mut self, preset: ExportPreset) -> Self {
        self.preset = preset;
        self
    }

    /// Merge `audio` into the container at `video_path`.
    ///
    /// Never fails: errors degrade to a video-only outcome.
    pub async fn merge(&self, video_path: &Path, audio: ScratchFile) -> MergeReport {
        tracing::info!("Merging {:?} into {:?}", audio.path(), video_path);

        let result = self.compose_and_replace(video_path, audio.path()).await;

        let mut warnings = Vec::new();
        let outcome = match result {
            Ok(()) => {
                tracing::info!("Merge complete: {:?}", video_path);
                MergeOutcome::Merged
            }
            Err(e) => {
                tracing::warn!("Merge failed, keeping video-only output: {}", e);
                warnings.push(SessionWarning::MergeFailed(e.to_string()));
                MergeOutcome::VideoOnly {
                    reason: e.to_string(),
                }
            }
        };

        if let Err(e) = audio.remove() {
            tracing::warn!("Failed to delete side audio after merge: {}", e);
            warnings.push(SessionWarning::CleanupFailed(e.to_string()));
        }

        MergeReport { outcome, warnings }
    }

    async fn compose_and_replace(&self, video_path: &Path, audio_path: &Path) -> Result<(), MergeError> {
        if !audio_path.exists() {
            return Err(MergeError::MissingAudio(audio_path.to_path_buf()));
        }

        let info = self.service.probe_video(video_path).await?;
        tracing::debug!(
            "Source video: {:.3}s, rotation {}",
            info.duration_secs,
            info.transform.rotation_degrees
        );

        let composition = Composition::video_with_audio(video_path, audio_path, &info);

        // Same directory as the output so the final rename is atomic
        let export = export_temp_for(video_path)?;
        tracing::debug!("Exporting composition to {:?}", export.path());

        self.service
            .export(&composition, export.path(), self.preset)
            .await?;

        // The replacement keeps the recording's permissions, not the
        // temp file's owner-only mode
        let permissions = std::fs::metadata(video_path)?.permissions();
        export.as_file().set_permissions(permissions)?;

        // The temp file is deleted on drop if this fails
        export
            .persist(video_path)
            .map_err(|e| MergeError::Replace(e.error.to_string()))?;

        Ok(())
    }
}

fn export_temp_for(video_path: &Path) -> Result<tempfile::NamedTempFile, MergeError> {
    let dir = match video_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let suffix = video_path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let file = tempfile::Builder::new()
        .prefix(EXPORT_PREFIX)
        .suffix(&suffix)
        .tempfile_in(dir)?;
    Ok(file)
}
