//! Error types and handling
//!
//! Fatal errors surface as `RecorderError`; degraded-but-successful outcomes
//! are reported as `SessionWarning` on the recording handle.

use crate::recorder::state::RecordingState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Session-level error type
#[derive(Error, Debug)]
pub enum RecorderError {
    /// A writer or sink could not be created
    #[error("Setup failed: {0}")]
    Setup(String),

    /// The underlying writer rejected start
    #[error("Writer failed to start: {0}")]
    WriterStart(String),

    /// Command issued in a state that does not accept it
    #[error("Cannot {command} while {state}")]
    WrongState {
        state: RecordingState,
        command: &'static str,
    },

    #[error("Output path is already being recorded by another session: {0}")]
    OutputPathInUse(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session's execution context is gone
    #[error("Session is closed")]
    SessionClosed,

    #[error("Writer error: {0}")]
    Writer(#[from] crate::sink::WriterError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Non-fatal conditions observed during a session.
///
/// Each of these leaves the session producing a degraded artifact rather
/// than none at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "message")]
pub enum SessionWarning {
    /// Side audio recorder could not be created or started; output is silent
    AudioUnavailable(String),
    /// Merge failed or was cancelled; output is video-only
    MergeFailed(String),
    /// A temporary file could not be deleted
    CleanupFailed(String),
}

impl std::fmt::Display for SessionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionWarning::AudioUnavailable(msg) => write!(f, "audio unavailable: {}", msg),
            SessionWarning::MergeFailed(msg) => write!(f, "merge failed: {}", msg),
            SessionWarning::CleanupFailed(msg) => write!(f, "cleanup failed: {}", msg),
        }
    }
}
