//! Dualcap - dual-track video/audio capture with post-recording merge.
//!
//! Video frames are written to a container in real time while audio is
//! recorded to a private side file by an independently clocked recorder.
//! When the session finishes, the two are composed into one output and the
//! result atomically replaces the video-only container.

pub mod capture;
pub mod export;
pub mod recorder;
pub mod sink;
pub mod utils;

pub use recorder::{
    AudioOutcome, Collaborators, FinishReport, Pending, RecordingHandle, RecordingSnapshot,
    RecordingState, Session, SessionConfig, SessionRegistry,
};
pub use utils::error::{RecorderError, RecorderResult, SessionWarning};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber.
///
/// Honors `RUST_LOG`; falls back to debug output for this crate. Safe to call
/// more than once (later calls are ignored).
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dualcap=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    tracing::debug!("Dualcap v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
