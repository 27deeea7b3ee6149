//! Recording state management
//!
//! Defines the recording state machine as a plain enum plus a pure
//! transition table, and the snapshot published to recording handles.

use super::config::AudioMode;
use crate::utils::error::SessionWarning;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current state of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// Session open, nothing recorded yet
    #[default]
    Ready,
    /// Accepting frames and samples
    Recording,
    /// Recording is paused
    Paused,
    /// Finalizing the container and merging audio
    Finishing,
    /// Output written
    Finished,
    /// Abandoned without output
    Cancelled,
    /// Writer failed; output is not usable
    Failed,
}

impl RecordingState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never transition again
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Resume,
    Pause,
    Finish,
    /// Finalize work (writer flush and merge) has completed
    FinalizeComplete,
    Cancel,
    /// Writer reported an unrecoverable error
    Fail,
}

impl Trigger {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Pause => "pause",
            Self::Finish => "finish",
            Self::FinalizeComplete => "complete finalize",
            Self::Cancel => "cancel",
            Self::Fail => "fail",
        }
    }
}

/// Outcome of applying a trigger to a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state and run its entry work
    To(RecordingState),
    /// No-op; state unchanged
    Ignore,
    /// Finish requested on a terminal session: complete immediately
    AlreadyFinal,
    /// Report `WrongState`; state unchanged
    Reject,
}

/// The transition table.
///
/// ```text
///   ready ──resume──▶ recording ──pause──▶ paused
///                        ▲                    │
///                        └──────resume────────┘
///   ready|recording|paused ──finish──▶ finishing ──complete──▶ finished
///   ready|recording|paused ──cancel──▶ cancelled
///   any non-terminal ──fail──▶ failed
/// ```
pub fn transition(state: RecordingState, trigger: Trigger) -> Transition {
    use RecordingState::*;
    use Transition::*;

    match (state, trigger) {
        (Ready, Trigger::Resume) | (Paused, Trigger::Resume) => To(Recording),
        (Recording, Trigger::Resume) => Ignore,
        (Finishing, Trigger::Resume) => Reject,

        (Recording, Trigger::Pause) => To(Paused),
        (Ready, Trigger::Pause) | (Paused, Trigger::Pause) | (Finishing, Trigger::Pause) => Ignore,

        (Ready | Recording | Paused, Trigger::Finish) => To(Finishing),
        (Finishing, Trigger::Finish) => Ignore,

        (Finishing, Trigger::FinalizeComplete) => To(Finished),
        (Ready | Recording | Paused, Trigger::FinalizeComplete) => Reject,

        (Ready | Recording | Paused, Trigger::Cancel) => To(Cancelled),
        // An in-flight finalize is never interrupted
        (Finishing, Trigger::Cancel) => Ignore,

        (Ready | Recording | Paused | Finishing, Trigger::Fail) => To(Failed),

        (Finished | Cancelled | Failed, Trigger::Finish) => AlreadyFinal,
        (Finished | Cancelled | Failed, Trigger::Cancel | Trigger::Fail) => Ignore,
        (Finished | Cancelled | Failed, _) => Reject,
    }
}

/// Observable view of a session, published on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSnapshot {
    pub state: RecordingState,

    /// Recorded duration in seconds, excluding paused intervals
    pub duration_secs: f64,

    /// Wall-clock time the first frame was accepted
    pub started_at: Option<DateTime<Utc>>,

    pub frames_appended: u64,

    /// Frames dropped because the writer was not ready
    pub frames_dropped: u64,

    pub audio_mode: AudioMode,

    pub warnings: Vec<SessionWarning>,
}

impl RecordingSnapshot {
    pub fn new(audio_mode: AudioMode) -> Self {
        Self {
            state: RecordingState::Ready,
            duration_secs: 0.0,
            started_at: None,
            frames_appended: 0,
            frames_dropped: 0,
            audio_mode,
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [RecordingState; 7] = [
        RecordingState::Ready,
        RecordingState::Recording,
        RecordingState::Paused,
        RecordingState::Finishing,
        RecordingState::Finished,
        RecordingState::Cancelled,
        RecordingState::Failed,
    ];

    const ALL_TRIGGERS: [Trigger; 6] = [
        Trigger::Resume,
        Trigger::Pause,
        Trigger::Finish,
        Trigger::FinalizeComplete,
        Trigger::Cancel,
        Trigger::Fail,
    ];

    #[test]
    fn test_happy_path() {
        let mut state = RecordingState::Ready;
        for (trigger, expected) in [
            (Trigger::Resume, RecordingState::Recording),
            (Trigger::Pause, RecordingState::Paused),
            (Trigger::Resume, RecordingState::Recording),
            (Trigger::Finish, RecordingState::Finishing),
            (Trigger::FinalizeComplete, RecordingState::Finished),
        ] {
            match transition(state, trigger) {
                Transition::To(next) => state = next,
                other => panic!("unexpected {:?} for {:?} in {}", other, trigger, state),
            }
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_terminal_states_never_move() {
        for state in ALL_STATES.iter().filter(|s| s.is_terminal()) {
            for trigger in ALL_TRIGGERS {
                assert!(
                    !matches!(transition(*state, trigger), Transition::To(_)),
                    "{} moved on {:?}",
                    state,
                    trigger
                );
            }
        }
    }

    #[test]
    fn test_finish_on_terminal_completes_immediately() {
        for state in [
            RecordingState::Finished,
            RecordingState::Cancelled,
            RecordingState::Failed,
        ] {
            assert_eq!(transition(state, Trigger::Finish), Transition::AlreadyFinal);
        }
    }

    #[test]
    fn test_cancel_is_idempotent() {
        assert_eq!(
            transition(RecordingState::Paused, Trigger::Cancel),
            Transition::To(RecordingState::Cancelled)
        );
        assert_eq!(
            transition(RecordingState::Cancelled, Trigger::Cancel),
            Transition::Ignore
        );
    }

    #[test]
    fn test_pause_outside_recording_is_noop() {
        assert_eq!(transition(RecordingState::Ready, Trigger::Pause), Transition::Ignore);
        assert_eq!(transition(RecordingState::Paused, Trigger::Pause), Transition::Ignore);
        assert_eq!(transition(RecordingState::Finished, Trigger::Pause), Transition::Reject);
    }

    #[test]
    fn test_reachable_states_stay_in_table() {
        // Walk every trigger sequence of length 4 from ready
        fn walk(state: RecordingState, depth: usize) {
            if depth == 0 {
                return;
            }
            for trigger in ALL_TRIGGERS {
                if let Transition::To(next) = transition(state, trigger) {
                    assert!(ALL_STATES.contains(&next));
                    assert_ne!(next, RecordingState::Ready, "nothing returns to ready");
                    walk(next, depth - 1);
                }
            }
        }
        walk(RecordingState::Ready, 4);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RecordingState::Finishing.to_string(), "finishing");
        assert_eq!(
            serde_json::to_string(&RecordingState::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
