//! Recording session module
//!
//! - `Clock` maps capture timestamps onto the session timeline
//! - `state` holds the transition table and published snapshot
//! - `Session` runs the state machine on its own task
//! - `SessionRegistry` / `RecordingHandle` let callers observe sessions
//!   without owning them

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod handle;
pub mod scratch;
pub mod state;

pub use clock::{Clock, NativeTime};
pub use config::{AudioMode, ContainerFormat, EncoderSettings, SessionConfig};
pub use coordinator::{AudioOutcome, Collaborators, FinalStateCallback, FinishReport, Pending, Session};
pub use handle::{RecordingHandle, SessionId, SessionRegistry};
pub use scratch::{ScratchFile, ScratchSpace};
pub use state::{RecordingSnapshot, RecordingState};
