//! Capture-side collaborators
//!
//! Frames arrive from the host's capture pipeline through
//! `Session::append_video_frame`; this module provides the microphone
//! side recorder.

pub mod microphone;

pub use microphone::{CpalRecorderFactory, CpalSideRecorder};
