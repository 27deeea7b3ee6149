//! Recording session orchestrator
//!
//! Each session runs on its own tokio task. Commands and capture data share
//! one FIFO queue into that task, so every state change and every frame is
//! totally ordered: a frame enqueued before `finish` is written, one
//! enqueued after it is dropped.

use super::clock::Clock;
use super::config::{AudioMode, SessionConfig};
use super::handle::{RecordingHandle, SessionId, SessionRegistry};
use super::scratch::ScratchSpace;
use super::state::{transition, RecordingSnapshot, RecordingState, Transition, Trigger};
use crate::export::{MergeEngine, MergeOutcome, MergeService};
use crate::sink::{
    Appended, AudioRecorderFactory, AudioSample, AudioSink, VideoFrame, VideoSink, WriterFactory,
    WriterRequest,
};
use crate::utils::error::{RecorderError, RecorderResult, SessionWarning};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Called once with the state a session ends in
pub type FinalStateCallback = Box<dyn FnOnce(RecordingState) + Send>;

/// External services a session drives
pub struct Collaborators {
    pub writer_factory: Arc<dyn WriterFactory>,
    /// Side-file mode without a recorder factory records silent video
    pub audio_factory: Option<Arc<dyn AudioRecorderFactory>>,
    pub merge_service: Arc<dyn MergeService>,
    pub on_final_state: Option<FinalStateCallback>,
}

impl Collaborators {
    pub fn new(writer_factory: Arc<dyn WriterFactory>, merge_service: Arc<dyn MergeService>) -> Self {
        Self {
            writer_factory,
            audio_factory: None,
            merge_service,
            on_final_state: None,
        }
    }

    pub fn with_audio_recorder(mut self, factory: Arc<dyn AudioRecorderFactory>) -> Self {
        self.audio_factory = Some(factory);
        self
    }

    pub fn on_final_state(mut self, callback: impl FnOnce(RecordingState) + Send + 'static) -> Self {
        self.on_final_state = Some(Box::new(callback));
        self
    }
}

/// Where the output's audio came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum AudioOutcome {
    /// Side audio merged into the container
    Merged,
    /// Samples were written straight into the container
    Direct,
    /// No audio in the output
    VideoOnly { reason: String },
}

/// Result of a completed finish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishReport {
    pub output_path: PathBuf,
    pub audio: AudioOutcome,
    /// Recorded seconds, excluding pauses
    pub duration_secs: f64,
    pub warnings: Vec<SessionWarning>,
}

/// Completion of a queued command.
///
/// The command is already enqueued when this is returned; dropping it does
/// not withdraw the command.
#[must_use = "the command runs regardless; await to observe its result"]
pub struct Pending<T> {
    rx: oneshot::Receiver<RecorderResult<T>>,
}

impl<T> Future for Pending<T> {
    type Output = RecorderResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(RecorderError::SessionClosed)))
    }
}

type Reply<T> = oneshot::Sender<RecorderResult<T>>;

enum Event {
    Resume(Reply<()>),
    Pause(Reply<()>),
    Finish(Reply<FinishReport>),
    Cancel(Reply<()>),
    VideoFrame { frame: VideoFrame, at: f64 },
    AudioSample { sample: AudioSample, at: f64 },
}

/// A recording session.
///
/// Dropping the session closes its queue; anything still pending runs, and
/// a session that never reached a terminal state is cancelled.
pub struct Session {
    id: SessionId,
    output_path: PathBuf,
    events: mpsc::UnboundedSender<Event>,
    handle: RecordingHandle,
}

impl Session {
    /// Validate `config`, create and start the writer, set up audio, and
    /// spawn the session task. Writer failures are returned here.
    pub async fn open(
        config: SessionConfig,
        collaborators: Collaborators,
        registry: &SessionRegistry,
    ) -> RecorderResult<Session> {
        config.validate()?;

        let audio_mode = config.audio_mode();
        let mut snapshot = RecordingSnapshot::new(audio_mode);
        let id = registry.claim(&config.output_path, snapshot.clone())?;

        let built = build_sinks(&config, &collaborators, audio_mode);
        let (video, audio, warning) = match built {
            Ok(parts) => parts,
            Err(e) => {
                registry.invalidate(id);
                return Err(e);
            }
        };

        if let Some(warning) = warning {
            snapshot.warnings.push(warning);
            registry.publish(id, snapshot.clone());
        }

        tracing::info!(
            "Opened {} for {:?} ({:?} audio)",
            id,
            config.output_path,
            audio_mode
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            id,
            output_path: config.output_path.clone(),
            registry: registry.clone(),
            state: RecordingState::Ready,
            clock: Clock::new(config.time_scale),
            video,
            audio,
            merge: MergeEngine::new(collaborators.merge_service).with_preset(config.export_preset),
            snapshot,
            finish_report: None,
            on_final_state: collaborators.on_final_state,
        };
        tokio::spawn(actor.run(rx));

        Ok(Session {
            id,
            output_path: config.output_path,
            events: tx,
            handle: registry.handle(id),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Observer that does not keep the session alive
    pub fn handle(&self) -> RecordingHandle {
        self.handle.clone()
    }

    /// Start recording from `ready`, or continue from `paused`
    pub fn resume(&self) -> Pending<()> {
        self.command(Event::Resume)
    }

    pub fn pause(&self) -> Pending<()> {
        self.command(Event::Pause)
    }

    /// Finalize the container and merge side audio. A second call completes
    /// with the first call's report without redoing any work.
    pub fn finish(&self) -> Pending<FinishReport> {
        self.command(Event::Finish)
    }

    /// Abandon the recording and delete its files
    pub fn cancel(&self) -> Pending<()> {
        self.command(Event::Cancel)
    }

    /// Queue a captured frame; `at` is the capture timestamp in seconds
    pub fn append_video_frame(&self, frame: VideoFrame, at: f64) {
        let _ = self.events.send(Event::VideoFrame { frame, at });
    }

    /// Queue an audio chunk for direct-mode sessions
    pub fn append_audio_sample(&self, sample: AudioSample, at: f64) {
        let _ = self.events.send(Event::AudioSample { sample, at });
    }

    fn command<T>(&self, make: impl FnOnce(Reply<T>) -> Event) -> Pending<T> {
        let (tx, rx) = oneshot::channel();
        // A closed queue drops the reply sender, which resolves to SessionClosed
        let _ = self.events.send(make(tx));
        Pending { rx }
    }
}

fn build_sinks(
    config: &SessionConfig,
    collaborators: &Collaborators,
    audio_mode: AudioMode,
) -> RecorderResult<(VideoSink, AudioSink, Option<SessionWarning>)> {
    let request = WriterRequest {
        output_path: config.output_path.clone(),
        format: config.format,
        video_settings: config.video_settings.clone(),
        video_format_hint: config.video_format_hint.clone(),
        audio_settings: match audio_mode {
            AudioMode::Direct => Some(config.audio_settings.clone()),
            AudioMode::SideFile => None,
        },
        audio_format_hint: config.audio_format_hint.clone(),
        timescale: config.time_scale,
    };

    let video = VideoSink::open(collaborators.writer_factory.as_ref(), &request)?;

    if audio_mode == AudioMode::Direct {
        return Ok((video, AudioSink::direct(), None));
    }

    let Some(factory) = collaborators.audio_factory.as_deref() else {
        tracing::warn!("No audio recorder configured, recording video only");
        return Ok((
            video,
            AudioSink::Silent,
            Some(SessionWarning::AudioUnavailable(
                "no audio recorder configured".to_string(),
            )),
        ));
    };

    let scratch = match ScratchSpace::new(config.scratch_dir()) {
        Ok(scratch) => scratch,
        Err(e) => {
            tracing::warn!(
                "Scratch directory {:?} unusable, recording video only: {}",
                config.scratch_dir(),
                e
            );
            return Ok((
                video,
                AudioSink::Silent,
                Some(SessionWarning::AudioUnavailable(format!(
                    "scratch directory unusable: {}",
                    e
                ))),
            ));
        }
    };

    let lead = Duration::from_secs_f64(config.audio_lead_secs);
    let (audio, warning) = AudioSink::side_file(factory, &scratch, lead);
    Ok((video, audio, warning))
}

/// Session state owned by the session task
struct Actor {
    id: SessionId,
    output_path: PathBuf,
    registry: SessionRegistry,
    state: RecordingState,
    clock: Clock,
    video: VideoSink,
    audio: AudioSink,
    merge: MergeEngine,
    snapshot: RecordingSnapshot,
    finish_report: Option<FinishReport>,
    on_final_state: Option<FinalStateCallback>,
}

impl Actor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }

        if !self.state.is_terminal() {
            tracing::info!("{} dropped while {}, cancelling", self.id, self.state);
            self.cancel_sinks().await;
            self.enter_terminal(RecordingState::Cancelled);
        }

        self.registry.invalidate(self.id);
        tracing::debug!("{} task exited", self.id);
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Resume(reply) => {
                let _ = reply.send(self.resume().await);
            }
            Event::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            Event::Finish(reply) => {
                let _ = reply.send(self.finish().await);
            }
            Event::Cancel(reply) => {
                let _ = reply.send(self.cancel().await);
            }
            Event::VideoFrame { frame, at } => self.append_video(frame, at),
            Event::AudioSample { sample, at } => self.append_audio(sample, at),
        }
    }

    fn wrong_state(&self, trigger: Trigger) -> RecorderError {
        RecorderError::WrongState {
            state: self.state,
            command: trigger.as_str(),
        }
    }

    async fn resume(&mut self) -> RecorderResult<()> {
        match transition(self.state, Trigger::Resume) {
            Transition::To(next) => {
                let from = self.state;
                if let Some(warning) = self.audio.resume().await {
                    self.snapshot.warnings.push(warning);
                }
                self.set_state(next);
                tracing::info!("{} {} -> {}", self.id, from, next);
                Ok(())
            }
            Transition::Reject => Err(self.wrong_state(Trigger::Resume)),
            _ => Ok(()),
        }
    }

    fn pause(&mut self) -> RecorderResult<()> {
        match transition(self.state, Trigger::Pause) {
            Transition::To(next) => {
                if let Some(last) = self.video.last_pts() {
                    self.video.end_session(last);
                }
                self.audio.pause();
                self.clock.mark_paused();
                self.set_state(next);
                tracing::info!(
                    "{} paused at {:.3}s",
                    self.id,
                    self.snapshot.duration_secs
                );
                Ok(())
            }
            Transition::Reject => Err(self.wrong_state(Trigger::Pause)),
            _ => Ok(()),
        }
    }

    async fn finish(&mut self) -> RecorderResult<FinishReport> {
        match transition(self.state, Trigger::Finish) {
            Transition::To(next) => {
                self.set_state(next);
                tracing::info!("{} finishing", self.id);
                self.finalize().await
            }
            Transition::AlreadyFinal => match &self.finish_report {
                Some(report) => Ok(report.clone()),
                None => Err(self.wrong_state(Trigger::Finish)),
            },
            _ => Err(self.wrong_state(Trigger::Finish)),
        }
    }

    async fn finalize(&mut self) -> RecorderResult<FinishReport> {
        if let Some(last) = self.video.last_pts() {
            self.video.end_session(last);
        }

        let (side_audio, warning) = self.audio.finish().await;
        if let Some(warning) = &warning {
            self.snapshot.warnings.push(warning.clone());
        }

        if let Err(e) = self.video.finish().await {
            tracing::error!("{} writer failed to finish: {}", self.id, e);
            // Dropping the side file deletes it
            drop(side_audio);
            self.fail();
            return Err(e.into());
        }

        let audio = if self.audio.mode() == AudioMode::Direct {
            AudioOutcome::Direct
        } else if let Some(file) = side_audio {
            let report = self.merge.merge(&self.output_path, file).await;
            self.snapshot.warnings.extend(report.warnings);
            match report.outcome {
                MergeOutcome::Merged => AudioOutcome::Merged,
                MergeOutcome::VideoOnly { reason } => AudioOutcome::VideoOnly { reason },
            }
        } else {
            let reason = self
                .snapshot
                .warnings
                .iter()
                .rev()
                .find_map(|w| match w {
                    SessionWarning::AudioUnavailable(message) => Some(message.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "no side audio was recorded".to_string());
            AudioOutcome::VideoOnly { reason }
        };

        let report = FinishReport {
            output_path: self.output_path.clone(),
            audio,
            duration_secs: self.snapshot.duration_secs,
            warnings: self.snapshot.warnings.clone(),
        };
        self.finish_report = Some(report.clone());

        if let Transition::To(next) = transition(self.state, Trigger::FinalizeComplete) {
            self.enter_terminal(next);
        }
        tracing::info!(
            "{} finished: {:.3}s, audio {:?}",
            self.id,
            report.duration_secs,
            report.audio
        );
        Ok(report)
    }

    async fn cancel(&mut self) -> RecorderResult<()> {
        match transition(self.state, Trigger::Cancel) {
            Transition::To(next) => {
                tracing::info!("{} cancelling", self.id);
                self.cancel_sinks().await;
                self.enter_terminal(next);
                Ok(())
            }
            Transition::Reject => Err(self.wrong_state(Trigger::Cancel)),
            _ => Ok(()),
        }
    }

    async fn cancel_sinks(&mut self) {
        self.video.cancel();
        if let Some(warning) = self.audio.cancel().await {
            self.snapshot.warnings.push(warning);
        }
    }

    /// Unrecoverable writer error
    fn fail(&mut self) {
        if let Transition::To(next) = transition(self.state, Trigger::Fail) {
            self.video.cancel();
            self.enter_terminal(next);
        }
    }

    fn append_video(&mut self, frame: VideoFrame, at: f64) {
        if self.state != RecordingState::Recording {
            tracing::trace!("{} ignoring frame while {}", self.id, self.state);
            return;
        }

        let session_time = self.clock.observe_frame(at);
        if !self.video.is_session_open() {
            self.video.start_session(self.clock.to_native(session_time));
        }

        match self.video.append(&frame, session_time, &self.clock) {
            Ok(Appended::Written) => {
                if self.snapshot.started_at.is_none() {
                    self.snapshot.started_at = Some(Utc::now());
                }
                self.snapshot.duration_secs = self.snapshot.duration_secs.max(session_time);
            }
            Ok(Appended::DroppedNotReady | Appended::DroppedOutOfOrder) => {}
            Err(e) => {
                tracing::error!("{} failed to append frame: {}", self.id, e);
                self.audio_cleanup_on_failure();
                self.fail();
                return;
            }
        }

        self.snapshot.frames_appended = self.video.appended();
        self.snapshot.frames_dropped = self.video.dropped();
        self.publish();
    }

    fn append_audio(&mut self, sample: AudioSample, at: f64) {
        if self.state != RecordingState::Recording || !self.video.is_session_open() {
            return;
        }
        // Audio before the first video frame has no place on the timeline
        let Some(session_time) = self.clock.session_time(at).filter(|t| *t >= 0.0) else {
            return;
        };

        let at = self.clock.to_native(session_time);
        if let Err(e) = self.audio.append(self.video.writer_mut(), &sample, at) {
            tracing::error!("{} failed to append audio: {}", self.id, e);
            self.fail();
        }
    }

    /// Replace a side recorder after a writer failure; its file is deleted
    fn audio_cleanup_on_failure(&mut self) {
        if matches!(self.audio, AudioSink::SideFile(_)) {
            self.audio = AudioSink::Silent;
        }
    }

    fn set_state(&mut self, state: RecordingState) {
        self.state = state;
        self.snapshot.state = state;
        self.publish();
    }

    /// Enter a terminal state: duration freezes and the final-state callback
    /// fires
    fn enter_terminal(&mut self, state: RecordingState) {
        tracing::info!("{} -> {}", self.id, state);
        self.set_state(state);
        if let Some(callback) = self.on_final_state.take() {
            callback(state);
        }
    }

    fn publish(&self) {
        self.registry.publish(self.id, self.snapshot.clone());
    }
}
