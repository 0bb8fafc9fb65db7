pub mod classify;
pub mod video;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::credentials::CredentialProvider;
use crate::gemini::{JobHandle, JobStatus, VideoService};
use crate::media::{MediaStore, PlayableUrl};
use classify::{Failure, Outcome};
use video::{JobError, JobUpdate};

/// Callback invoked for every controller event (phase changes, progress,
/// results). Surfaces use it to render state and to run the credential
/// selection flow after a reset.
pub type EventCallback = Arc<dyn Fn(StudioEvent) + Send + Sync>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Valid values shared by the CLI and MCP tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Resolution {
    #[default]
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
}

impl Resolution {
    pub const ALL: &'static [&'static str] = &["720p", "1080p"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P720 => "720p",
            Self::P1080 => "1080p",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "720p" => Ok(Self::P720),
            "1080p" => Ok(Self::P1080),
            other => Err(format!(
                "invalid resolution \"{other}\". Valid: {}",
                Self::ALL.join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
}

impl AspectRatio {
    pub const ALL: &'static [&'static str] = &["16:9", "9:16"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "16:9" => Ok(Self::Landscape),
            "9:16" => Ok(Self::Portrait),
            other => Err(format!(
                "invalid aspect ratio \"{other}\". Valid: {}",
                Self::ALL.join(", ")
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests, jobs, results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ReferenceImage {
    /// Read an image file, inferring its MIME type from the extension.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let mime_type = match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "gif" => "image/gif",
            _ => bail!(
                "unsupported image type \"{}\" (expected png, jpeg, webp or gif)",
                path.display()
            ),
        };
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self {
            bytes,
            mime_type: mime_type.to_string(),
        })
    }
}

/// Editable inputs a request is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub prompt: String,
    pub image: Option<ReferenceImage>,
    pub resolution: Resolution,
    pub aspect_ratio: AspectRatio,
}

#[derive(Debug, Clone)]
pub enum DraftEdit {
    Prompt(String),
    Image(Option<ReferenceImage>),
    Resolution(Resolution),
    AspectRatio(AspectRatio),
}

/// Snapshot of the draft taken at submission; never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image: Option<ReferenceImage>,
    pub resolution: Resolution,
    pub aspect_ratio: AspectRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Done,
}

/// The job currently in flight. Dropped once it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub handle: Option<String>,
    pub status: JobState,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedVideo {
    pub id: String,
    pub playable: PlayableUrl,
    pub prompt: String,
    pub resolution: Resolution,
    pub aspect_ratio: AspectRatio,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Submitting,
    Polling,
    Fetching,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Submitting | Phase::Polling | Phase::Fetching)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("enter a prompt or attach a reference image")]
    PreconditionFailed,

    #[error("a video is already being generated")]
    Busy,

    #[error("no usable API key is selected")]
    CredentialRequired,

    #[error("the studio has shut down")]
    Unavailable,
}

#[derive(Debug, Clone)]
pub enum StudioEvent {
    Phase(Phase),
    Progress { message: String, polls: u32 },
    Completed(CompletedVideo),
    Failed(Failure),
    CredentialReset,
}

// ---------------------------------------------------------------------------
// LifecycleController: the state machine, free of IO
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LifecycleController {
    draft: Draft,
    phase: Phase,
    job: Option<GenerationJob>,
    status_text: Option<String>,
    last_failure: Option<Failure>,
    credential_reset: bool,
    history: Vec<CompletedVideo>,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn job(&self) -> Option<&GenerationJob> {
        self.job.as_ref()
    }

    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }

    /// Most recent first.
    pub fn history(&self) -> &[CompletedVideo] {
        &self.history
    }

    pub fn edit(&mut self, edit: DraftEdit) {
        match edit {
            DraftEdit::Prompt(prompt) => self.draft.prompt = prompt,
            DraftEdit::Image(image) => self.draft.image = image,
            DraftEdit::Resolution(resolution) => self.draft.resolution = resolution,
            DraftEdit::AspectRatio(ratio) => self.draft.aspect_ratio = ratio,
        }
    }

    pub fn replace_draft(&mut self, draft: Draft) {
        self.draft = draft;
    }

    /// Check that a submission would be accepted, without transitioning.
    pub fn validate(&self) -> Result<(), SubmitError> {
        if self.is_active() {
            return Err(SubmitError::Busy);
        }
        if self.draft.prompt.trim().is_empty() && self.draft.image.is_none() {
            return Err(SubmitError::PreconditionFailed);
        }
        Ok(())
    }

    /// Idle → Submitting. Returns the immutable request to send.
    pub fn begin(&mut self) -> Result<GenerationRequest, SubmitError> {
        self.validate()?;
        self.phase = Phase::Submitting;
        self.job = Some(GenerationJob {
            handle: None,
            status: JobState::Pending,
            result: None,
            error: None,
        });
        self.status_text = None;
        self.last_failure = None;
        self.credential_reset = false;
        Ok(GenerationRequest {
            prompt: self.draft.prompt.clone(),
            image: self.draft.image.clone(),
            resolution: self.draft.resolution,
            aspect_ratio: self.draft.aspect_ratio,
        })
    }

    pub fn on_submitted(&mut self, handle: &JobHandle) {
        self.phase = Phase::Polling;
        if let Some(job) = self.job.as_mut() {
            job.handle = Some(handle.0.clone());
        }
    }

    pub fn on_polled(&mut self, status: &JobStatus, message: &str) {
        self.status_text = Some(message.to_string());
        if let Some(job) = self.job.as_mut() {
            job.status = if status.done {
                JobState::Done
            } else {
                JobState::Pending
            };
            job.result = status.result_uri.clone();
            job.error = status.error.clone();
        }
    }

    pub fn on_fetching(&mut self) {
        self.phase = Phase::Fetching;
    }

    /// Fetching → Succeeded: prepend the video and clear prompt and image.
    pub fn on_succeeded(&mut self, video: CompletedVideo) {
        self.history.insert(0, video);
        self.draft.prompt.clear();
        self.draft.image = None;
        self.finish(Phase::Succeeded);
    }

    /// Any active state → Failed, or back to Idle on a credential reset.
    pub fn on_failed(&mut self, err: &JobError) -> Outcome {
        let outcome = classify::classify(err);
        match &outcome {
            Outcome::CredentialReset => {
                self.credential_reset = true;
                self.finish(Phase::Idle);
            }
            Outcome::Failed(failure) => {
                self.last_failure = Some(failure.clone());
                self.finish(Phase::Failed);
            }
        }
        outcome
    }

    fn finish(&mut self, phase: Phase) {
        self.phase = phase;
        self.job = None;
        self.status_text = None;
    }

    /// Remove a history entry. The caller releases its playable resource.
    pub fn remove(&mut self, id: &str) -> Option<CompletedVideo> {
        let idx = self.history.iter().position(|v| v.id == id)?;
        Some(self.history.remove(idx))
    }

    pub fn drain_history(&mut self) -> Vec<CompletedVideo> {
        std::mem::take(&mut self.history)
    }

    pub fn status(&self) -> StudioStatus {
        StudioStatus {
            phase: self.phase,
            job: self.job.clone(),
            status_text: self.status_text.clone(),
            last_failure: self.last_failure.clone(),
            credential_reset: self.credential_reset,
            prompt: self.draft.prompt.clone(),
            has_image: self.draft.image.is_some(),
            resolution: self.draft.resolution,
            aspect_ratio: self.draft.aspect_ratio,
            videos: self.history.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudioStatus {
    pub phase: Phase,
    pub job: Option<GenerationJob>,
    pub status_text: Option<String>,
    pub last_failure: Option<Failure>,
    /// Set after a credential reset until the next accepted submission.
    pub credential_reset: bool,
    pub prompt: String,
    pub has_image: bool,
    pub resolution: Resolution,
    pub aspect_ratio: AspectRatio,
    pub videos: usize,
}

// ---------------------------------------------------------------------------
// Studio: one task owns the controller and runs jobs one at a time
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub poll_interval: Duration,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

enum StudioCommand {
    Generate {
        draft: Draft,
        reply: oneshot::Sender<Result<(), SubmitError>>,
    },
    Edit {
        edit: DraftEdit,
        reply: oneshot::Sender<()>,
    },
    Submit {
        reply: oneshot::Sender<Result<(), SubmitError>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    History {
        reply: oneshot::Sender<Vec<CompletedVideo>>,
    },
    Status {
        reply: oneshot::Sender<StudioStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable front door to the studio task.
#[derive(Clone)]
pub struct StudioHandle {
    tx: mpsc::Sender<StudioCommand>,
}

impl StudioHandle {
    /// Replace the draft and submit it in one step.
    pub async fn generate(&self, draft: Draft) -> Result<(), SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.send(StudioCommand::Generate { draft, reply }).await?;
        rx.await.map_err(|_| SubmitError::Unavailable)?
    }

    pub async fn edit(&self, edit: DraftEdit) -> Result<(), SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.send(StudioCommand::Edit { edit, reply }).await?;
        rx.await.map_err(|_| SubmitError::Unavailable)
    }

    /// Submit the current draft.
    pub async fn submit(&self) -> Result<(), SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.send(StudioCommand::Submit { reply }).await?;
        rx.await.map_err(|_| SubmitError::Unavailable)?
    }

    /// Remove a video and release its playable file. Unknown ids are a no-op.
    pub async fn remove(&self, id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = StudioCommand::Remove {
            id: id.to_string(),
            reply,
        };
        if self.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn history(&self) -> Vec<CompletedVideo> {
        let (reply, rx) = oneshot::channel();
        if self.send(StudioCommand::History { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> Option<StudioStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(StudioCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Stop the studio and release every remaining video. An in-flight job is
    /// abandoned.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(StudioCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: StudioCommand) -> Result<(), SubmitError> {
        self.tx.send(cmd).await.map_err(|_| SubmitError::Unavailable)
    }
}

pub struct Studio {
    controller: LifecycleController,
    service: Arc<dyn VideoService>,
    media: Arc<dyn MediaStore>,
    credentials: Arc<dyn CredentialProvider>,
    config: StudioConfig,
    on_event: Option<EventCallback>,
    updates_tx: mpsc::UnboundedSender<JobUpdate>,
    updates_rx: mpsc::UnboundedReceiver<JobUpdate>,
    job_task: Option<AbortHandle>,
}

impl Studio {
    /// Start the studio task. It runs until `shutdown` is called or every
    /// handle is dropped, then releases all remaining videos.
    pub fn spawn(
        service: Arc<dyn VideoService>,
        media: Arc<dyn MediaStore>,
        credentials: Arc<dyn CredentialProvider>,
        config: StudioConfig,
        on_event: Option<EventCallback>,
    ) -> (StudioHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let studio = Self {
            controller: LifecycleController::new(),
            service,
            media,
            credentials,
            config,
            on_event,
            updates_tx,
            updates_rx,
            job_task: None,
        };
        let task = tokio::spawn(studio.run(rx));
        (StudioHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<StudioCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(StudioCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(update) = self.updates_rx.recv() => self.apply(update),
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, cmd: StudioCommand) {
        match cmd {
            StudioCommand::Generate { draft, reply } => {
                if self.controller.is_active() {
                    let _ = reply.send(Err(SubmitError::Busy));
                    return;
                }
                self.controller.replace_draft(draft);
                let _ = reply.send(self.start_job().await);
            }
            StudioCommand::Edit { edit, reply } => {
                self.controller.edit(edit);
                let _ = reply.send(());
            }
            StudioCommand::Submit { reply } => {
                let _ = reply.send(self.start_job().await);
            }
            StudioCommand::Remove { id, reply } => {
                let removed = match self.controller.remove(&id) {
                    Some(video) => {
                        self.media.release(&video.playable).await;
                        info!(video = %id, "removed video");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
            StudioCommand::History { reply } => {
                let _ = reply.send(self.controller.history().to_vec());
            }
            StudioCommand::Status { reply } => {
                let _ = reply.send(self.controller.status());
            }
            StudioCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn start_job(&mut self) -> Result<(), SubmitError> {
        self.controller.validate()?;

        if !self.credentials.has_valid_credential().await {
            info!("no API key selected; running credential selection");
            if let Err(e) = self.credentials.prompt_for_credential().await {
                warn!("credential selection failed: {e:#}");
            }
            if !self.credentials.has_valid_credential().await {
                return Err(SubmitError::CredentialRequired);
            }
        }

        let request = self.controller.begin()?;
        self.emit(StudioEvent::Phase(Phase::Submitting));
        self.spawn_job(request);
        Ok(())
    }

    fn spawn_job(&mut self, request: GenerationRequest) {
        let service = Arc::clone(&self.service);
        let media = Arc::clone(&self.media);
        let updates = self.updates_tx.clone();
        let poll_interval = self.config.poll_interval;

        let job_updates = updates.clone();
        let job = tokio::spawn(async move {
            video::run_video_job(
                service.as_ref(),
                media.as_ref(),
                &request,
                poll_interval,
                &job_updates,
            )
            .await
        });
        self.job_task = Some(job.abort_handle());

        // Report a finish even when the job panics; an aborted job reports nothing.
        tokio::spawn(async move {
            let result = match job.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    error!("video job panicked");
                    Err(JobError::Crashed)
                }
                Err(_) => return,
            };
            let _ = updates.send(JobUpdate::Finished(result));
        });
    }

    fn apply(&mut self, update: JobUpdate) {
        match update {
            JobUpdate::Submitted(handle) => {
                self.controller.on_submitted(&handle);
                self.emit(StudioEvent::Phase(Phase::Polling));
            }
            JobUpdate::Polled {
                status,
                message,
                polls,
            } => {
                self.controller.on_polled(&status, message);
                self.emit(StudioEvent::Progress {
                    message: message.to_string(),
                    polls,
                });
            }
            JobUpdate::Fetching => {
                self.controller.on_fetching();
                self.emit(StudioEvent::Phase(Phase::Fetching));
            }
            JobUpdate::Finished(Ok(video)) => {
                self.job_task = None;
                self.controller.on_succeeded(video.clone());
                self.emit(StudioEvent::Phase(Phase::Succeeded));
                self.emit(StudioEvent::Completed(video));
            }
            JobUpdate::Finished(Err(err)) => {
                self.job_task = None;
                match self.controller.on_failed(&err) {
                    Outcome::CredentialReset => {
                        warn!("API key was rejected; credential selection required");
                        self.emit(StudioEvent::Phase(Phase::Idle));
                        self.emit(StudioEvent::CredentialReset);
                    }
                    Outcome::Failed(failure) => {
                        error!(kind = ?failure.kind, "video generation failed: {}", failure.message);
                        self.emit(StudioEvent::Phase(Phase::Failed));
                        self.emit(StudioEvent::Failed(failure));
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.job_task.take() {
            task.abort();
        }
        let remaining = self.controller.drain_history();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "releasing videos on shutdown");
        }
        for video in remaining {
            self.media.release(&video.playable).await;
        }
    }

    fn emit(&self, event: StudioEvent) {
        if let Some(ref cb) = self.on_event {
            cb(event);
        }
    }
}
