use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use veo_studio::credentials::{CredentialProvider, SettingsCredentials, SharedCredential};
use veo_studio::gemini::{ClientError, JobHandle, JobStatus, VideoService};
use veo_studio::media::{MediaStore, PlayableUrl};
use veo_studio::settings::API_KEY_ENV;
use veo_studio::tasks::classify::{FailureKind, QUOTA_HINT};
use veo_studio::tasks::{
    AspectRatio, Draft, DraftEdit, GenerationRequest, Phase, ReferenceImage, Resolution, Studio,
    StudioConfig, StudioEvent, StudioHandle, SubmitError,
};

const ENTITY_NOT_FOUND: &str = "Requested entity was not found.";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedService {
    submits: Mutex<VecDeque<Result<JobHandle, ClientError>>>,
    polls: Mutex<VecDeque<Result<JobStatus, ClientError>>>,
    fetches: Mutex<VecDeque<Result<Vec<u8>, ClientError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    panic_on_submit: AtomicBool,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl ScriptedService {
    fn succeeding() -> Self {
        let service = Self::default();
        service.push_submit(Ok(JobHandle("operations/abc".into())));
        service.push_poll(Ok(JobStatus::default()));
        service.push_poll(Ok(done_with_uri("https://files.example/v.mp4")));
        service.push_fetch(Ok(b"mp4 bytes".to_vec()));
        service
    }

    fn push_submit(&self, r: Result<JobHandle, ClientError>) {
        self.submits.lock().unwrap().push_back(r);
    }

    fn push_poll(&self, r: Result<JobStatus, ClientError>) {
        self.polls.lock().unwrap().push_back(r);
    }

    fn push_fetch(&self, r: Result<Vec<u8>, ClientError>) {
        self.fetches.lock().unwrap().push_back(r);
    }
}

#[async_trait]
impl VideoService for ScriptedService {
    async fn submit(&self, request: &GenerationRequest) -> Result<JobHandle, ClientError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if self.panic_on_submit.swap(false, Ordering::SeqCst) {
            panic!("service blew up");
        }
        self.submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(JobHandle("operations/default".into())))
    }

    async fn poll(&self, _handle: &JobHandle) -> Result<JobStatus, ClientError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(JobStatus::default()))
    }

    async fn fetch_artifact(&self, _uri: &str) -> Result<Vec<u8>, ClientError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
struct CountingMedia {
    fail_allocate: AtomicBool,
    allocated: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
}

impl CountingMedia {
    fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaStore for CountingMedia {
    async fn allocate(&self, id: &str, _bytes: &[u8]) -> anyhow::Result<PlayableUrl> {
        if self.fail_allocate.load(Ordering::SeqCst) {
            anyhow::bail!("failed to write /videos/{id}.mp4: No space left on device");
        }
        self.allocated.lock().unwrap().push(id.to_string());
        Ok(PlayableUrl::from_path(format!("/videos/{id}.mp4").into()))
    }

    async fn release(&self, playable: &PlayableUrl) {
        self.released.lock().unwrap().push(playable.url.clone());
    }
}

struct FakeCredentials {
    valid: AtomicBool,
    prompts: AtomicUsize,
}

impl FakeCredentials {
    fn new(valid: bool) -> Self {
        Self {
            valid: AtomicBool::new(valid),
            prompts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn has_valid_credential(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    async fn prompt_for_credential(&self) -> anyhow::Result<()> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.valid.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    studio: StudioHandle,
    task: tokio::task::JoinHandle<()>,
    events: mpsc::UnboundedReceiver<StudioEvent>,
    service: Arc<ScriptedService>,
    media: Arc<CountingMedia>,
    credentials: Arc<FakeCredentials>,
}

fn start(service: ScriptedService) -> Harness {
    start_with(service, FakeCredentials::new(true), Duration::from_millis(1))
}

fn start_with(
    service: ScriptedService,
    credentials: FakeCredentials,
    poll_interval: Duration,
) -> Harness {
    let service = Arc::new(service);
    let media = Arc::new(CountingMedia::default());
    let credentials = Arc::new(credentials);
    let (events_tx, events) = mpsc::unbounded_channel();
    let (studio, task) = Studio::spawn(
        service.clone(),
        media.clone(),
        credentials.clone(),
        StudioConfig { poll_interval },
        Some(Arc::new(move |event: StudioEvent| {
            let _ = events_tx.send(event);
        })),
    );
    Harness {
        studio,
        task,
        events,
        service,
        media,
        credentials,
    }
}

impl Harness {
    async fn until_terminal(&mut self) -> Vec<StudioEvent> {
        until_terminal(&mut self.events).await
    }

    async fn until_phase(&mut self, phase: Phase) {
        until_phase(&mut self.events, phase).await
    }

    async fn stop(self) {
        self.studio.shutdown().await;
        self.task.await.unwrap();
    }
}

/// Collect events up to and including the first terminal one.
async fn until_terminal(events: &mut mpsc::UnboundedReceiver<StudioEvent>) -> Vec<StudioEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for studio event")
            .expect("event channel closed");
        let terminal = matches!(
            event,
            StudioEvent::Completed(_) | StudioEvent::Failed(_) | StudioEvent::CredentialReset
        );
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

async fn until_phase(events: &mut mpsc::UnboundedReceiver<StudioEvent>, phase: Phase) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for phase")
            .expect("event channel closed");
        if matches!(event, StudioEvent::Phase(p) if p == phase) {
            return;
        }
    }
}

fn done_with_uri(uri: &str) -> JobStatus {
    JobStatus {
        done: true,
        result_uri: Some(uri.to_string()),
        ..Default::default()
    }
}

fn draft(prompt: &str) -> Draft {
    Draft {
        prompt: prompt.to_string(),
        ..Default::default()
    }
}

fn failure_of(events: &[StudioEvent]) -> veo_studio::tasks::classify::Failure {
    match events.last() {
        Some(StudioEvent::Failed(failure)) => failure.clone(),
        other => panic!("expected failure, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_prepends_one_video() {
    let mut h = start(ScriptedService::succeeding());
    let mut d = draft("a red kite over dunes");
    d.resolution = Resolution::P1080;
    d.aspect_ratio = AspectRatio::Portrait;
    h.studio.generate(d).await.unwrap();

    let events = h.until_terminal().await;
    let phases: Vec<Phase> = events
        .iter()
        .filter_map(|e| match e {
            StudioEvent::Phase(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            Phase::Submitting,
            Phase::Polling,
            Phase::Fetching,
            Phase::Succeeded
        ]
    );

    let history = h.studio.history().await;
    assert_eq!(history.len(), 1);
    let video = &history[0];
    assert_eq!(video.prompt, "a red kite over dunes");
    assert_eq!(video.resolution, Resolution::P1080);
    assert_eq!(video.aspect_ratio, AspectRatio::Portrait);
    assert!(video.playable.url.starts_with("file://"));

    assert_eq!(h.service.poll_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.service.fetch_calls.load(Ordering::SeqCst), 1);

    let status = h.studio.status().await.unwrap();
    assert_eq!(status.phase, Phase::Succeeded);
    assert!(status.job.is_none());
    assert!(status.prompt.is_empty());
    assert!(!status.has_image);
    assert_eq!(status.resolution, Resolution::P1080);
    h.stop().await;
}

#[tokio::test]
async fn newer_videos_come_first() {
    let service = ScriptedService::succeeding();
    service.push_submit(Ok(JobHandle("operations/second".into())));
    service.push_poll(Ok(done_with_uri("https://files.example/w.mp4")));
    service.push_fetch(Ok(b"more".to_vec()));
    let mut h = start(service);

    h.studio.generate(draft("first")).await.unwrap();
    h.until_terminal().await;
    h.studio.generate(draft("second")).await.unwrap();
    h.until_terminal().await;

    let prompts: Vec<String> = h
        .studio
        .history()
        .await
        .into_iter()
        .map(|v| v.prompt)
        .collect();
    assert_eq!(prompts, vec!["second", "first"]);
    h.stop().await;
}

#[tokio::test]
async fn blank_prompt_without_image_makes_no_calls() {
    let h = start(ScriptedService::succeeding());
    let err = h.studio.generate(draft("  \n ")).await.unwrap_err();
    assert_eq!(err, SubmitError::PreconditionFailed);
    assert_eq!(h.service.submit_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.studio.status().await.unwrap().phase, Phase::Idle);
    h.stop().await;
}

#[tokio::test]
async fn edits_then_submit_uses_current_draft() {
    let mut h = start(ScriptedService::succeeding());
    let image = ReferenceImage {
        bytes: vec![0x89, b'P', b'N', b'G'],
        mime_type: "image/png".into(),
    };
    h.studio
        .edit(DraftEdit::Image(Some(image.clone())))
        .await
        .unwrap();
    h.studio
        .edit(DraftEdit::AspectRatio(AspectRatio::Portrait))
        .await
        .unwrap();
    h.studio.submit().await.unwrap();
    h.until_terminal().await;

    let requests = h.service.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].prompt.is_empty());
    assert_eq!(requests[0].image.as_ref(), Some(&image));
    assert_eq!(requests[0].aspect_ratio, AspectRatio::Portrait);

    let status = h.studio.status().await.unwrap();
    assert!(!status.has_image);
    assert_eq!(status.aspect_ratio, AspectRatio::Portrait);
    h.stop().await;
}

#[tokio::test]
async fn finished_without_video_is_empty_result() {
    let service = ScriptedService::default();
    service.push_poll(Ok(JobStatus {
        done: true,
        filtered_reasons: vec!["Audio could not be generated".into()],
        ..Default::default()
    }));
    let mut h = start(service);
    h.studio.generate(draft("a storm")).await.unwrap();

    let failure = failure_of(&h.until_terminal().await);
    assert_eq!(failure.kind, FailureKind::EmptyResult);
    assert!(failure
        .hint
        .as_deref()
        .unwrap()
        .contains("Audio could not be generated"));
    assert_eq!(h.service.fetch_calls.load(Ordering::SeqCst), 0);
    assert!(h.studio.history().await.is_empty());

    let status = h.studio.status().await.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.prompt, "a storm");
    h.stop().await;
}

#[tokio::test]
async fn quota_errors_carry_the_quota_hint() {
    let service = ScriptedService::default();
    service.push_submit(Err(ClientError::Service(
        r#"Gemini video submit error 429: {"error":{"code":429,"message":"You exceeded your current quota","status":"RESOURCE_EXHAUSTED"}}"#
            .into(),
    )));
    let mut h = start(service);
    h.studio.generate(draft("a fox")).await.unwrap();

    let failure = failure_of(&h.until_terminal().await);
    assert_eq!(failure.kind, FailureKind::QuotaExceeded);
    assert_eq!(failure.hint.as_deref(), Some(QUOTA_HINT));
    assert_eq!(h.service.poll_calls.load(Ordering::SeqCst), 0);
    h.stop().await;
}

#[tokio::test]
async fn other_errors_surface_the_unwrapped_message() {
    let service = ScriptedService::default();
    service.push_poll(Ok(JobStatus {
        done: true,
        error: Some(r#"Error: {"error":{"message":"The model is overloaded"}}"#.into()),
        ..Default::default()
    }));
    let mut h = start(service);
    h.studio.generate(draft("a fox")).await.unwrap();

    let failure = failure_of(&h.until_terminal().await);
    assert_eq!(failure.kind, FailureKind::Generic);
    assert_eq!(failure.message, "The model is overloaded");
    h.stop().await;
}

#[tokio::test]
async fn rejected_key_resets_at_every_stage() {
    let scripts: Vec<ScriptedService> = vec![
        {
            let s = ScriptedService::default();
            s.push_submit(Err(ClientError::CredentialInvalid));
            s
        },
        {
            let s = ScriptedService::default();
            s.push_poll(Err(ClientError::Service(format!(
                "Gemini video status error 404 Not Found: {{\"error\":{{\"message\":\"{ENTITY_NOT_FOUND}\"}}}}"
            ))));
            s
        },
        {
            let s = ScriptedService::default();
            s.push_poll(Ok(done_with_uri("https://files.example/v.mp4")));
            s.push_fetch(Err(ClientError::CredentialInvalid));
            s
        },
    ];

    for service in scripts {
        let mut h = start(service);
        h.studio.generate(draft("a lantern")).await.unwrap();

        let events = h.until_terminal().await;
        assert!(matches!(events.last(), Some(StudioEvent::CredentialReset)));
        assert!(!events.iter().any(|e| matches!(e, StudioEvent::Failed(_))));

        let status = h.studio.status().await.unwrap();
        assert_eq!(status.phase, Phase::Idle);
        assert!(status.credential_reset);
        assert!(status.last_failure.is_none());
        assert!(h.studio.history().await.is_empty());
        h.stop().await;
    }
}

#[tokio::test]
async fn reset_takes_priority_over_quota_wording() {
    let service = ScriptedService::default();
    service.push_submit(Err(ClientError::Service(format!(
        "RESOURCE_EXHAUSTED quota: {ENTITY_NOT_FOUND}"
    ))));
    let mut h = start(service);
    h.studio.generate(draft("a lantern")).await.unwrap();
    let events = h.until_terminal().await;
    assert!(matches!(events.last(), Some(StudioEvent::CredentialReset)));
    h.stop().await;
}

#[tokio::test]
async fn missing_key_runs_selection_before_submitting() {
    let mut h = start_with(
        ScriptedService::succeeding(),
        FakeCredentials::new(false),
        Duration::from_millis(1),
    );
    h.studio.generate(draft("a tide pool")).await.unwrap();
    h.until_terminal().await;
    assert_eq!(h.credentials.prompts.load(Ordering::SeqCst), 1);
    assert_eq!(h.service.submit_calls.load(Ordering::SeqCst), 1);
    h.stop().await;
}

#[tokio::test]
async fn second_submission_while_polling_is_busy() {
    let mut h = start_with(
        ScriptedService::default(),
        FakeCredentials::new(true),
        Duration::from_secs(60),
    );
    h.studio.generate(draft("first")).await.unwrap();
    h.until_phase(Phase::Polling).await;

    let err = h.studio.generate(draft("second")).await.unwrap_err();
    assert_eq!(err, SubmitError::Busy);
    assert_eq!(h.studio.submit().await, Err(SubmitError::Busy));
    assert_eq!(h.service.submit_calls.load(Ordering::SeqCst), 1);
    h.stop().await;
}

#[tokio::test]
async fn remove_releases_exactly_once() {
    let mut h = start(ScriptedService::succeeding());
    h.studio.generate(draft("a comet")).await.unwrap();
    h.until_terminal().await;
    let video = h.studio.history().await.remove(0);

    assert!(!h.studio.remove("no-such-video").await);
    assert!(h.media.released().is_empty());

    assert!(h.studio.remove(&video.id).await);
    assert!(!h.studio.remove(&video.id).await);
    assert_eq!(h.media.released(), vec![video.playable.url.clone()]);
    assert!(h.studio.history().await.is_empty());

    let media = h.media.clone();
    h.stop().await;
    assert_eq!(media.released().len(), 1);
}

#[tokio::test]
async fn shutdown_releases_remaining_videos() {
    let service = ScriptedService::succeeding();
    service.push_submit(Ok(JobHandle("operations/second".into())));
    service.push_poll(Ok(done_with_uri("https://files.example/w.mp4")));
    service.push_fetch(Ok(b"more".to_vec()));
    let mut h = start(service);

    h.studio.generate(draft("one")).await.unwrap();
    h.until_terminal().await;
    h.studio.generate(draft("two")).await.unwrap();
    h.until_terminal().await;
    assert_eq!(h.media.allocated.lock().unwrap().len(), 2);

    let studio = h.studio.clone();
    let media = h.media.clone();
    h.stop().await;

    let mut released = media.released();
    released.sort();
    assert_eq!(released.len(), 2);
    assert!(studio.status().await.is_none());
    assert_eq!(
        studio.generate(draft("late")).await,
        Err(SubmitError::Unavailable)
    );
}

#[tokio::test]
async fn failed_download_leaves_history_untouched() {
    let service = ScriptedService::default();
    service.push_poll(Ok(done_with_uri("https://files.example/v.mp4")));
    service.push_fetch(Err(ClientError::FetchFailed {
        status: 503,
        body: "backend unavailable".into(),
    }));
    let mut h = start(service);
    h.studio.generate(draft("a tram at night")).await.unwrap();

    let events = h.until_terminal().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, StudioEvent::Phase(Phase::Fetching))));
    let failure = failure_of(&events);
    assert_eq!(failure.kind, FailureKind::Generic);
    assert!(failure.message.contains("503"));

    let status = h.studio.status().await.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert!(status.job.is_none());
    assert!(h.studio.history().await.is_empty());
    assert!(h.media.released().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn storage_failure_is_a_generic_failure() {
    let mut h = start(ScriptedService::succeeding());
    h.media.fail_allocate.store(true, Ordering::SeqCst);
    h.studio.generate(draft("a tram at night")).await.unwrap();

    let failure = failure_of(&h.until_terminal().await);
    assert_eq!(failure.kind, FailureKind::Generic);
    assert!(failure.message.contains("No space left"));

    let status = h.studio.status().await.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.prompt, "a tram at night");
    assert!(h.studio.history().await.is_empty());

    let media = h.media.clone();
    h.stop().await;
    assert!(media.released().is_empty());
}

#[tokio::test]
async fn panicking_job_fails_and_frees_the_studio() {
    let service = ScriptedService::succeeding();
    service.panic_on_submit.store(true, Ordering::SeqCst);
    let mut h = start(service);

    h.studio.generate(draft("a kite")).await.unwrap();
    let failure = failure_of(&h.until_terminal().await);
    assert_eq!(failure.kind, FailureKind::Generic);
    assert_eq!(h.studio.status().await.unwrap().phase, Phase::Failed);

    h.studio.generate(draft("a kite")).await.unwrap();
    assert!(matches!(
        h.until_terminal().await.last(),
        Some(StudioEvent::Completed(_))
    ));
    h.stop().await;
}

#[tokio::test]
async fn rejected_key_is_not_resubmitted() {
    if std::env::var(API_KEY_ENV).is_ok() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let credentials = Arc::new(SettingsCredentials::new(
        SharedCredential::default(),
        dir.path().into(),
        false,
    ));
    credentials.select("rejected-key").unwrap();

    let service = Arc::new(ScriptedService::default());
    service.push_submit(Err(ClientError::CredentialInvalid));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let on_reset = credentials.clone();
    let (studio, task) = Studio::spawn(
        service.clone(),
        Arc::new(CountingMedia::default()),
        credentials.clone(),
        StudioConfig {
            poll_interval: Duration::from_millis(1),
        },
        Some(Arc::new(move |event: StudioEvent| {
            if matches!(event, StudioEvent::CredentialReset) {
                on_reset.reject_current();
            }
            let _ = events_tx.send(event);
        })),
    );

    studio.generate(draft("a lantern")).await.unwrap();
    let reset = until_terminal(&mut events).await;
    assert!(matches!(reset.last(), Some(StudioEvent::CredentialReset)));

    assert_eq!(
        studio.generate(draft("a lantern")).await,
        Err(SubmitError::CredentialRequired)
    );
    assert_eq!(service.submit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(studio.status().await.unwrap().phase, Phase::Idle);

    credentials.select("fresh-key").unwrap();
    studio.generate(draft("a lantern")).await.unwrap();
    until_phase(&mut events, Phase::Polling).await;
    assert_eq!(service.submit_calls.load(Ordering::SeqCst), 2);

    studio.shutdown().await;
    task.await.unwrap();
}
