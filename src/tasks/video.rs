use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use super::{CompletedVideo, GenerationRequest};
use crate::gemini::{ClientError, JobHandle, JobStatus, VideoService};
use crate::media::MediaStore;

/// Shown while polling. Purely cosmetic.
const POLL_MESSAGES: &[&str] = &[
    "Warming up the render farm...",
    "Blocking out the first frames...",
    "Teaching pixels to move...",
    "Lighting the scene...",
    "Adding motion and detail...",
    "Almost there, polishing the final cut...",
];

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The operation finished with a job-level error.
    #[error("{0}")]
    Rejected(String),

    #[error("Video generation finished but no video was returned.")]
    NoVideo { filtered_reasons: Vec<String> },

    #[error("failed to store video: {0:#}")]
    Storage(anyhow::Error),

    /// The job task panicked before reporting a result.
    #[error("video generation stopped unexpectedly")]
    Crashed,
}

/// Progress reported from a running job back to the controller.
#[derive(Debug)]
pub enum JobUpdate {
    Submitted(JobHandle),
    Polled {
        status: JobStatus,
        message: &'static str,
        polls: u32,
    },
    Fetching,
    Finished(Result<CompletedVideo, JobError>),
}

/// Execute one generation: submit, poll until done, download, store.
pub async fn run_video_job(
    service: &dyn VideoService,
    media: &dyn MediaStore,
    request: &GenerationRequest,
    poll_interval: Duration,
    updates: &mpsc::UnboundedSender<JobUpdate>,
) -> Result<CompletedVideo, JobError> {
    // Step 1: Submit the long-running operation
    let handle = service.submit(request).await?;
    info!(job = %handle, resolution = %request.resolution, ratio = %request.aspect_ratio, "video job submitted");
    let _ = updates.send(JobUpdate::Submitted(handle.clone()));

    // Step 2: Poll for completion. No overall timeout; the service decides.
    let mut polls: u32 = 0;
    let status = loop {
        sleep(poll_interval).await;
        polls += 1;

        let status = service.poll(&handle).await?;
        let message = POLL_MESSAGES[(polls as usize - 1) % POLL_MESSAGES.len()];
        let done = status.done;
        let _ = updates.send(JobUpdate::Polled {
            status: status.clone(),
            message,
            polls,
        });

        if done {
            break status;
        }
        info!(job = %handle, polls, "{message}");
    };

    if let Some(error) = status.error {
        warn!(job = %handle, "video job failed: {error}");
        return Err(JobError::Rejected(error));
    }
    let uri = status.result_uri.ok_or_else(|| {
        warn!(job = %handle, reasons = ?status.filtered_reasons, "video job returned no video");
        JobError::NoVideo {
            filtered_reasons: status.filtered_reasons.clone(),
        }
    })?;

    // Step 3: Download the video and make it playable
    let _ = updates.send(JobUpdate::Fetching);
    let bytes = service.fetch_artifact(&uri).await?;

    let id = uuid::Uuid::now_v7().to_string();
    let playable = media
        .allocate(&id, &bytes)
        .await
        .map_err(JobError::Storage)?;

    info!(job = %handle, video = %id, size = bytes.len(), "video job completed");

    Ok(CompletedVideo {
        id,
        playable,
        prompt: request.prompt.clone(),
        resolution: request.resolution,
        aspect_ratio: request.aspect_ratio,
        created_at: chrono::Utc::now(),
    })
}
