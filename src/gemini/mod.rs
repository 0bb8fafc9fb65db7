pub mod types;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::fmt;
use tracing::debug;
use types::{InlineImage, Operation, OperationCreated, PredictInstance, PredictParameters, PredictRequest};

use crate::credentials::SharedCredential;
use crate::tasks::GenerationRequest;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "veo-3.1-fast-generate-preview";

/// Text the service returns when the configured key no longer resolves to a
/// usable project.
pub const ENTITY_NOT_FOUND: &str = "Requested entity was not found";

// ---------------------------------------------------------------------------
// Service boundary
// ---------------------------------------------------------------------------

/// Opaque handle of a submitted job (the long-running operation name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a job as reported by one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub done: bool,
    pub error: Option<String>,
    pub result_uri: Option<String>,
    /// Safety-filter reasons reported when the service withheld its output.
    pub filtered_reasons: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The credential no longer resolves to a valid billing project.
    #[error("Requested entity was not found.")]
    CredentialInvalid,

    #[error("{0}")]
    Service(String),

    #[error("failed to download video ({status}): {body}")]
    FetchFailed { status: u16, body: String },
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Service(format!("request timed out: {err}"))
        } else if err.is_connect() {
            ClientError::Service(format!("connection failed: {err}"))
        } else {
            ClientError::Service(err.to_string())
        }
    }
}

/// The three remote calls a generation job needs. Every call is a single
/// round-trip; implementations never retry.
#[async_trait]
pub trait VideoService: Send + Sync {
    async fn submit(&self, request: &GenerationRequest) -> Result<JobHandle, ClientError>;

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, ClientError>;

    async fn fetch_artifact(&self, uri: &str) -> Result<Vec<u8>, ClientError>;
}

// ---------------------------------------------------------------------------
// Gemini API client
// ---------------------------------------------------------------------------

pub struct GeminiClient {
    base_url: String,
    model: String,
    credential: SharedCredential,
    http: Client,
}

impl GeminiClient {
    pub fn new(base_url: String, model: String, credential: SharedCredential) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            credential,
            http: Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Attach the key as it is configured right now.
    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, ClientError> {
        let key = self.credential.get().ok_or(ClientError::CredentialInvalid)?;
        Ok(builder.header("x-goog-api-key", key))
    }

    fn build_request(request: &GenerationRequest) -> PredictRequest {
        let image = request.image.as_ref().map(|img| InlineImage {
            bytes_base64_encoded: base64::engine::general_purpose::STANDARD.encode(&img.bytes),
            mime_type: img.mime_type.clone(),
        });
        PredictRequest {
            instances: vec![PredictInstance {
                prompt: request.prompt.clone(),
                image,
            }],
            parameters: PredictParameters {
                aspect_ratio: request.aspect_ratio.as_str().to_string(),
                resolution: request.resolution.as_str().to_string(),
                number_of_videos: 1,
            },
        }
    }
}

/// Map a non-success API response to the client's error taxonomy.
async fn rejection(context: &str, resp: Response) -> ClientError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if body.contains(ENTITY_NOT_FOUND) {
        return ClientError::CredentialInvalid;
    }
    ClientError::Service(format!("Gemini {context} error {status}: {body}"))
}

#[async_trait]
impl VideoService for GeminiClient {
    /// POST /models/{model}:predictLongRunning, returns the operation name.
    async fn submit(&self, request: &GenerationRequest) -> Result<JobHandle, ClientError> {
        let url = format!("{}/models/{}:predictLongRunning", self.base_url, self.model);
        let body = Self::build_request(request);
        let resp = self
            .authorized(self.http.post(&url))?
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(rejection("video submit", resp).await);
        }

        let created = resp
            .json::<OperationCreated>()
            .await
            .map_err(|e| ClientError::Service(format!("failed to parse submit response: {e}")))?;

        let name = created
            .name
            .ok_or_else(|| ClientError::Service("no operation name in submit response".into()))?;
        debug!(operation = %name, "video job submitted");
        Ok(JobHandle(name))
    }

    /// GET /{operation name}: poll operation status.
    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, ClientError> {
        let url = format!("{}/{}", self.base_url, handle.0);
        let resp = self.authorized(self.http.get(&url))?.send().await?;

        if !resp.status().is_success() {
            return Err(rejection("video status", resp).await);
        }

        let op = resp
            .json::<Operation>()
            .await
            .map_err(|e| ClientError::Service(format!("failed to parse operation status: {e}")))?;

        Ok(JobStatus {
            done: op.done.unwrap_or(false),
            error: op.error.as_ref().map(|e| e.describe()),
            result_uri: op.video_uri(),
            filtered_reasons: op.filtered_reasons(),
        })
    }

    /// GET {uri}: download the finished video with the same key.
    async fn fetch_artifact(&self, uri: &str) -> Result<Vec<u8>, ClientError> {
        let resp = self.authorized(self.http.get(uri))?.send().await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::CredentialInvalid);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::FetchFailed {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }
}
