use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Video generation: long-running operation pattern
// POST {baseURL}/models/{model}:predictLongRunning  → operation name
// GET  {baseURL}/{operation name}                  → done + response | error
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PredictRequest {
    pub instances: Vec<PredictInstance>,
    pub parameters: PredictParameters,
}

#[derive(Debug, Serialize)]
pub struct PredictInstance {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<InlineImage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    pub bytes_base64_encoded: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictParameters {
    pub aspect_ratio: String,
    pub resolution: String,
    /// Always 1. The gallery shows one video per job.
    pub number_of_videos: u32,
}

#[derive(Debug, Deserialize)]
pub struct OperationCreated {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Operation {
    pub done: Option<bool>,
    pub response: Option<OperationResponse>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVideoResponse {
    pub generated_samples: Option<Vec<GeneratedSample>>,
    pub rai_media_filtered_reasons: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct GeneratedSample {
    pub video: Option<GeneratedVideo>,
}

#[derive(Debug, Deserialize)]
pub struct GeneratedVideo {
    pub uri: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub status: Option<String>,
}

impl Operation {
    /// First generated video URI, if the operation produced one.
    pub fn video_uri(&self) -> Option<String> {
        self.video_response()?
            .generated_samples
            .as_ref()?
            .iter()
            .find_map(|s| s.video.as_ref().and_then(|v| v.uri.clone()))
    }

    pub fn filtered_reasons(&self) -> Vec<String> {
        self.video_response()
            .and_then(|r| r.rai_media_filtered_reasons.clone())
            .unwrap_or_default()
    }

    fn video_response(&self) -> Option<&GenerateVideoResponse> {
        self.response.as_ref()?.generate_video_response.as_ref()
    }
}

impl ApiError {
    /// Render the error the way the API would print it, e.g. `RESOURCE_EXHAUSTED (429): Quota exceeded`.
    pub fn describe(&self) -> String {
        let message = self.message.as_deref().unwrap_or("unknown error");
        match (&self.status, self.code) {
            (Some(status), Some(code)) => format!("{status} ({code}): {message}"),
            (Some(status), None) => format!("{status}: {message}"),
            (None, Some(code)) => format!("{code}: {message}"),
            (None, None) => message.to_string(),
        }
    }
}
