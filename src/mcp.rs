use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ErrorData, ServerHandler,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::credentials::SettingsCredentials;
use crate::tasks::{AspectRatio, Draft, ReferenceImage, Resolution, StudioHandle, SubmitError};

// ---------------------------------------------------------------------------
// Tool parameter schemas (derive JsonSchema for rmcp auto-schema)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateVideoParams {
    /// Text prompt describing the video. May be omitted when image_path is given.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Local path of a reference image (png, jpeg, webp or gif) to animate.
    #[serde(default)]
    pub image_path: Option<String>,
    /// Video resolution: "720p" or "1080p". Defaults to "720p".
    #[serde(default)]
    pub resolution: Option<String>,
    /// Aspect ratio: "16:9" or "9:16". Defaults to "16:9".
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

impl GenerateVideoParams {
    /// Apply defaults and validate values. The image file is read here.
    pub async fn into_draft(self) -> Result<Draft, String> {
        let resolution = match self.resolution.as_deref() {
            Some(r) => r.parse::<Resolution>()?,
            None => Resolution::default(),
        };
        let aspect_ratio = match self.aspect_ratio.as_deref() {
            Some(r) => r.parse::<AspectRatio>()?,
            None => AspectRatio::default(),
        };
        let image = match self.image_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => Some(
                ReferenceImage::from_path(Path::new(path))
                    .await
                    .map_err(|e| format!("{e:#}"))?,
            ),
            None => None,
        };
        Ok(Draft {
            prompt: self.prompt.unwrap_or_default(),
            image,
            resolution,
            aspect_ratio,
        })
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RemoveVideoParams {
    /// ID of the gallery entry to remove.
    pub id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SelectApiKeyParams {
    /// Gemini API key from a Google Cloud project with billing enabled.
    pub api_key: String,
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct VeoStudioMcp {
    studio: StudioHandle,
    credentials: Arc<SettingsCredentials>,
    tool_router: ToolRouter<Self>,
}

impl VeoStudioMcp {
    pub fn new(studio: StudioHandle, credentials: Arc<SettingsCredentials>) -> Self {
        Self {
            studio,
            credentials,
            tool_router: Self::tool_router(),
        }
    }
}

fn json_result(value: serde_json::Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(value.to_string())])
}

#[tool_router]
impl VeoStudioMcp {
    #[tool(description = "Generate a video with Veo from a text prompt and/or a reference image. \
        Returns immediately; generation takes 1-5 minutes. Poll studio_status until the phase is \
        'succeeded' or 'failed', then call list_videos. Only one video can be generated at a time. \
        Resolutions: 720p (default), 1080p. Aspect ratios: 16:9 (default), 9:16.")]
    async fn generate_video(
        &self,
        Parameters(params): Parameters<GenerateVideoParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let draft = match params.into_draft().await {
            Ok(draft) => draft,
            Err(e) => return Ok(CallToolResult::error(vec![Content::text(e)])),
        };

        match self.studio.generate(draft).await {
            Ok(()) => Ok(json_result(serde_json::json!({
                "status": "submitted",
                "message": "Video generation started. Use studio_status to check progress."
            }))),
            Err(SubmitError::Unavailable) => Err(ErrorData::internal_error(
                "the studio has shut down",
                None,
            )),
            Err(SubmitError::CredentialRequired) => Ok(CallToolResult::error(vec![Content::text(
                "No usable API key is selected. Ask the user for a key from a billing-enabled \
                 project and call select_api_key.",
            )])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to submit video: {e}"
            ))])),
        }
    }

    #[tool(description = "Report the generation state: phase (idle/submitting/polling/fetching/\
        succeeded/failed), the current status message, the last failure with a remediation hint, \
        and whether the API key was rejected (credentialReset) and must be replaced with select_api_key.")]
    async fn studio_status(&self) -> Result<CallToolResult, ErrorData> {
        let status = self
            .studio
            .status()
            .await
            .ok_or_else(|| ErrorData::internal_error("the studio has shut down", None))?;
        let mut value = serde_json::to_value(&status).map_err(|e| {
            ErrorData::internal_error(format!("Failed to serialize status: {e}"), None)
        })?;
        value["hasApiKey"] = serde_json::Value::Bool(self.credentials.credential().is_set());
        Ok(json_result(value))
    }

    #[tool(description = "List finished videos, most recent first, with their local file paths.")]
    async fn list_videos(&self) -> Result<CallToolResult, ErrorData> {
        let videos = self.studio.history().await;
        let value = serde_json::to_value(&videos).map_err(|e| {
            ErrorData::internal_error(format!("Failed to serialize videos: {e}"), None)
        })?;
        Ok(json_result(value))
    }

    #[tool(description = "Remove a finished video from the gallery and delete its local file.")]
    async fn remove_video(
        &self,
        Parameters(params): Parameters<RemoveVideoParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let removed = self.studio.remove(&params.id).await;
        Ok(json_result(serde_json::json!({
            "id": params.id,
            "removed": removed,
        })))
    }

    #[tool(description = "Select the Gemini API key used for generation. Required after \
        studio_status reports credentialReset. The key must belong to a project with billing \
        enabled; see https://ai.google.dev/gemini-api/docs/billing")]
    async fn select_api_key(
        &self,
        Parameters(params): Parameters<SelectApiKeyParams>,
    ) -> Result<CallToolResult, ErrorData> {
        if params.api_key.trim().is_empty() {
            return Ok(CallToolResult::error(vec![Content::text(
                "api_key must not be empty",
            )]));
        }
        match self.credentials.select(&params.api_key) {
            Ok(()) => Ok(json_result(serde_json::json!({ "ok": true }))),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to save API key: {e:#}"
            ))])),
        }
    }
}

#[tool_handler]
impl ServerHandler for VeoStudioMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(SERVER_INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

const SERVER_INSTRUCTIONS: &str = "\
Veo Studio MCP server. Generates short videos with Google's Veo models.

# Workflow

1. Call generate_video with a prompt, a reference image path, or both.
2. Poll studio_status every ~10s. The phase moves submitting → polling → fetching → succeeded.
3. On success, list_videos returns the new video first, with its local file path.
4. On failure, studio_status.lastFailure has the message and a hint. kind=quota_exceeded means
   the usage allotment is used up; do not retry immediately.
5. If studio_status.credentialReset is true, the API key was rejected. Ask the user for a key
   from a billing-enabled project and call select_api_key, then submit again.
6. Remove videos the user no longer needs with remove_video; this deletes the local file.

# Prompt tips

Describe subject, action, setting, lighting and camera movement. Prefer one continuous shot
with slow, clear motion. When animating a reference image, describe only the motion.
";
