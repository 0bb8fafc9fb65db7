use serde::Serialize;

use super::video::JobError;
use crate::gemini::{ClientError, ENTITY_NOT_FOUND};

pub const QUOTA_HINT: &str = "You have exhausted your Veo usage allotment. Check your plan and \
    billing details at https://ai.google.dev/gemini-api/docs/rate-limits and \
    https://aistudio.google.com/usage";

pub const EMPTY_RESULT_HINT: &str = "This usually means the prompt or reference image was \
    blocked by the content safety filters. Try rephrasing the prompt or using a different image.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    QuotaExceeded,
    EmptyResult,
    Generic,
}

/// A failure the user gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The key no longer works; the host must pick another one. Not shown as an error.
    CredentialReset,
    Failed(Failure),
}

/// Decide how a failed job is surfaced. Credential invalidation wins over
/// every other classification.
pub fn classify(err: &JobError) -> Outcome {
    let raw = err.to_string();

    if matches!(err, JobError::Client(ClientError::CredentialInvalid))
        || raw.contains(ENTITY_NOT_FOUND)
    {
        return Outcome::CredentialReset;
    }

    if let JobError::NoVideo { filtered_reasons } = err {
        let hint = if filtered_reasons.is_empty() {
            EMPTY_RESULT_HINT.to_string()
        } else {
            format!("{EMPTY_RESULT_HINT} Reported reasons: {}", filtered_reasons.join("; "))
        };
        return Outcome::Failed(Failure {
            kind: FailureKind::EmptyResult,
            message: raw,
            hint: Some(hint),
        });
    }

    let message = unwrap_error_message(&raw);
    if is_quota_error(&raw) || is_quota_error(&message) {
        return Outcome::Failed(Failure {
            kind: FailureKind::QuotaExceeded,
            message,
            hint: Some(QUOTA_HINT.to_string()),
        });
    }

    Outcome::Failed(Failure {
        kind: FailureKind::Generic,
        message,
        hint: None,
    })
}

/// "quota" anywhere, case-insensitive, or `RESOURCE_EXHAUSTED` / `429` as a
/// whole token. Ids and paths that merely contain the digits do not count.
pub fn is_quota_error(message: &str) -> bool {
    if message.to_lowercase().contains("quota") {
        return true;
    }
    message
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token == "RESOURCE_EXHAUSTED" || token == "429")
}

/// Pull a readable message out of text that may embed a JSON error object,
/// e.g. `Error: {"error":{"message":"X"}}` → `X`. Falls back to the raw text.
pub fn unwrap_error_message(raw: &str) -> String {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return raw.to_string();
    };
    if end <= start {
        return raw.to_string();
    }

    let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw[start..=end]) else {
        return raw.to_string();
    };

    value["error"]["message"]
        .as_str()
        .or_else(|| value["message"].as_str())
        .map(String::from)
        .unwrap_or_else(|| raw.to_string())
}
