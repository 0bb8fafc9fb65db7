use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DATA_DIR_ENV: &str = "VEO_STUDIO_DATA_DIR";
pub const SETTINGS_FILE: &str = "settings.json";

// ---------------------------------------------------------------------------
// Settings, read from {dataDir}/settings.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    #[serde(alias = "baseURL")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Where playable copies of finished videos live. Defaults to `{dataDir}/media`.
    #[serde(default)]
    pub media_dir: Option<PathBuf>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
            poll_interval_secs: default_poll_interval_secs(),
            media_dir: None,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn media_dir(&self, data_dir: &Path) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("media"))
    }

    /// The key to use: `GEMINI_API_KEY` wins over the settings file.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| Some(self.api_key.clone()).filter(|k| !k.trim().is_empty()))
            .map(|k| k.trim().to_string())
    }
}

/// Load settings, falling back to defaults when the file is missing or broken.
pub fn load_settings(data_dir: &Path) -> Settings {
    let path = data_dir.join(SETTINGS_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), "ignoring unparseable settings: {e}");
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

/// Write `apiKey` into the settings file, keeping every other field as-is.
pub fn save_api_key(data_dir: &Path, api_key: &str) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let path = data_dir.join(SETTINGS_FILE);

    let mut config = match std::fs::read_to_string(&path) {
        Ok(contents) => {
            serde_json::from_str(&contents).unwrap_or_else(|_| serde_json::json!({}))
        }
        Err(_) => serde_json::json!({}),
    };

    config
        .as_object_mut()
        .with_context(|| format!("{} is not a JSON object", path.display()))?
        .insert("apiKey".to_string(), serde_json::Value::String(api_key.to_string()));

    let contents =
        serde_json::to_string_pretty(&config).context("failed to serialize settings")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Resolve the app data directory cross-platform.
pub fn resolve_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    #[cfg(target_os = "macos")]
    {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(home.join("Library/Application Support/dev.veo-studio"))
    }

    #[cfg(not(target_os = "macos"))]
    {
        let data = dirs::data_dir().context("could not determine data directory")?;
        Ok(data.join("veo-studio"))
    }
}
