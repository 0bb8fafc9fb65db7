use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::settings::{self, API_KEY_ENV};

/// Process-wide API key. Readers take a copy at call time, so replacing the
/// key affects the very next request.
#[derive(Debug, Clone, Default)]
pub struct SharedCredential {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedCredential {
    pub fn new(key: Option<String>) -> Self {
        let shared = Self::default();
        shared.set(key);
        shared
    }

    pub fn get(&self) -> Option<String> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }

    pub fn set(&self, key: Option<String>) {
        let key = key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if let Ok(mut guard) = self.inner.write() {
            *guard = key;
        }
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

/// Host-side credential selection.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn has_valid_credential(&self) -> bool;

    /// Run the selection flow. Resolves once it completes; the new key is not
    /// verified against the service.
    async fn prompt_for_credential(&self) -> Result<()>;
}

/// Credentials backed by `GEMINI_API_KEY` and the settings file. When
/// interactive, the selection flow asks for a key on the terminal and stores it.
pub struct SettingsCredentials {
    credential: SharedCredential,
    data_dir: PathBuf,
    interactive: bool,
    /// Last key the service rejected. Never reloaded from env or settings.
    rejected: Mutex<Option<String>>,
}

impl SettingsCredentials {
    pub fn new(credential: SharedCredential, data_dir: PathBuf, interactive: bool) -> Self {
        Self {
            credential,
            data_dir,
            interactive,
            rejected: Mutex::new(None),
        }
    }

    pub fn credential(&self) -> &SharedCredential {
        &self.credential
    }

    /// Make `key` the active credential and persist it.
    pub fn select(&self, key: &str) -> Result<()> {
        settings::save_api_key(&self.data_dir, key.trim())?;
        self.credential.set(Some(key.to_string()));
        if let Ok(mut rejected) = self.rejected.lock() {
            *rejected = None;
        }
        info!("API key selected");
        Ok(())
    }

    /// Forget the active key after the service rejected it. Only an explicit
    /// `select` brings a key back.
    pub fn reject_current(&self) {
        let key = self.credential.get();
        self.credential.set(None);
        if let (Some(key), Ok(mut rejected)) = (key, self.rejected.lock()) {
            *rejected = Some(key);
        }
    }

    fn reload(&self) {
        let key = settings::load_settings(&self.data_dir).resolved_api_key();
        let is_rejected = match (&key, self.rejected.lock()) {
            (Some(key), Ok(rejected)) => rejected.as_deref() == Some(key.as_str()),
            _ => false,
        };
        if is_rejected {
            warn!("configured API key was rejected by the service; select a new one");
            self.credential.set(None);
        } else {
            self.credential.set(key);
        }
    }
}

#[async_trait]
impl CredentialProvider for SettingsCredentials {
    async fn has_valid_credential(&self) -> bool {
        self.credential.is_set()
    }

    async fn prompt_for_credential(&self) -> Result<()> {
        if !self.interactive {
            self.reload();
            if !self.credential.is_set() {
                warn!(
                    "no API key configured; set {API_KEY_ENV} or apiKey in {}",
                    self.data_dir.join(settings::SETTINGS_FILE).display()
                );
            }
            return Ok(());
        }

        let key = tokio::task::spawn_blocking(|| {
            dialoguer::Password::new()
                .with_prompt("Gemini API key (from a project with billing enabled)")
                .interact()
        })
        .await
        .context("credential prompt task panicked")?
        .context("failed to read API key")?;

        self.select(&key)
    }
}
