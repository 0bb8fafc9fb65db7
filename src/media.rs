use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A locally playable copy of a finished video. Owned by exactly one gallery
/// entry and released when that entry is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayableUrl {
    pub url: String,
    pub path: PathBuf,
}

impl PlayableUrl {
    pub fn from_path(path: PathBuf) -> Self {
        Self {
            url: format!("file://{}", path.display()),
            path,
        }
    }
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn allocate(&self, id: &str, bytes: &[u8]) -> Result<PlayableUrl>;

    async fn release(&self, playable: &PlayableUrl);
}

/// Writes videos under `{media_dir}/session-{uuid}/`. The session directory
/// keeps concurrent processes from touching each other's files.
pub struct DiskMediaStore {
    dir: PathBuf,
}

impl DiskMediaStore {
    pub async fn open(media_dir: &Path) -> Result<Self> {
        let dir = media_dir.join(format!("session-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create media dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl MediaStore for DiskMediaStore {
    async fn allocate(&self, id: &str, bytes: &[u8]) -> Result<PlayableUrl> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create media dir {}", self.dir.display()))?;
        let path = self.dir.join(format!("{id}.mp4"));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), size = bytes.len(), "stored video");
        Ok(PlayableUrl::from_path(path))
    }

    async fn release(&self, playable: &PlayableUrl) {
        if let Err(e) = tokio::fs::remove_file(&playable.path).await {
            warn!(path = %playable.path.display(), "failed to release video: {e}");
        }
        // Last file out removes the session directory; fails harmlessly otherwise.
        let _ = tokio::fs::remove_dir(&self.dir).await;
    }
}
