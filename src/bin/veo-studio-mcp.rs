//! Standalone MCP server binary for Veo Studio.
//!
//! Communicates with AI clients over stdio JSON-RPC. The gallery lives in
//! memory for the lifetime of the process.

use anyhow::{Context, Result};
use rmcp::{transport::stdio, ServiceExt};
use std::sync::Arc;
use tracing::{info, warn};

use veo_studio::mcp::VeoStudioMcp;
use veo_studio::tasks::{EventCallback, Studio, StudioEvent};
use veo_studio::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Log to stderr so stdout stays clean for MCP JSON-RPC
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let ctx = AppContext::load(false).await?;

    // A rejected key is forgotten; the client selects a new one via select_api_key.
    let credentials = ctx.credentials.clone();
    let on_event: EventCallback = Arc::new(move |event| match event {
        StudioEvent::CredentialReset => {
            credentials.reject_current();
            warn!("API key rejected by the service; waiting for select_api_key");
        }
        StudioEvent::Completed(video) => {
            info!(video = %video.id, path = %video.playable.path.display(), "video ready");
        }
        _ => {}
    });

    let (studio, studio_task) = Studio::spawn(
        ctx.client.clone(),
        ctx.media.clone(),
        ctx.credentials.clone(),
        ctx.studio_config(),
        Some(on_event),
    );

    let server = VeoStudioMcp::new(studio.clone(), ctx.credentials.clone());

    info!(data_dir = %ctx.data_dir.display(), "Veo Studio MCP server starting on stdio");

    let service = server
        .serve(stdio())
        .await
        .context("MCP server failed to start")?;

    service.waiting().await?;

    studio.shutdown().await;
    let _ = studio_task.await;

    Ok(())
}
