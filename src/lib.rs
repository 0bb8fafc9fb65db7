pub mod credentials;
pub mod gemini;
pub mod mcp;
pub mod media;
pub mod settings;
pub mod tasks;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use credentials::{CredentialProvider, SettingsCredentials, SharedCredential};
use gemini::GeminiClient;
use media::DiskMediaStore;
use settings::Settings;
use tasks::classify::Failure;
use tasks::{
    AspectRatio, Draft, EventCallback, ReferenceImage, Resolution, Studio, StudioConfig,
    StudioEvent,
};

// ---------------------------------------------------------------------------
// Shared wiring for the CLI and the MCP server
// ---------------------------------------------------------------------------

pub struct AppContext {
    pub data_dir: PathBuf,
    pub settings: Settings,
    pub credentials: Arc<SettingsCredentials>,
    pub client: Arc<GeminiClient>,
    pub media: Arc<DiskMediaStore>,
}

impl AppContext {
    pub async fn load(interactive: bool) -> Result<Self> {
        let data_dir = settings::resolve_data_dir()?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let settings = settings::load_settings(&data_dir);
        info!(base_url = %settings.base_url, model = %settings.model, "loaded settings");

        let credential = SharedCredential::new(settings.resolved_api_key());
        let credentials = Arc::new(SettingsCredentials::new(
            credential.clone(),
            data_dir.clone(),
            interactive,
        ));
        let client = Arc::new(GeminiClient::new(
            settings.base_url.clone(),
            settings.model.clone(),
            credential,
        ));
        let media = Arc::new(DiskMediaStore::open(&settings.media_dir(&data_dir)).await?);

        Ok(Self {
            data_dir,
            settings,
            credentials,
            client,
            media,
        })
    }

    pub fn studio_config(&self) -> StudioConfig {
        StudioConfig {
            poll_interval: self.settings.poll_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "veo-studio", version, about = "Generate videos with the Gemini Veo models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a video from a prompt and/or a reference image
    Generate {
        /// What the video should show (optional when --image is given)
        prompt: Option<String>,
        /// Reference image (png, jpeg, webp or gif)
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long, default_value = "720p")]
        resolution: Resolution,
        #[arg(long = "aspect-ratio", default_value = "16:9")]
        aspect_ratio: AspectRatio,
        /// Where to save the video. Defaults to ./veo-{id}.mp4
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Inspect or select the Gemini API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Debug, Subcommand)]
enum KeyAction {
    /// Show whether an API key is configured
    Status,
    /// Select an API key (prompts when omitted)
    Set { key: Option<String> },
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = AppContext::load(true).await?;

    match cli.command {
        Command::Generate {
            prompt,
            image,
            resolution,
            aspect_ratio,
            output,
        } => {
            let image = match image {
                Some(path) => Some(ReferenceImage::from_path(&path).await?),
                None => None,
            };
            let draft = Draft {
                prompt: prompt.unwrap_or_default(),
                image,
                resolution,
                aspect_ratio,
            };
            generate_once(&ctx, draft, output).await
        }
        Command::Key { action } => match action {
            KeyAction::Status => {
                if ctx.credentials.has_valid_credential().await {
                    println!("API key configured");
                } else {
                    println!(
                        "no API key; set {} or run `veo-studio key set`",
                        settings::API_KEY_ENV
                    );
                }
                Ok(())
            }
            KeyAction::Set { key: Some(key) } => ctx.credentials.select(&key),
            KeyAction::Set { key: None } => ctx.credentials.prompt_for_credential().await,
        },
    }
}

/// Run a single job to completion and save the video. A rejected key triggers
/// one round of credential selection and a resubmission.
async fn generate_once(ctx: &AppContext, draft: Draft, output: Option<PathBuf>) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let on_event: EventCallback = Arc::new(move |event: StudioEvent| {
        let _ = events_tx.send(event);
    });

    let (studio, task) = Studio::spawn(
        ctx.client.clone(),
        ctx.media.clone(),
        ctx.credentials.clone(),
        ctx.studio_config(),
        Some(on_event),
    );

    let mut reselected = false;
    let result = loop {
        if let Err(e) = studio.generate(draft.clone()).await {
            break Err(anyhow::Error::from(e));
        }
        let outcome = wait_for_outcome(&mut events_rx).await;
        match outcome {
            JobOutcome::Completed(video) => {
                let target = output
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(format!("veo-{}.mp4", video.id)));
                let saved = save_video(&video.playable.path, &target).await;
                studio.remove(&video.id).await;
                break saved.map(|()| println!("{}", target.display()));
            }
            JobOutcome::Failed(failure) => break Err(failure_error(&failure)),
            JobOutcome::Stopped => break Err(anyhow::anyhow!("studio stopped unexpectedly")),
            JobOutcome::CredentialReset => {
                ctx.credentials.reject_current();
                if reselected {
                    break Err(anyhow::anyhow!("the selected API key was rejected"));
                }
                reselected = true;
                if let Err(e) = ctx.credentials.prompt_for_credential().await {
                    break Err(e);
                }
            }
        }
    };

    studio.shutdown().await;
    let _ = task.await;
    result
}

enum JobOutcome {
    Completed(tasks::CompletedVideo),
    Failed(Failure),
    CredentialReset,
    Stopped,
}

/// Log progress until the running job reaches a terminal event.
async fn wait_for_outcome(events: &mut mpsc::UnboundedReceiver<StudioEvent>) -> JobOutcome {
    while let Some(event) = events.recv().await {
        match event {
            StudioEvent::Phase(phase) => info!(?phase, "phase changed"),
            StudioEvent::Progress { message, polls } => info!(polls, "{message}"),
            StudioEvent::Completed(video) => return JobOutcome::Completed(video),
            StudioEvent::Failed(failure) => return JobOutcome::Failed(failure),
            StudioEvent::CredentialReset => return JobOutcome::CredentialReset,
        }
    }
    JobOutcome::Stopped
}

async fn save_video(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("failed to save video to {}", to.display()))?;
    Ok(())
}

fn failure_error(failure: &Failure) -> anyhow::Error {
    match &failure.hint {
        Some(hint) => anyhow::anyhow!("{}\n{hint}", failure.message),
        None => anyhow::anyhow!("{}", failure.message),
    }
}
