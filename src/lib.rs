use std::sync::Arc;

use clap::Parser;

use audiofetch_core::core::launcher::{FetcherLauncher, ProcessLauncher};
use audiofetch_core::core::supervisor::{Supervisor, SupervisorConfig};
use audiofetch_core::models::settings::AppSettings;

pub mod cli;
pub mod commands;
pub mod core;
pub mod storage;

pub struct AppState {
    pub supervisor: Supervisor,
    pub settings: AppSettings,
}

impl AppState {
    /// Builds the state around the real fetcher, failing if it cannot be found.
    pub async fn initialize(settings: AppSettings) -> anyhow::Result<Self> {
        let ytdlp = core::ytdlp::require_ytdlp(settings.ytdlp_path.as_deref()).await?;
        tracing::info!("Using yt-dlp at {}", ytdlp.display());
        Ok(Self::with_launcher(settings, Arc::new(FetcherLauncher::new(ytdlp))).await)
    }

    pub async fn with_launcher(settings: AppSettings, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let supervisor = Supervisor::new(SupervisorConfig::from_settings(&settings), launcher);
        supervisor.history().bootstrap(&settings.library_dir).await;
        Self { supervisor, settings }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let settings = storage::config::load_settings();
    cli::dispatch(args.command, settings).await
}
