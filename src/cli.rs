use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use audiofetch_core::core::history::HistoryStore;
use audiofetch_core::models::progress::Phase;
use audiofetch_core::models::settings::AppSettings;
use audiofetch_core::models::task::TaskParams;

use crate::commands::downloads;
use crate::storage;
use crate::AppState;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);
const FINAL_DRAIN: Duration = Duration::from_millis(300);

/// Download audiobooks with yt-dlp and follow their progress as JSON lines
#[derive(Parser, Debug)]
#[command(name = "audiofetch")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a URL into the library, printing every progress snapshot.
    ///
    /// While running, type `p` to pause, `r` to resume and `s` to stop.
    Download {
        url: String,

        /// Subdirectory of the library to save into
        #[arg(short = 'p', long, default_value = "")]
        save_path: String,

        /// yt-dlp format selector
        #[arg(short, long)]
        quality: Option<String>,

        /// Extractor retry count
        #[arg(long)]
        retries: Option<u32>,

        /// yt-dlp output template
        #[arg(long)]
        template: Option<String>,

        /// Save the thumbnail next to the audio
        #[arg(long, conflicts_with = "no_thumbnail")]
        thumbnail: bool,

        /// Do not save the thumbnail
        #[arg(long)]
        no_thumbnail: bool,
    },
    /// List downloads already present in the library
    History,
    /// Write the effective settings to the settings file so they can be edited
    Init,
}

pub async fn dispatch(command: Command, settings: AppSettings) -> anyhow::Result<()> {
    match command {
        Command::Download {
            url,
            save_path,
            quality,
            retries,
            template,
            thumbnail,
            no_thumbnail,
        } => {
            let write_thumbnail = match (thumbnail, no_thumbnail) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let params = TaskParams {
                url,
                save_path,
                title_template: template,
                quality,
                retry_count: retries,
                write_thumbnail,
            };
            let state = AppState::initialize(settings).await?;
            download(&state, params).await
        }
        Command::History => {
            let history = HistoryStore::new();
            history.bootstrap(&settings.library_dir).await;
            println!("{}", serde_json::to_string_pretty(&history.list().await)?);
            Ok(())
        }
        Command::Init => {
            storage::config::save_settings(&settings)?;
            println!("{}", storage::config::settings_path().display());
            Ok(())
        }
    }
}

async fn download(state: &AppState, params: TaskParams) -> anyhow::Result<()> {
    let (subscriber, mut rx) = state.supervisor.hub().subscribe_channel().await;
    downloads::start_download(state, params)
        .await
        .map_err(anyhow::Error::msg)?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interrupted = false;
    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);

    loop {
        tokio::select! {
            Some(message) = rx.recv() => println!("{}", message),
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(key)) => handle_key(state, key.trim()).await,
                _ => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::info!("Interrupted, stopping download");
                let _ = downloads::stop_download(state).await;
            }
            _ = idle_check.tick() => {
                if !state.supervisor.is_active().await && !state.supervisor.is_paused().await {
                    break;
                }
            }
        }
    }

    while let Ok(Some(message)) = tokio::time::timeout(FINAL_DRAIN, rx.recv()).await {
        println!("{}", message);
    }
    state.supervisor.hub().unsubscribe(subscriber).await;

    let last = state.supervisor.current_progress().await;
    if last.phase == Phase::Error {
        anyhow::bail!("download failed: {}", last.error_message);
    }
    Ok(())
}

async fn handle_key(state: &AppState, key: &str) {
    let result = match key {
        "p" => downloads::pause_download(state).await,
        "r" => downloads::resume_download(state).await,
        "s" => downloads::stop_download(state).await.map(|_| ()),
        "" => Ok(()),
        other => Err(format!("unknown command {:?}, use p, r or s", other)),
    };
    if let Err(e) = result {
        tracing::warn!("{}", e);
    }
}
