use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::anyhow;

use audiofetch_core::fs_paths;

fn bin_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    }
}

fn managed_ytdlp_path() -> Option<PathBuf> {
    Some(fs_paths::managed_bin_dir()?.join(bin_name()))
}

async fn answers_version(program: &Path) -> bool {
    matches!(
        tokio::process::Command::new(program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await,
        Ok(status) if status.success()
    )
}

/// Locates the fetcher: an explicit override, then one on `PATH`, then the managed copy.
pub async fn find_ytdlp(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!("Configured yt-dlp {} does not exist", path.display());
    }

    let on_path = PathBuf::from(bin_name());
    if answers_version(&on_path).await {
        return Some(on_path);
    }

    let managed = managed_ytdlp_path()?;
    if managed.exists() {
        return Some(managed);
    }

    None
}

pub async fn require_ytdlp(override_path: Option<&Path>) -> anyhow::Result<PathBuf> {
    find_ytdlp(override_path)
        .await
        .ok_or_else(|| anyhow!("yt-dlp not found on PATH or in {}", managed_dir_display()))
}

fn managed_dir_display() -> String {
    fs_paths::managed_bin_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| "the data directory".into())
}
