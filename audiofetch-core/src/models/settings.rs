use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::fs_paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "fs_paths::default_library_dir")]
    pub library_dir: PathBuf,
    #[serde(default = "default_cookies_file")]
    pub cookies_file: Option<PathBuf>,
    #[serde(default)]
    pub ytdlp_path: Option<PathBuf>,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub advanced: AdvancedSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_title_template")]
    pub title_template: String,
    #[serde(default = "default_true")]
    pub write_thumbnail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_finish_grace_ms")]
    pub finish_grace_ms: u64,
}

impl AdvancedSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn finish_grace(&self) -> Duration {
        Duration::from_millis(self.finish_grace_ms)
    }
}

fn default_schema_version() -> u32 {
    1
}

fn default_cookies_file() -> Option<PathBuf> {
    Some(fs_paths::default_cookies_file())
}

pub fn default_quality() -> String {
    "bestaudio/best".into()
}

pub fn default_retry_count() -> u32 {
    5
}

pub fn default_title_template() -> String {
    "%(title)s.%(ext)s".into()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    10 * 60
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_finish_grace_ms() -> u64 {
    5000
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            retry_count: default_retry_count(),
            title_template: default_title_template(),
            write_thumbnail: true,
        }
    }
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            finish_grace_ms: default_finish_grace_ms(),
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            library_dir: fs_paths::default_library_dir(),
            cookies_file: default_cookies_file(),
            ytdlp_path: None,
            download: DownloadSettings::default(),
            advanced: AdvancedSettings::default(),
        }
    }
}
