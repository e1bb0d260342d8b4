use std::path::{Path, PathBuf};

use audiofetch_core::fs_paths;
use audiofetch_core::models::settings::AppSettings;

const SETTINGS_FILE: &str = "settings.json";

pub fn settings_path() -> PathBuf {
    fs_paths::data_dir_or_cwd().join(SETTINGS_FILE)
}

pub fn load_settings() -> AppSettings {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!("No settings at {} ({}), using defaults", path.display(), e);
            return AppSettings::default();
        }
    };

    match serde_json::from_str::<AppSettings>(&raw) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Ignoring unreadable settings {}: {}", path.display(), e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> anyhow::Result<()> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json)?;
    Ok(())
}
