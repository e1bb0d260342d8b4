use std::path::PathBuf;

pub fn app_data_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("AUDIOFETCH_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }
    dirs::data_dir().map(|d| d.join("audiofetch"))
}

pub fn data_dir_or_cwd() -> PathBuf {
    app_data_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_library_dir() -> PathBuf {
    data_dir_or_cwd().join("audiobooks")
}

pub fn default_cookies_file() -> PathBuf {
    data_dir_or_cwd().join("cookies").join("cookies.txt")
}

pub fn managed_bin_dir() -> Option<PathBuf> {
    app_data_dir().map(|d| d.join("bin"))
}
