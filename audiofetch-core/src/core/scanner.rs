use std::path::Path;

use walkdir::WalkDir;

pub const AUDIO_EXTENSIONS: &[&str] = &["m4a", "mp3", "opus", "webm", "aac", "flac", "wav", "ogg"];

pub fn is_audio_file(name: &str) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty() && AUDIO_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e))
}

/// Base names of every audio file below `directory`, in lexical traversal order.
///
/// A missing directory yields nothing. Entries that cannot be read are logged and skipped.
pub fn scan(directory: &Path) -> Vec<String> {
    if !directory.is_dir() {
        tracing::debug!("Scan skipped, not a directory: {}", directory.display());
        return Vec::new();
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(directory).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry under {}: {}", directory.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_audio_file(&name) {
            files.push(name.into_owned());
        }
    }

    tracing::debug!("Found {} audio files in {}", files.len(), directory.display());
    files
}
