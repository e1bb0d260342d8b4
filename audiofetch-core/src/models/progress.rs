use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

pub const MAX_RECENT_FILES: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Initializing,
    Extracting,
    Downloading,
    Merging,
    Skipped,
    Completed,
    Stopped,
    Error,
    Paused,
}

impl Phase {
    /// Phases a generic percentage line must not flip back to `Downloading`.
    pub fn is_sticky(self) -> bool {
        matches!(self, Phase::Skipped | Phase::Error)
    }
}

/// The most recently completed audio files, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecentFiles(Vec<String>);

impl RecentFiles {
    /// Appends `name` unless an entry equal to it ignoring case already exists, then keeps
    /// only the newest [`MAX_RECENT_FILES`]. Returns whether the name was added.
    pub fn push(&mut self, name: &str) -> bool {
        let name: String = name.nfc().collect();
        let key = fold(&name);
        if self.0.iter().any(|existing| fold(existing) == key) {
            return false;
        }
        self.0.push(name);
        if self.0.len() > MAX_RECENT_FILES {
            let excess = self.0.len() - MAX_RECENT_FILES;
            self.0.drain(..excess);
        }
        true
    }

    pub fn seed<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.push(name.as_ref());
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn fold(name: &str) -> String {
    name.nfc().collect::<String>().to_lowercase()
}

/// Live state of the current task, overwritten in place as fetcher output arrives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub is_downloading: bool,
    pub is_paused: bool,
    /// Overall percentage across all items, always within `0..=100`.
    pub progress: f64,
    pub file_progress: f64,
    pub speed: String,
    pub eta: String,
    pub current_file: String,
    pub status: String,
    pub last_activity: String,
    pub current_index: u32,
    pub total_count: u32,
    pub completed_files: RecentFiles,
    pub current_title: String,
    pub file_size: String,
    pub duration: String,
    pub uploader: String,
    pub view_count: String,
    pub thumbnail: String,
    pub playlist_title: String,
    pub error_message: String,
    pub warning_message: String,
    pub start_time: String,
    pub phase: Phase,
    #[serde(skip)]
    pub(crate) activity_pinned: bool,
}

impl Progress {
    pub fn starting() -> Self {
        Self {
            is_downloading: true,
            status: "Preparing download...".into(),
            last_activity: "Initializing download task".into(),
            start_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            phase: Phase::Initializing,
            ..Default::default()
        }
    }

    /// Records the current file's percentage and derives the overall percentage from it.
    pub fn set_file_progress(&mut self, file_progress: f64) -> f64 {
        let file_progress = file_progress.clamp(0.0, 100.0);
        let overall = overall_progress(self.current_index, self.total_count, file_progress);
        self.file_progress = file_progress;
        self.progress = overall;
        overall
    }

    pub fn set_activity(&mut self, activity: String, pinned: bool) {
        self.last_activity = activity;
        self.activity_pinned = pinned;
    }

    pub fn is_multi_item(&self) -> bool {
        self.total_count > 1
    }
}

/// Overall percentage for a source of `total_count` equally weighted items.
pub fn overall_progress(current_index: u32, total_count: u32, file_progress: f64) -> f64 {
    let overall = if total_count > 0 && current_index > 0 {
        let done = f64::from(current_index - 1);
        (done + file_progress / 100.0) / f64::from(total_count) * 100.0
    } else {
        file_progress
    };
    overall.clamp(0.0, 100.0)
}

/// An immutable copy of [`Progress`] handed to observers.
///
/// `revision` grows with every mutation of the task slot, across tasks, so receivers can
/// tell a newer snapshot from an older one.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub revision: u64,
    pub progress: Progress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_for_playlist_item() {
        let overall = overall_progress(3, 10, 40.0);
        assert!((overall - 24.0).abs() < 1e-9);
    }

    #[test]
    fn overall_without_counters_is_file_progress() {
        assert_eq!(overall_progress(0, 0, 55.5), 55.5);
        assert_eq!(overall_progress(2, 0, 55.5), 55.5);
    }

    #[test]
    fn overall_over_full_range() {
        for total in 1..=12u32 {
            for index in 1..=total {
                for pct in [0.0, 12.5, 50.0, 99.9, 100.0] {
                    let expected = (f64::from(index - 1) + pct / 100.0) / f64::from(total) * 100.0;
                    let got = overall_progress(index, total, pct);
                    assert!((got - expected).abs() < 1e-9);
                    assert!((0.0..=100.0).contains(&got));
                }
            }
        }
    }

    #[test]
    fn overall_clamps_out_of_range_index() {
        assert_eq!(overall_progress(12, 10, 100.0), 100.0);
    }

    #[test]
    fn recent_files_evicts_oldest() {
        let mut files = RecentFiles::default();
        for name in ["a.m4a", "b.m4a", "c.m4a", "d.m4a"] {
            assert!(files.push(name));
        }
        assert_eq!(files.as_slice(), ["b.m4a", "c.m4a", "d.m4a"]);
    }

    #[test]
    fn recent_files_ignores_case_duplicates() {
        let mut files = RecentFiles::default();
        files.push("Chapter 1.m4a");
        assert!(!files.push("chapter 1.M4A"));
        assert_eq!(files.len(), 1);
        assert_eq!(files.as_slice(), ["Chapter 1.m4a"]);
    }

    #[test]
    fn recent_files_compare_normalized_names() {
        let mut files = RecentFiles::default();
        files.push("Caf\u{00e9}.mp3");
        assert!(!files.push("Cafe\u{0301}.mp3"));
    }

    #[test]
    fn seed_keeps_last_three() {
        let mut files = RecentFiles::default();
        files.seed(["1.mp3", "2.mp3", "3.mp3", "4.mp3", "5.mp3"]);
        assert_eq!(files.as_slice(), ["3.mp3", "4.mp3", "5.mp3"]);
    }

    #[test]
    fn progress_serializes_camel_case() {
        let mut progress = Progress::starting();
        progress.completed_files.push("x.opus");
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["isDownloading"], true);
        assert_eq!(json["phase"], "initializing");
        assert_eq!(json["completedFiles"][0], "x.opus");
        assert!(json.get("activityPinned").is_none());
    }
}
