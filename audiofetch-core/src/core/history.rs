use std::path::Path;

use tokio::sync::RwLock;

use crate::core::scanner;
use crate::models::history::{HistoryEntry, HistoryStatus};
use crate::models::task::Task;

pub const MAX_HISTORY: usize = 50;

/// Creation time given to entries found on disk at startup, whose real time is unknown.
pub const PREEXISTING_CREATED_AT: &str = "2025-01-20 00:00:00";

#[derive(Default)]
struct Entries {
    items: Vec<HistoryEntry>,
    next_id: u64,
}

impl Entries {
    fn push(&mut self, mut entry: HistoryEntry) -> HistoryEntry {
        self.next_id += 1;
        entry.id = self.next_id;
        self.items.push(entry.clone());
        if self.items.len() > MAX_HISTORY {
            let excess = self.items.len() - MAX_HISTORY;
            self.items.drain(..excess);
        }
        entry
    }
}

/// In-memory record of past and in-flight tasks, newest last, capped at [`MAX_HISTORY`].
#[derive(Default)]
pub struct HistoryStore {
    entries: RwLock<Entries>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, task: &Task, status: HistoryStatus, error: Option<String>) -> HistoryEntry {
        let p = &task.progress;
        let entry = HistoryEntry {
            id: 0,
            title: task.title(),
            status,
            url: task.params.url.clone(),
            created_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            file_size: Some(p.file_size.clone()).filter(|s| !s.is_empty()),
            duration: Some(p.duration.clone()).filter(|s| !s.is_empty()),
            progress: Some(p.progress.round().clamp(0.0, 100.0) as u32),
            error,
        };
        let entry = self.entries.write().await.push(entry);
        tracing::info!("History: {} {:?}", entry.title, entry.status);
        entry
    }

    /// All entries, newest first.
    pub async fn list(&self) -> Vec<HistoryEntry> {
        let entries = self.entries.read().await;
        entries.items.iter().rev().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Adds a completed entry for every immediate subdirectory of `library_dir` that holds
    /// audio files. Returns how many entries were added.
    pub async fn bootstrap(&self, library_dir: &Path) -> usize {
        let dir = library_dir.to_path_buf();
        let found = tokio::task::spawn_blocking(move || preexisting(&dir))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("History bootstrap aborted: {}", e);
                Vec::new()
            });

        let count = found.len();
        let mut entries = self.entries.write().await;
        for entry in found {
            entries.push(entry);
        }
        if count > 0 {
            tracing::info!("Loaded {} existing downloads from {}", count, library_dir.display());
        }
        count
    }
}

fn preexisting(library_dir: &Path) -> Vec<HistoryEntry> {
    let read = match std::fs::read_dir(library_dir) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("No library at {}: {}", library_dir.display(), e);
            return Vec::new();
        }
    };

    let mut dirs: Vec<_> = read
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    dirs.into_iter()
        .filter_map(|path| {
            let files = scanner::scan(&path);
            if files.is_empty() {
                return None;
            }
            let name = path.file_name()?.to_string_lossy().to_string();
            Some(HistoryEntry {
                id: 0,
                title: format!("Completed: {}", name),
                status: HistoryStatus::Completed,
                url: format!("local: {}", path.display()),
                created_at: PREEXISTING_CREATED_AT.to_string(),
                file_size: Some(format!("{} files", files.len())),
                duration: None,
                progress: Some(100),
                error: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::TaskParams;
    use std::path::PathBuf;

    fn task(url: &str) -> Task {
        Task::new(
            TaskParams {
                url: url.into(),
                ..Default::default()
            },
            PathBuf::from("/tmp/x"),
        )
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = HistoryStore::new();
        store.record(&task("a"), HistoryStatus::Downloading, None).await;
        store.record(&task("b"), HistoryStatus::Completed, None).await;

        let list = store.list().await;
        assert_eq!(list[0].url, "b");
        assert_eq!(list[1].url, "a");
        assert!(list[0].id > list[1].id);
    }

    #[tokio::test]
    async fn keeps_last_fifty() {
        let store = HistoryStore::new();
        for i in 0..60 {
            store.record(&task(&i.to_string()), HistoryStatus::Completed, None).await;
        }
        let list = store.list().await;
        assert_eq!(list.len(), MAX_HISTORY);
        assert_eq!(list[0].url, "59");
        assert_eq!(list[49].url, "10");
    }

    #[tokio::test]
    async fn entry_uses_task_title_and_details() {
        let store = HistoryStore::new();
        let mut t = task("https://example.com/p");
        assert_eq!(store.record(&t, HistoryStatus::Downloading, None).await.title, "Unknown task");

        t.progress.current_title = "Episode 1".into();
        t.progress.file_size = "12.00MiB".into();
        t.progress.progress = 42.4;
        let e = store
            .record(&t, HistoryStatus::Failed, Some("boom".into()))
            .await;
        assert_eq!(e.title, "Episode 1");
        assert_eq!(e.file_size.as_deref(), Some("12.00MiB"));
        assert_eq!(e.duration, None);
        assert_eq!(e.progress, Some(42));
        assert_eq!(e.error.as_deref(), Some("boom"));

        t.progress.playlist_title = "Season".into();
        let e = store.record(&t, HistoryStatus::Stopped, None).await;
        assert_eq!(e.title, "Season");
    }

    #[tokio::test]
    async fn bootstrap_lists_directories_with_audio() {
        let root = tempfile::tempdir().unwrap();
        let book = root.path().join("Book A");
        std::fs::create_dir_all(book.join("cd1")).unwrap();
        std::fs::write(book.join("01.m4a"), b"").unwrap();
        std::fs::write(book.join("cd1").join("02.mp3"), b"").unwrap();
        let empty = root.path().join("Notes");
        std::fs::create_dir_all(&empty).unwrap();
        std::fs::write(empty.join("readme.txt"), b"").unwrap();
        std::fs::write(root.path().join("loose.mp3"), b"").unwrap();

        let store = HistoryStore::new();
        assert_eq!(store.bootstrap(root.path()).await, 1);

        let list = store.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "Completed: Book A");
        assert_eq!(list[0].status, HistoryStatus::Completed);
        assert_eq!(list[0].file_size.as_deref(), Some("2 files"));
        assert_eq!(list[0].created_at, PREEXISTING_CREATED_AT);
        assert!(list[0].url.starts_with("local: "));
    }

    #[tokio::test]
    async fn bootstrap_of_missing_dir_is_empty() {
        let store = HistoryStore::new();
        assert_eq!(store.bootstrap(Path::new("/nonexistent/library")).await, 0);
        assert!(store.is_empty().await);
    }
}
