use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::launcher::ProcessHandle;
use crate::models::progress::Progress;

/// What to fetch and how. Unset options fall back to the supervisor's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskParams {
    pub url: String,
    #[serde(default)]
    pub save_path: String,
    #[serde(default)]
    pub title_template: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub write_thumbnail: Option<bool>,
}

pub struct Task {
    pub id: Uuid,
    pub params: TaskParams,
    pub destination: PathBuf,
    pub progress: Progress,
    pub running: bool,
    pub cancel_token: CancellationToken,
    pub process: Option<ProcessHandle>,
    /// Bumped on every launch so units left over from a paused process can recognise
    /// that the task has moved on.
    pub(crate) epoch: u64,
}

impl Task {
    pub fn new(params: TaskParams, destination: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            params,
            destination,
            progress: Progress::starting(),
            running: true,
            cancel_token: CancellationToken::new(),
            process: None,
            epoch: 0,
        }
    }

    pub fn title(&self) -> String {
        if !self.progress.playlist_title.is_empty() {
            self.progress.playlist_title.clone()
        } else if !self.progress.current_title.is_empty() {
            self.progress.current_title.clone()
        } else {
            "Unknown task".to_string()
        }
    }
}
