use serde::Serialize;

use audiofetch_core::models::history::HistoryEntry;
use audiofetch_core::models::progress::Progress;
use audiofetch_core::models::task::TaskParams;

use crate::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStarted {
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadHistory {
    pub tasks: Vec<HistoryEntry>,
    pub has_active_task: bool,
}

pub async fn start_download(state: &AppState, params: TaskParams) -> Result<DownloadStarted, String> {
    let url = params.url.trim();
    if url.is_empty() {
        return Err("URL is required".to_string());
    }
    let params = TaskParams {
        url: url.to_string(),
        ..params
    };

    let id = state.supervisor.start(params).await.map_err(|e| e.to_string())?;
    Ok(DownloadStarted {
        task_id: id.to_string(),
        message: "Download started".to_string(),
    })
}

pub async fn get_download_progress(state: &AppState) -> Result<Progress, String> {
    Ok(state.supervisor.current_progress().await)
}

pub async fn get_download_history(state: &AppState) -> Result<DownloadHistory, String> {
    Ok(DownloadHistory {
        tasks: state.supervisor.history().list().await,
        has_active_task: state.supervisor.is_active().await,
    })
}

pub async fn pause_download(state: &AppState) -> Result<(), String> {
    state.supervisor.pause().await.map_err(|e| e.to_string())
}

pub async fn resume_download(state: &AppState) -> Result<(), String> {
    state.supervisor.resume().await.map_err(|e| e.to_string())
}

pub async fn stop_download(state: &AppState) -> Result<bool, String> {
    Ok(state.supervisor.stop().await)
}

/// Reattaches a client to a task that kept running while it was away.
pub async fn resume_background_download(state: &AppState) -> Result<Progress, String> {
    if !state.supervisor.is_active().await {
        return Err("No active download task".to_string());
    }
    Ok(state.supervisor.current_progress().await)
}
