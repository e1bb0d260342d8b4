use std::time::Duration;

use thiserror::Error;

/// Failures of the task lifecycle.
///
/// `AlreadyRunning`, `NotRunning` and `NotPaused` are returned synchronously and leave the
/// task slot untouched. The remaining variants end a task that has already started; they are
/// only observed through the history and the terminal progress snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("a download task is already running")]
    AlreadyRunning,
    #[error("no running download task")]
    NotRunning,
    #[error("no paused download task")]
    NotPaused,
    #[error("failed to launch fetcher: {0}")]
    LaunchFailure(String),
    #[error("download timed out after {} minutes", .0.as_secs() / 60)]
    ProcessTimeout(Duration),
    #[error("download cancelled")]
    ProcessCancelled,
    #[error("fetcher failed: {0}")]
    SubprocessError(String),
}

/// A subscriber could not take a snapshot; the hub forgets it.
#[derive(Debug, Error)]
#[error("subscriber gone: {0}")]
pub struct DeliveryError(pub String);
