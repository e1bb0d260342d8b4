//! Lifecycle of the single download task.
//!
//! One task slot sits behind a `RwLock`. Each launch of the fetcher gets three units: one per
//! output stream feeding the parser, and one waiting for exit, timeout or cancellation. Units
//! carry the task id and the launch epoch they belong to and do nothing once the slot has
//! moved on, so a process left over from a pause or a replaced task can never overwrite the
//! current state.

use std::path::{Component, Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::events::BroadcastHub;
use crate::core::history::HistoryStore;
use crate::core::launcher::{self, LaunchOptions, ProcessLauncher};
use crate::core::parser;
use crate::core::scanner;
use crate::core::text::{sanitize_line, LEGACY_CODEPAGE_OUTPUT};
use crate::error::TaskError;
use crate::models::history::HistoryStatus;
use crate::models::progress::{Phase, Progress, Snapshot};
use crate::models::settings::{AppSettings, DownloadSettings};
use crate::models::task::{Task, TaskParams};

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub library_dir: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub download: DownloadSettings,
    pub timeout: Duration,
    pub stop_grace: Duration,
    pub finish_grace: Duration,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            library_dir: settings.library_dir.clone(),
            cookies_file: settings.cookies_file.clone(),
            download: settings.download.clone(),
            timeout: settings.advanced.timeout(),
            stop_grace: settings.advanced.stop_grace(),
            finish_grace: settings.advanced.finish_grace(),
        }
    }
}

struct Inner {
    slot: RwLock<Option<Task>>,
    hub: BroadcastHub,
    history: HistoryStore,
    launcher: Arc<dyn ProcessLauncher>,
    config: SupervisorConfig,
    revision: AtomicU64,
}

impl Inner {
    /// Must be called while holding the slot lock so revisions follow mutation order.
    fn snapshot(&self, progress: &Progress) -> Snapshot {
        Snapshot {
            revision: self.revision.fetch_add(1, Ordering::SeqCst) + 1,
            progress: progress.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunId {
    task: Uuid,
    epoch: u64,
}

impl RunId {
    fn owns(&self, task: &Task) -> bool {
        task.id == self.task && task.epoch == self.epoch
    }
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
    Finished,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: RwLock::new(None),
                hub: BroadcastHub::new(),
                history: HistoryStore::new(),
                launcher,
                config,
                revision: AtomicU64::new(0),
            }),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    pub fn history(&self) -> &HistoryStore {
        &self.inner.history
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub async fn current_progress(&self) -> Progress {
        let slot = self.inner.slot.read().await;
        slot.as_ref().map(|t| t.progress.clone()).unwrap_or_default()
    }

    /// Whether a task is running, i.e. neither paused nor finished.
    pub async fn is_active(&self) -> bool {
        let slot = self.inner.slot.read().await;
        slot.as_ref().is_some_and(|t| t.running)
    }

    pub async fn is_paused(&self) -> bool {
        let slot = self.inner.slot.read().await;
        slot.as_ref().is_some_and(|t| t.progress.is_paused)
    }

    pub async fn start(&self, params: TaskParams) -> Result<Uuid, TaskError> {
        let (id, snapshot) = {
            let mut slot = self.inner.slot.write().await;
            if slot.as_ref().is_some_and(|t| t.running) {
                return Err(TaskError::AlreadyRunning);
            }
            if let Some(previous) = slot.take() {
                previous.cancel_token.cancel();
            }

            let destination = self.inner.config.library_dir.join(normalize_subpath(&params.save_path));
            let task = Task::new(params, destination);
            tracing::info!(
                "Starting task {} for {} into {}",
                task.id,
                task.params.url,
                task.destination.display()
            );
            self.inner
                .history
                .record(&task, HistoryStatus::Downloading, None)
                .await;

            let id = task.id;
            let snapshot = self.inner.snapshot(&task.progress);
            *slot = Some(task);
            (id, snapshot)
        };

        self.inner.hub.publish(&snapshot).await;
        tokio::spawn(self.clone().run_task(id));
        Ok(id)
    }

    /// Stops the task if one exists. The terminal snapshot stays visible for the stop grace
    /// period before the slot is cleared.
    pub async fn stop(&self) -> bool {
        let (id, snapshot) = {
            let mut slot = self.inner.slot.write().await;
            let Some(task) = slot.as_mut() else {
                return false;
            };
            let live = task.running || task.progress.is_paused;

            task.cancel_token.cancel();
            if let Some(process) = task.process.take() {
                process.terminate();
            }
            if live {
                self.inner
                    .history
                    .record(task, HistoryStatus::Stopped, None)
                    .await;
                tracing::info!("Task {} stopped", task.id);
            }

            task.running = false;
            let p = &mut task.progress;
            p.is_downloading = false;
            p.is_paused = false;
            p.phase = Phase::Stopped;
            p.status = "Download stopped".into();
            p.set_activity("Stopped by user".into(), false);
            (task.id, self.inner.snapshot(&task.progress))
        };

        self.inner.hub.publish(&snapshot).await;

        let this = self.clone();
        let grace = self.inner.config.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut slot = this.inner.slot.write().await;
            if slot.as_ref().is_some_and(|t| t.id == id) {
                *slot = None;
                tracing::debug!("Cleared stopped task {}", id);
            }
        });
        true
    }

    pub async fn pause(&self) -> Result<(), TaskError> {
        let snapshot = {
            let mut slot = self.inner.slot.write().await;
            let task = slot
                .as_mut()
                .filter(|t| t.running && !t.progress.is_paused)
                .ok_or(TaskError::NotRunning)?;

            if let Some(process) = task.process.take() {
                process.interrupt();
                let grace = self.inner.config.stop_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    process.terminate();
                });
            }

            task.running = false;
            let p = &mut task.progress;
            p.is_paused = true;
            p.is_downloading = false;
            p.phase = Phase::Paused;
            p.status = "Download paused".into();
            p.speed.clear();
            p.eta.clear();
            tracing::info!("Task {} paused", task.id);
            self.inner.snapshot(&task.progress)
        };

        self.inner.hub.publish(&snapshot).await;
        Ok(())
    }

    /// Relaunches a paused task with the fetcher's continue flag so partial files are kept.
    pub async fn resume(&self) -> Result<(), TaskError> {
        let snapshot = {
            let mut slot = self.inner.slot.write().await;
            let task = slot
                .as_mut()
                .filter(|t| t.progress.is_paused)
                .ok_or(TaskError::NotPaused)?;

            task.running = true;
            task.cancel_token = CancellationToken::new();
            let p = &mut task.progress;
            p.is_paused = false;
            p.is_downloading = true;
            p.phase = Phase::Downloading;
            p.status = "Resuming download...".into();
            tracing::info!("Task {} resumed", task.id);

            if let Err(e) = self.launch_locked(task, true) {
                self.fail_locked(task, e).await;
            }
            self.inner.snapshot(&task.progress)
        };

        self.inner.hub.publish(&snapshot).await;
        Ok(())
    }

    async fn run_task(self, id: Uuid) {
        let destination = {
            let slot = self.inner.slot.read().await;
            match slot.as_ref().filter(|t| t.id == id) {
                Some(task) => task.destination.clone(),
                None => return,
            }
        };

        let prepared = tokio::fs::create_dir_all(&destination).await;
        let existing = match prepared {
            Ok(()) => {
                let dir = destination.clone();
                tokio::task::spawn_blocking(move || scanner::scan(&dir))
                    .await
                    .unwrap_or_default()
            }
            Err(_) => Vec::new(),
        };

        let snapshot = {
            let mut slot = self.inner.slot.write().await;
            let Some(task) = slot.as_mut().filter(|t| t.id == id && t.running && t.epoch == 0) else {
                return;
            };

            if let Err(e) = prepared {
                let err = TaskError::LaunchFailure(format!(
                    "cannot create {}: {}",
                    destination.display(),
                    e
                ));
                self.fail_locked(task, err).await;
            } else {
                if !existing.is_empty() {
                    task.progress.completed_files.seed(&existing);
                    task.progress.status = format!("Found {} existing audio files", existing.len());
                    tracing::info!("{} audio files already in {}", existing.len(), destination.display());
                }
                if let Err(e) = self.launch_locked(task, false) {
                    self.fail_locked(task, e).await;
                }
            }
            self.inner.snapshot(&task.progress)
        };

        self.inner.hub.publish(&snapshot).await;
    }

    fn launch_locked(&self, task: &mut Task, resume: bool) -> Result<(), TaskError> {
        let config = &self.inner.config;
        let args = launcher::build_args(
            &task.params,
            &config.download,
            &LaunchOptions {
                destination: &task.destination,
                cookies_file: config.cookies_file.as_deref(),
                resume,
            },
        );
        let launched = launcher::launch(self.inner.launcher.as_ref(), &args, &task.cancel_token)?;

        task.epoch += 1;
        let run = RunId {
            task: task.id,
            epoch: task.epoch,
        };
        tracing::debug!("Task {} launch {} pid {:?}", task.id, run.epoch, launched.handle.pid());

        let kill = launched.handle.kill_token();
        task.process = Some(launched.handle);

        let finished = CancellationToken::new();
        let readers = vec![
            tokio::spawn(self.clone().pump(run, launched.stdout, finished.clone())),
            tokio::spawn(self.clone().pump(run, launched.stderr, finished.clone())),
        ];
        tokio::spawn(self.clone().wait(run, launched.child, kill, finished, readers));
        Ok(())
    }

    async fn pump<R>(self, run: RunId, stream: R, finished: CancellationToken)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut segments = BufReader::new(stream).split(b'\n');
        loop {
            let raw = match segments.next_segment().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Reading fetcher output failed: {}", e);
                    break;
                }
            };
            let line = sanitize_line(&raw, LEGACY_CODEPAGE_OUTPUT);
            if line.trim().is_empty() {
                continue;
            }

            let snapshot = {
                let mut slot = self.inner.slot.write().await;
                let Some(task) = slot.as_mut().filter(|t| run.owns(t) && t.running) else {
                    continue;
                };
                let outcome = parser::apply_line(&mut task.progress, &line);
                if outcome.playlist_finished {
                    tracing::info!("Task {} reported its playlist finished", task.id);
                    self.complete_locked(task).await;
                    finished.cancel();
                }
                self.inner.snapshot(&task.progress)
            };
            self.inner.hub.publish(&snapshot).await;
        }
    }

    async fn wait(
        self,
        run: RunId,
        mut child: Child,
        kill: CancellationToken,
        finished: CancellationToken,
        readers: Vec<JoinHandle<()>>,
    ) {
        let timeout = self.inner.config.timeout;
        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep(timeout) => Ending::TimedOut,
            _ = kill.cancelled() => Ending::Cancelled,
            _ = finished.cancelled() => Ending::Finished,
        };

        let result = match ending {
            Ending::Exited(Ok(status)) if status.success() => Ok(()),
            Ending::Exited(Ok(status)) => Err(TaskError::SubprocessError(match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            })),
            Ending::Exited(Err(e)) => Err(TaskError::SubprocessError(e.to_string())),
            Ending::TimedOut => {
                tracing::warn!("Task {} exceeded {:?}, killing fetcher", run.task, timeout);
                kill_child(&mut child).await;
                Err(TaskError::ProcessTimeout(timeout))
            }
            Ending::Cancelled => {
                kill_child(&mut child).await;
                Err(TaskError::ProcessCancelled)
            }
            Ending::Finished => {
                let grace = self.inner.config.finish_grace;
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    tracing::debug!("Fetcher lingered after finishing, killing it");
                    kill_child(&mut child).await;
                }
                Ok(())
            }
        };

        for reader in readers {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::debug!("Output reader still busy, finalizing without it");
            }
        }

        self.finalize(run, result).await;
    }

    async fn finalize(&self, run: RunId, result: Result<(), TaskError>) {
        let snapshot = {
            let mut slot = self.inner.slot.write().await;
            let Some(task) = slot.as_mut().filter(|t| run.owns(t)) else {
                return;
            };
            if task.progress.is_paused || task.progress.phase == Phase::Stopped {
                return;
            }
            // Already completed by the playlist-finished line.
            if !task.running && task.progress.phase == Phase::Completed {
                return;
            }

            match result {
                Ok(()) => self.complete_locked(task).await,
                Err(TaskError::ProcessCancelled) => return,
                Err(e) => self.fail_locked(task, e).await,
            }
            self.inner.snapshot(&task.progress)
        };

        self.inner.hub.publish(&snapshot).await;
    }

    async fn complete_locked(&self, task: &mut Task) {
        task.running = false;
        task.process = None;
        let p = &mut task.progress;
        p.progress = 100.0;
        p.is_downloading = false;
        p.phase = Phase::Completed;
        p.status = "Download complete".into();
        p.speed.clear();
        p.eta.clear();
        tracing::info!("Task {} completed", task.id);
        self.inner
            .history
            .record(task, HistoryStatus::Completed, None)
            .await;
    }

    async fn fail_locked(&self, task: &mut Task, err: TaskError) {
        let detail = match &err {
            TaskError::SubprocessError(_) if !task.progress.error_message.is_empty() => {
                task.progress.error_message.clone()
            }
            _ => err.to_string(),
        };
        tracing::error!("Task {} failed: {}", task.id, err);

        task.running = false;
        task.process = None;
        let p = &mut task.progress;
        p.is_downloading = false;
        p.is_paused = false;
        p.phase = Phase::Error;
        p.status = format!("Download failed: {}", detail);
        p.error_message = detail.clone();

        self.inner
            .history
            .record(task, HistoryStatus::Failed, Some(detail))
            .await;
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Kill failed, fetcher probably exited: {}", e);
    }
    let _ = child.wait().await;
}

/// Keeps only plain components of a caller-supplied subpath, so it stays below the library.
pub fn normalize_subpath(save_path: &str) -> PathBuf {
    Path::new(save_path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}
