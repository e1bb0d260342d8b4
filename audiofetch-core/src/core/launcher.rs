use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::fs_paths;
use crate::models::settings::DownloadSettings;
use crate::models::task::TaskParams;

pub const PROGRESS_TEMPLATE: &str = "download:%(progress._percent_str)s %(progress._speed_str)s";
pub const CONTINUE_FLAG: &str = "--continue";

pub struct LaunchOptions<'a> {
    pub destination: &'a Path,
    pub cookies_file: Option<&'a Path>,
    pub resume: bool,
}

pub fn build_args(params: &TaskParams, defaults: &DownloadSettings, opts: &LaunchOptions) -> Vec<String> {
    let quality = non_empty(params.quality.as_deref()).unwrap_or(&defaults.quality);
    let retries = params
        .retry_count
        .filter(|n| *n > 0)
        .unwrap_or(defaults.retry_count);
    let template = non_empty(params.title_template.as_deref()).unwrap_or(&defaults.title_template);

    let mut args = vec![
        "-f".to_string(),
        quality.to_string(),
        "-P".to_string(),
        opts.destination.to_string_lossy().to_string(),
        "--extractor-retries".to_string(),
        retries.to_string(),
        "--newline".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
        "--no-warnings".to_string(),
    ];

    if params.write_thumbnail.unwrap_or(defaults.write_thumbnail) {
        args.push("--write-thumbnail".to_string());
    }

    if opts.resume {
        args.push(CONTINUE_FLAG.to_string());
    }

    if let Some(cookies) = opts.cookies_file.filter(|p| p.is_file()) {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().to_string());
    }

    args.extend(["-o".to_string(), template.to_string(), params.url.clone()]);
    args
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn enhanced_path() -> Option<String> {
    let bin_dir = fs_paths::managed_bin_dir()?;
    let sep = if cfg!(windows) { ";" } else { ":" };
    let current = std::env::var("PATH").unwrap_or_default();
    Some(format!("{}{}{}", bin_dir.display(), sep, current))
}

pub fn command<S: AsRef<OsStr>>(program: S) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(target_os = "windows")]
    cmd.creation_flags(0x08000000);
    if let Some(path) = enhanced_path() {
        cmd.env("PATH", path);
    }
    cmd.env("PYTHONIOENCODING", "utf-8");
    cmd.env("PYTHONUTF8", "1");
    cmd.env("LC_ALL", "en_US.UTF-8");
    cmd.env("LANG", "en_US.UTF-8");
    cmd
}

/// Starts the external fetcher. The child must have piped stdout and stderr.
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, args: &[String]) -> std::io::Result<Child>;
}

pub struct FetcherLauncher {
    executable: PathBuf,
}

impl FetcherLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl ProcessLauncher for FetcherLauncher {
    fn spawn(&self, args: &[String]) -> std::io::Result<Child> {
        tracing::info!("Running {} {}", self.executable.display(), format_args_for_log(args));
        command(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

fn format_args_for_log(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if a.contains(' ') || a.contains('%') {
                format!("\"{}\"", a)
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Handle to a running fetcher kept in the task slot.
///
/// The child itself is owned by the wait unit; the handle only asks for termination, which the
/// wait unit carries out once.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn terminate(&self) {
        self.kill.cancel();
    }

    pub(crate) fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Asks the fetcher to stop gracefully, falling back to termination where signals are
    /// unavailable or fail.
    pub fn interrupt(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if rc == 0 {
                return;
            }
            tracing::warn!("SIGINT to pid {} failed, terminating instead", pid);
        }
        self.terminate();
    }
}

pub struct LaunchedProcess {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub handle: ProcessHandle,
}

/// Spawns the fetcher and splits it into its output streams and a controllable handle whose
/// kill signal also fires when `cancel` does.
pub fn launch(
    launcher: &dyn ProcessLauncher,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<LaunchedProcess, TaskError> {
    let mut child = launcher
        .spawn(args)
        .map_err(|e| TaskError::LaunchFailure(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TaskError::LaunchFailure("stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TaskError::LaunchFailure("stderr not captured".into()))?;

    let handle = ProcessHandle {
        pid: child.id(),
        kill: cancel.child_token(),
    };

    Ok(LaunchedProcess {
        child,
        stdout,
        stderr,
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TaskParams {
        TaskParams {
            url: "https://example.com/list/1".into(),
            save_path: "book".into(),
            ..Default::default()
        }
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let pos = args.iter().position(|a| a == flag)?;
        args.get(pos + 1).map(|s| s.as_str())
    }

    #[test]
    fn defaults_fill_unset_params() {
        let dest = Path::new("/lib/book");
        let opts = LaunchOptions {
            destination: dest,
            cookies_file: None,
            resume: false,
        };
        let args = build_args(&params(), &DownloadSettings::default(), &opts);

        assert_eq!(flag_value(&args, "-f"), Some("bestaudio/best"));
        assert_eq!(flag_value(&args, "-P"), Some("/lib/book"));
        assert_eq!(flag_value(&args, "--extractor-retries"), Some("5"));
        assert_eq!(flag_value(&args, "-o"), Some("%(title)s.%(ext)s"));
        assert_eq!(flag_value(&args, "--progress-template"), Some(PROGRESS_TEMPLATE));
        assert!(args.contains(&"--newline".to_string()));
        assert!(args.contains(&"--write-thumbnail".to_string()));
        assert!(!args.contains(&CONTINUE_FLAG.to_string()));
        assert!(!args.contains(&"--cookies".to_string()));
        assert_eq!(args.last().map(|s| s.as_str()), Some("https://example.com/list/1"));
    }

    #[test]
    fn explicit_params_win() {
        let mut p = params();
        p.quality = Some("140".into());
        p.retry_count = Some(9);
        p.title_template = Some("%(playlist_index)s.%(ext)s".into());
        p.write_thumbnail = Some(false);
        let opts = LaunchOptions {
            destination: Path::new("/x"),
            cookies_file: None,
            resume: true,
        };
        let args = build_args(&p, &DownloadSettings::default(), &opts);

        assert_eq!(flag_value(&args, "-f"), Some("140"));
        assert_eq!(flag_value(&args, "--extractor-retries"), Some("9"));
        assert_eq!(flag_value(&args, "-o"), Some("%(playlist_index)s.%(ext)s"));
        assert!(!args.contains(&"--write-thumbnail".to_string()));
        assert!(args.contains(&CONTINUE_FLAG.to_string()));
    }

    #[test]
    fn cookies_only_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let cookies = dir.path().join("cookies.txt");
        let opts = LaunchOptions {
            destination: dir.path(),
            cookies_file: Some(&cookies),
            resume: false,
        };
        let args = build_args(&params(), &DownloadSettings::default(), &opts);
        assert!(!args.contains(&"--cookies".to_string()));

        std::fs::write(&cookies, "# Netscape HTTP Cookie File\n").unwrap();
        let args = build_args(&params(), &DownloadSettings::default(), &opts);
        assert_eq!(flag_value(&args, "--cookies"), Some(cookies.to_str().unwrap()));
    }

    #[test]
    fn blank_overrides_fall_back() {
        let mut p = params();
        p.quality = Some("  ".into());
        p.retry_count = Some(0);
        let opts = LaunchOptions {
            destination: Path::new("/x"),
            cookies_file: None,
            resume: false,
        };
        let args = build_args(&p, &DownloadSettings::default(), &opts);
        assert_eq!(flag_value(&args, "-f"), Some("bestaudio/best"));
        assert_eq!(flag_value(&args, "--extractor-retries"), Some("5"));
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let launcher = FetcherLauncher::new("/nonexistent/fetcher-binary");
        let cancel = CancellationToken::new();
        let err = launch(&launcher, &[], &cancel).err().unwrap();
        assert!(matches!(err, TaskError::LaunchFailure(_)));
    }

    #[test]
    fn handle_kill_follows_task_cancel() {
        let cancel = CancellationToken::new();
        let handle = ProcessHandle {
            pid: None,
            kill: cancel.child_token(),
        };
        cancel.cancel();
        assert!(handle.kill_token().is_cancelled());
    }
}
