//! The detached `background` entrypoint that owns an app's process.
//!
//! Launched by the spawner in its own session, it flips the record to
//! running, runs the command with output going to the app's log files, and
//! writes the terminal record when the command exits. Termination requests
//! received meanwhile are forwarded to the command's process group and the
//! outcome is reported as killed.

use crate::app::{App, AppStatus, EXIT_CODE_KILLED, EXIT_CODE_SPAWN_FAILED};
use crate::shell::shell_from_env;
use crate::store::{Store, StoreError};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;

/// Why the supervisor was asked to stop its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Terminate,
    Interrupt,
    /// The session went away or the caller cancelled.
    Hangup,
}

/// How long a command that died abnormally waits for the stop request that
/// may have caused it.
const STOP_SETTLE: Duration = Duration::from_millis(200);

/// Map how the child ended to the recorded `(status, exit_code)`.
///
/// A clean exit is a success even if a stop was requested. Any other ending
/// after a stop request is reported as killed, whatever signal or code
/// actually ended it. Death by SIGTERM or SIGKILL is a kill in any case: the
/// kill protocol signals the command directly, and that signal can land
/// before the supervisor hears about its own.
pub fn exit_outcome(waited: &std::io::Result<ExitStatus>, killed: bool) -> (AppStatus, i32) {
    match waited {
        Ok(status) if status.success() => (AppStatus::Success, 0),
        Ok(_) if killed => (AppStatus::Failed, EXIT_CODE_KILLED),
        Ok(status) if status.signal().is_some_and(is_kill_signal) => {
            (AppStatus::Failed, EXIT_CODE_KILLED)
        }
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => (AppStatus::Failed, code),
            (None, Some(signal)) => (AppStatus::Failed, 128 + signal),
            (None, None) => (AppStatus::Failed, EXIT_CODE_SPAWN_FAILED),
        },
        Err(_) if killed => (AppStatus::Failed, EXIT_CODE_KILLED),
        Err(_) => (AppStatus::Failed, EXIT_CODE_SPAWN_FAILED),
    }
}

fn is_kill_signal(signal: i32) -> bool {
    signal == Signal::SIGTERM as i32 || signal == Signal::SIGKILL as i32
}

/// Build the child command: `<shell> -c <command>` when the app's captured
/// environment names a recognized shell, otherwise the command's own words.
fn build_command(app: &App) -> Result<Command, SupervisorError> {
    let mut cmd = match shell_from_env(app.env_pairs()) {
        Some([shell, flag]) => {
            let mut cmd = Command::new(shell);
            cmd.arg(flag).arg(&app.command);
            cmd
        }
        None => {
            let words = shell_words::split(&app.command).map_err(|e| SupervisorError::Command {
                message: format!("cannot parse command: {e}"),
            })?;
            let (program, args) = words.split_first().ok_or(SupervisorError::Command {
                message: "command is empty".to_string(),
            })?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    };

    cmd.current_dir(&app.cwd)
        .env_clear()
        .envs(app.env_pairs())
        .stdin(Stdio::null())
        .process_group(0); // Own group so the whole tree can be signalled
    Ok(cmd)
}

/// Append an error to an app's stderr log; nothing else can observe it.
pub fn append_error(path: &Path, error: &dyn std::fmt::Display) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{error}"));
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to write error to stderr log");
    }
}

/// Forward SIGTERM to the child's process group.
fn forward_stop(child_pid: Option<u32>) {
    let Some(pid) = child_pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to send SIGTERM"),
    }
}

/// Record the terminal state, reporting persistence failures in the log.
fn finish(store: &Store, app: &mut App, status: AppStatus, exit_code: i32) {
    app.status = status;
    app.exit_code = Some(exit_code);
    app.finished_at = Some(Utc::now());
    if let Err(e) = store.save(app) {
        append_error(&app.stderr_path, &e);
        tracing::warn!(name = %app.name, error = %e, "failed to persist final status");
    }
}

/// Run app `name` to completion and return its final record.
///
/// `stop` delivers termination requests; each one is forwarded to the
/// command and marks the run as killed. A closed channel just stops
/// listening.
pub async fn supervise(
    store: &Store,
    name: &str,
    mut stop: mpsc::UnboundedReceiver<StopReason>,
) -> Result<App, SupervisorError> {
    let mut app = match store.get(name) {
        Ok(app) => app,
        Err(e) => {
            let stderr_log = store.data_dir().stderr_log(name);
            if stderr_log.parent().is_some_and(Path::is_dir) {
                append_error(&stderr_log, &e);
            }
            return Err(SupervisorError::Load { source: e });
        }
    };

    app.status = AppStatus::Running;
    app.pid = std::process::id() as i32;
    app.exit_code = None;
    app.started_at = Some(Utc::now());
    app.finished_at = None;
    if let Err(e) = store.save(&app) {
        append_error(&app.stderr_path, &e);
        return Err(SupervisorError::Persist { source: e });
    }
    tracing::info!(name = %app.name, pid = app.pid, "supervisor running");

    let (stdout, stderr) = match open_logs(&app) {
        Ok(files) => files,
        Err(e) => {
            append_error(&app.stderr_path, &e);
            finish(store, &mut app, AppStatus::Failed, EXIT_CODE_SPAWN_FAILED);
            return Err(e);
        }
    };

    let spawned = build_command(&app).and_then(|mut cmd| {
        cmd.stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| SupervisorError::Spawn { source: e })
    });
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            append_error(&app.stderr_path, &e);
            finish(store, &mut app, AppStatus::Failed, EXIT_CODE_SPAWN_FAILED);
            return Err(e);
        }
    };
    let child_pid = child.id();
    tracing::info!(pid = ?child_pid, command = %app.command, "command started");

    let mut killed = false;
    let mut listening = true;
    let waited = loop {
        tokio::select! {
            waited = child.wait() => break waited,
            request = stop.recv(), if listening => match request {
                Some(reason) => {
                    tracing::debug!(?reason, "stop requested");
                    killed = true;
                    forward_stop(child_pid);
                }
                None => listening = false,
            },
        }
    };

    let clean = matches!(&waited, Ok(status) if status.success());
    if !killed && !clean && listening {
        // The tree is signalled all at once, so the command can die before
        // the supervisor's own stop request has been read.
        if let Ok(Some(reason)) = tokio::time::timeout(STOP_SETTLE, stop.recv()).await {
            tracing::debug!(?reason, "stop requested as the command ended");
            killed = true;
        }
    }

    let (status, exit_code) = exit_outcome(&waited, killed);
    if let Err(e) = &waited {
        append_error(&app.stderr_path, e);
    }
    tracing::info!(name = %app.name, %status, exit_code, killed, "command finished");
    finish(store, &mut app, status, exit_code);
    Ok(app)
}

fn open_logs(app: &App) -> Result<(std::fs::File, std::fs::File), SupervisorError> {
    let open = |path: &PathBuf| {
        std::fs::File::create(path).map_err(|e| SupervisorError::Logs {
            path: path.clone(),
            source: e,
        })
    };
    Ok((open(&app.stdout_path)?, open(&app.stderr_path)?))
}

/// Errors that end a supervisor run early.
#[derive(Debug)]
pub enum SupervisorError {
    Load { source: StoreError },
    Persist { source: StoreError },
    Logs {
        path: PathBuf,
        source: std::io::Error,
    },
    Command { message: String },
    Spawn { source: std::io::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Load { source } => write!(f, "failed to load app: {source}"),
            SupervisorError::Persist { source } => write!(f, "failed to save app: {source}"),
            SupervisorError::Logs { path, source } => {
                write!(f, "failed to open log file {}: {source}", path.display())
            }
            SupervisorError::Command { message } => f.write_str(message),
            SupervisorError::Spawn { source } => write!(f, "failed to start command: {source}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Load { source } => Some(source),
            SupervisorError::Persist { source } => Some(source),
            SupervisorError::Logs { source, .. } => Some(source),
            SupervisorError::Command { .. } => None,
            SupervisorError::Spawn { source } => Some(source),
        }
    }
}
