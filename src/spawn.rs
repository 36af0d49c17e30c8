//! Preparing records and launching the detached supervisor.

use crate::app::{validate_command, validate_name, App, AppStatus, RunMode};
use crate::probe::pid_exists;
use crate::store::{Store, StoreError};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Hidden subcommand the supervisor runs under.
pub const BACKGROUND_SUBCOMMAND: &str = "background";

/// Everything needed to create a fresh app record.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub name: String,
    pub mode: RunMode,
    pub command: String,
    pub cwd: PathBuf,
    pub env: Vec<String>,
}

impl RunRequest {
    /// A request capturing the caller's working directory and environment.
    pub fn from_current(name: &str, mode: RunMode, command: &str) -> Result<Self, SpawnError> {
        let cwd = std::env::current_dir().map_err(|e| SpawnError::Io {
            path: PathBuf::from("."),
            source: e,
        })?;
        let env = std::env::vars_os()
            .map(|(key, value)| format!("{}={}", key.to_string_lossy(), value.to_string_lossy()))
            .collect();
        Ok(Self {
            name: name.to_string(),
            mode,
            command: command.to_string(),
            cwd,
            env,
        })
    }
}

/// Refuse when `name` has an active record whose process still exists.
fn ensure_not_active(store: &Store, name: &str) -> Result<Option<App>, SpawnError> {
    match store.get(name) {
        Ok(app) if app.is_active() && pid_exists(app.pid) => {
            Err(SpawnError::AlreadyActive(name.to_string()))
        }
        Ok(app) => Ok(Some(app)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(SpawnError::Store { source: e }),
    }
}

/// Replace any previous app of the same name with a Starting record.
///
/// The app directory is recreated from scratch with empty logs.
pub fn prepare_run(store: &Store, request: RunRequest) -> Result<App, SpawnError> {
    validate_name(&request.name).map_err(SpawnError::InvalidName)?;
    validate_command(&request.command).map_err(SpawnError::InvalidCommand)?;
    ensure_not_active(store, &request.name)?;

    let dd = store.data_dir();
    let config_path = dd.reset_app_dir(&request.name).map_err(|e| SpawnError::Io {
        path: dd.app_dir(&request.name),
        source: e,
    })?;
    let app = App {
        stdout_path: dd.stdout_log(&request.name),
        stderr_path: dd.stderr_log(&request.name),
        name: request.name,
        mode: request.mode,
        status: AppStatus::Starting,
        command: request.command,
        pid: -1,
        cwd: request.cwd,
        env: request.env,
        config_path,
        started_at: None,
        exit_code: None,
        finished_at: None,
    };
    store.save(&app).map_err(|e| SpawnError::Store { source: e })?;
    tracing::debug!(name = %app.name, mode = ?app.mode, command = %app.command, "app prepared");
    Ok(app)
}

/// Reset an existing, inactive app to Starting, keeping its cwd and env.
pub fn prepare_restart(store: &Store, name: &str) -> Result<App, SpawnError> {
    validate_name(name).map_err(SpawnError::InvalidName)?;
    let mut app = ensure_not_active(store, name)?
        .ok_or_else(|| SpawnError::Store {
            source: StoreError::NotFound,
        })?;

    app.status = AppStatus::Starting;
    app.pid = -1;
    app.exit_code = None;
    app.started_at = None;
    app.finished_at = None;
    store.save(&app).map_err(|e| SpawnError::Store { source: e })?;

    for path in [&app.stdout_path, &app.stderr_path] {
        std::fs::File::create(path).map_err(|e| SpawnError::Io {
            path: path.clone(),
            source: e,
        })?;
    }
    tracing::debug!(name = %app.name, "app reset for restart");
    Ok(app)
}

/// Start `<current exe> background --name <name>` in a new session.
///
/// Returns the supervisor's PID without waiting for it. Its stdio is
/// inherited only when `debug` is set.
pub fn launch_background(name: &str, debug: bool) -> Result<u32, SpawnError> {
    let exe = std::env::current_exe().map_err(|e| SpawnError::Io {
        path: PathBuf::from("/proc/self/exe"),
        source: e,
    })?;
    launch_with(&exe, name, debug)
}

fn launch_with(exe: &std::path::Path, name: &str, debug: bool) -> Result<u32, SpawnError> {
    let output = || {
        if debug {
            Stdio::inherit()
        } else {
            Stdio::null()
        }
    };

    let mut cmd = Command::new(exe);
    cmd.args([BACKGROUND_SUBCOMMAND, "--name", name])
        .stdin(Stdio::null())
        .stdout(output())
        .stderr(output());
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| SpawnError::Launch {
        exe: exe.to_path_buf(),
        source: e,
    })?;
    let pid = child.id();
    tracing::info!(name, pid, "supervisor launched");
    Ok(pid)
}

/// Errors from preparing or launching an app.
#[derive(Debug)]
pub enum SpawnError {
    InvalidName(String),
    InvalidCommand(String),
    AlreadyActive(String),
    Store { source: StoreError },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Launch {
        exe: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::InvalidName(msg) => write!(f, "invalid name: {msg}"),
            SpawnError::InvalidCommand(msg) => write!(f, "invalid command: {msg}"),
            SpawnError::AlreadyActive(name) => write!(
                f,
                "app: {name} is already running, use `runapp kill {name}` to stop it"
            ),
            SpawnError::Store { source } => write!(f, "{source}"),
            SpawnError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            SpawnError::Launch { exe, source } => {
                write!(f, "failed to launch {}: {source}", exe.display())
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Store { source } => Some(source),
            SpawnError::Io { source, .. } => Some(source),
            SpawnError::Launch { source, .. } => Some(source),
            _ => None,
        }
    }
}
