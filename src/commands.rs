//! Subcommand implementations behind the CLI.

use crate::app::{validate_name, App, AppStatus, RunMode, EXIT_CODE_KILLED};
use crate::config::{ConfigError, Environment, KillConfig, Settings};
use crate::data_dir::DataDir;
use crate::kill::{terminate, wait_for_exit, Termination};
use crate::logs::{dump, follow, LogStream, LogsError};
use crate::spawn::{launch_background, prepare_restart, prepare_run, RunRequest, SpawnError};
use crate::store::{Store, StoreError};
use crate::supervisor::{supervise, StopReason, SupervisorError};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::process::ExitCode;
use tokio::sync::mpsc;

pub const NO_APPS_MESSAGE: &str = "No apps are running, you can run an app with: runapp run";

/// How a listing or status is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn from_flags(json: bool, yaml: bool) -> Self {
        match (json, yaml) {
            (true, _) => OutputFormat::Json,
            (false, true) => OutputFormat::Yaml,
            (false, false) => OutputFormat::Table,
        }
    }
}

/// Shared state for one invocation.
#[derive(Debug)]
pub struct Context {
    pub store: Store,
    pub settings: Settings,
    pub env: Environment,
}

impl Context {
    pub fn new(store: Store, settings: Settings, env: Environment) -> Self {
        Self {
            store,
            settings,
            env,
        }
    }

    /// Resolve the root from the environment and load its settings.
    pub fn load() -> Result<Self, CommandError> {
        let env = Environment::from_env().map_err(CommandError::Config)?;
        let dir = DataDir::new(&env.root);
        let settings = Settings::load(&dir.settings()).map_err(CommandError::Config)?;
        let store = Store::new(dir, settings.list.max_parallel);
        tracing::debug!(root = %env.root.display(), debug = env.debug, "context loaded");
        Ok(Self::new(store, settings, env))
    }

    /// Load app `name`, rejecting names that do not address an app directory.
    fn get(&self, name: &str) -> Result<App, CommandError> {
        validate_name(name).map_err(CommandError::InvalidName)?;
        self.store.get(name).map_err(|e| match e {
            StoreError::NotFound => CommandError::NotFound(name.to_string()),
            e => CommandError::Store(e),
        })
    }

    /// False (after telling the user) when there is nothing to act on.
    fn any_apps(&self) -> Result<bool, CommandError> {
        let has = self.store.has_any().map_err(CommandError::Store)?;
        if !has {
            println!("{NO_APPS_MESSAGE}");
        }
        Ok(has)
    }
}

/// `runapp` without a subcommand.
pub async fn list(ctx: &Context, format: OutputFormat) -> Result<ExitCode, CommandError> {
    let apps = ctx.store.list().await.map_err(CommandError::Store)?;
    match format {
        OutputFormat::Json => println!("{}", to_json(&apps)?),
        OutputFormat::Yaml => print!("{}", to_yaml(&apps)?),
        OutputFormat::Table if apps.is_empty() => println!("{NO_APPS_MESSAGE}"),
        OutputFormat::Table => print!("{}", render_list(&apps)),
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn run(
    ctx: &Context,
    name: &str,
    command: &str,
    on_boot: bool,
    skip_logs: bool,
) -> Result<ExitCode, CommandError> {
    let mode = if on_boot { RunMode::OnBoot } else { RunMode::Once };
    let request = RunRequest::from_current(name, mode, command).map_err(CommandError::Spawn)?;
    let app = prepare_run(&ctx.store, request).map_err(CommandError::Spawn)?;
    start(ctx, app, skip_logs).await
}

pub async fn restart(ctx: &Context, name: &str, skip_logs: bool) -> Result<ExitCode, CommandError> {
    if !ctx.any_apps()? {
        return Ok(ExitCode::SUCCESS);
    }
    let app = prepare_restart(&ctx.store, name).map_err(|e| match e {
        SpawnError::Store {
            source: StoreError::NotFound,
        } => CommandError::NotFound(name.to_string()),
        e => CommandError::Spawn(e),
    })?;
    start(ctx, app, skip_logs).await
}

async fn start(ctx: &Context, app: App, skip_logs: bool) -> Result<ExitCode, CommandError> {
    let pid = launch_background(&app.name, ctx.env.debug).map_err(CommandError::Spawn)?;
    println!("{} started with PID: {pid}", app.name);
    if !skip_logs {
        stream_logs(ctx, &app).await?;
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn kill(ctx: &Context, name: &str) -> Result<ExitCode, CommandError> {
    if !ctx.any_apps()? {
        return Ok(ExitCode::SUCCESS);
    }
    let app = ctx.get(name)?;
    let cancel = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::debug!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    match kill_app(&ctx.store, &app, &ctx.settings.kill, cancel).await? {
        Termination::Cancelled => println!("Stopped waiting, {name} may still be running"),
        Termination::Graceful | Termination::Forced => println!("App successfully killed"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Stop an active app and make sure its record ends up terminal.
pub async fn kill_app<F>(
    store: &Store,
    app: &App,
    config: &KillConfig,
    cancel: F,
) -> Result<Termination, CommandError>
where
    F: std::future::Future<Output = ()>,
{
    if !app.is_active() {
        return Err(CommandError::NotActive(app.name.clone()));
    }
    if app.pid <= 0 {
        return Err(CommandError::NotStarted(app.name.clone()));
    }

    tracing::debug!(name = %app.name, pid = app.pid, "killing app");
    let signalled_at = Utc::now();
    let termination = terminate(app.pid, config, cancel).await;
    if termination == Termination::Cancelled {
        return Ok(termination);
    }

    let root = BTreeSet::from([app.pid]);
    if wait_for_exit(&root, config.finalize_wait(), config.poll_interval()).await {
        finalize_killed(store, &app.name, signalled_at)?;
    } else {
        tracing::warn!(name = %app.name, pid = app.pid, "supervisor still alive after kill");
    }
    Ok(termination)
}

/// Record a kill the supervisor did not get to write, or wrote as some other
/// failure.
///
/// A failure that finished after `signalled_at` was caused by the kill. A
/// success is kept. Returns whether the record was changed.
pub fn finalize_killed(
    store: &Store,
    name: &str,
    signalled_at: DateTime<Utc>,
) -> Result<bool, CommandError> {
    let mut app = match store.read(name) {
        Ok(app) => app,
        // Removed concurrently; nothing left to finalize.
        Err(StoreError::NotFound) => return Ok(false),
        Err(e) => return Err(CommandError::Store(e)),
    };
    let settled = match (app.status, app.finished_at) {
        (AppStatus::Success, Some(_)) => true,
        (AppStatus::Failed, Some(finished)) => {
            app.exit_code == Some(EXIT_CODE_KILLED) || finished < signalled_at
        }
        _ => false,
    };
    if settled {
        return Ok(false);
    }
    app.status = AppStatus::Failed;
    app.exit_code = Some(EXIT_CODE_KILLED);
    app.finished_at = Some(Utc::now());
    store.save(&app).map_err(CommandError::Store)?;
    tracing::debug!(name, "kill recorded on behalf of supervisor");
    Ok(true)
}

pub async fn remove(ctx: &Context, name: &str) -> Result<ExitCode, CommandError> {
    if !ctx.any_apps()? {
        return Ok(ExitCode::SUCCESS);
    }
    let app = ctx.get(name)?;
    if app.is_active() {
        return Err(CommandError::StillActive(app.name));
    }
    ctx.store.remove(name).map_err(CommandError::Store)?;
    println!("app: {name} removed");
    Ok(ExitCode::SUCCESS)
}

/// Remove every finished app in the selected statuses. Returns the names removed.
pub async fn remove_many(
    ctx: &Context,
    failed: bool,
    success: bool,
) -> Result<Vec<String>, CommandError> {
    if !failed && !success {
        return Err(CommandError::NothingSelected);
    }
    if !ctx.any_apps()? {
        return Ok(Vec::new());
    }

    let apps = ctx.store.list().await.map_err(CommandError::Store)?;
    if !apps.iter().any(|app| !app.is_active()) {
        println!("No apps that can be removed");
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for app in apps {
        let selected = match app.status {
            AppStatus::Failed => failed,
            AppStatus::Success => success,
            AppStatus::Starting | AppStatus::Running => false,
        };
        if !selected {
            continue;
        }
        ctx.store.remove(&app.name).map_err(CommandError::Store)?;
        println!("app: {} removed", app.name);
        removed.push(app.name);
    }
    Ok(removed)
}

pub async fn status(
    ctx: &Context,
    name: &str,
    format: OutputFormat,
) -> Result<ExitCode, CommandError> {
    validate_name(name).map_err(CommandError::InvalidName)?;
    let has = ctx.store.has_any().map_err(CommandError::Store)?;
    if format == OutputFormat::Table {
        if !has {
            println!("{NO_APPS_MESSAGE}");
            return Ok(ExitCode::SUCCESS);
        }
        print!("{}", render_status(&ctx.get(name)?));
        return Ok(ExitCode::SUCCESS);
    }

    let found = if has {
        match ctx.store.get(name) {
            Ok(app) => Ok(app),
            Err(StoreError::NotFound) => Err("not_found"),
            Err(e) => return Err(CommandError::Store(e)),
        }
    } else {
        Err("no_apps")
    };

    let (rendered, code) = match (&found, format) {
        (Ok(app), OutputFormat::Json) => (to_json(app)?, ExitCode::SUCCESS),
        (Ok(app), _) => (to_yaml(app)?, ExitCode::SUCCESS),
        (Err(kind), OutputFormat::Json) => (to_json(&error_body(kind))?, ExitCode::FAILURE),
        (Err(kind), _) => (to_yaml(&error_body(kind))?, ExitCode::FAILURE),
    };
    println!("{}", rendered.trim_end());
    Ok(code)
}

fn error_body(kind: &str) -> std::collections::BTreeMap<&'static str, &str> {
    std::collections::BTreeMap::from([("error", kind)])
}

pub async fn logs(ctx: &Context, name: &str) -> Result<ExitCode, CommandError> {
    if !ctx.any_apps()? {
        return Ok(ExitCode::SUCCESS);
    }
    let app = ctx.get(name)?;
    stream_logs(ctx, &app).await?;
    Ok(ExitCode::SUCCESS)
}

/// Print an app's output: all of it for a finished app, or follow it until
/// the app finishes or the user presses Ctrl-C.
async fn stream_logs(ctx: &Context, app: &App) -> Result<(), CommandError> {
    let config = &ctx.settings.logs;
    println!(
        "Streaming logs for app: {}. \
         You can stop the streaming with CTRL+C, the process won't be interrupted",
        app.name
    );

    if !app.is_active() {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        return dump(app, &mut stdout.lock(), &mut stderr.lock(), config.max_line_bytes)
            .map_err(CommandError::Logs);
    }

    let mut follower = follow(app, config.poll_interval(), config.max_line_bytes);
    let mut ticker = tokio::time::interval(config.status_interval());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let finished = loop {
        tokio::select! {
            _ = &mut ctrl_c => return Ok(()),
            line = follower.lines.recv() => match line {
                Some(line) => print_line(line.stream, &line.text),
                None => return Ok(()),
            },
            _ = ticker.tick() => match ctx.store.get(&app.name) {
                Ok(current) if !current.is_active() => break current,
                Ok(_) => {}
                Err(e) => tracing::debug!(name = %app.name, error = %e, "status check failed"),
            },
        }
    };

    // Drain what was written right before the process finished.
    follower.finish();
    while let Some(line) = follower.lines.recv().await {
        print_line(line.stream, &line.text);
    }
    println!("Process completed with status: {}", finished.status_line());
    Ok(())
}

fn print_line(stream: LogStream, text: &str) {
    match stream {
        LogStream::Stdout => println!("{text}"),
        LogStream::Stderr => eprintln!("{text}"),
    }
}

/// Relaunch every finished on-boot app.
pub async fn onboot(ctx: &Context) -> Result<ExitCode, CommandError> {
    let apps = ctx.store.list().await.map_err(CommandError::Store)?;
    if apps.is_empty() {
        println!("{NO_APPS_MESSAGE}");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Running on-boot");
    for app in apps {
        if app.is_active() {
            println!("application already running {}", app.name);
            continue;
        }
        if app.mode != RunMode::OnBoot {
            continue;
        }
        match launch_background(&app.name, ctx.env.debug) {
            Ok(pid) => println!("{} started with PID: {pid}", app.name),
            Err(e) => println!("error while running ({}) on boot: {e}", app.name),
        }
    }
    println!("Finished on-boot");
    Ok(ExitCode::SUCCESS)
}

/// The hidden supervisor entrypoint.
pub async fn background(ctx: &Context, name: &str) -> Result<ExitCode, CommandError> {
    let stop = spawn_signal_listener().map_err(CommandError::Io)?;
    let app = supervise(&ctx.store, name, stop)
        .await
        .map_err(CommandError::Supervisor)?;
    tracing::debug!(name, status = %app.status, "supervisor done");
    Ok(ExitCode::SUCCESS)
}

/// Forward SIGTERM, SIGINT and SIGHUP as stop requests.
///
/// The handlers are installed before this returns, so no signal delivered
/// afterwards is lost.
fn spawn_signal_listener() -> std::io::Result<mpsc::UnboundedReceiver<StopReason>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let reason = tokio::select! {
                _ = sigterm.recv() => StopReason::Terminate,
                _ = sigint.recv() => StopReason::Interrupt,
                _ = sighup.recv() => StopReason::Hangup,
            };
            if tx.send(reason).is_err() {
                return;
            }
        }
    });
    Ok(rx)
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, CommandError> {
    serde_json::to_string(value).map_err(|e| CommandError::Render(e.to_string()))
}

fn to_yaml<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, CommandError> {
    serde_yaml::to_string(value).map_err(|e| CommandError::Render(e.to_string()))
}

pub fn render_list(apps: &[App]) -> String {
    let rows: Vec<[String; 4]> = apps
        .iter()
        .map(|app| {
            [
                app.name.clone(),
                app.status_line(),
                app.mode.label().to_string(),
                app.pid.to_string(),
            ]
        })
        .collect();
    let header = ["NAME", "STATUS", "MODE", "PID"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: [&str; 4]| {
        let line = format!(
            "{:<w0$}  {:<w1$}  {:<w2$}  {}",
            cells[0],
            cells[1],
            cells[2],
            cells[3],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
        );
        out.push_str(line.trim_end());
        out.push('\n');
    };
    push_row(header);
    for row in &rows {
        push_row([&row[0], &row[1], &row[2], &row[3]]);
    }
    out
}

pub fn render_status(app: &App) -> String {
    let mut rows: Vec<(&str, String)> = vec![
        ("Name", app.name.clone()),
        ("Status", app.status_line()),
        ("Mode", app.mode.label().to_string()),
        ("PID", app.pid.to_string()),
    ];
    if let Some(started) = app.started_at {
        rows.push(("Started at", started.to_rfc2822()));
    }
    if let Some(finished) = app.finished_at {
        rows.push(("Finished at", finished.to_rfc2822()));
    }
    rows.push(("Command", app.command.clone()));
    rows.push(("CWD", app.cwd.display().to_string()));
    rows.push(("Stdout", app.stdout_path.display().to_string()));
    rows.push(("Stderr", app.stderr_path.display().to_string()));

    let mut out = String::new();
    for (label, value) in rows {
        out.push_str(&format!("{label:<12} {value}\n"));
    }
    out.push_str("Env\n");
    for (key, value) in app.env_pairs() {
        out.push_str(&format!("  {key} = {value}\n"));
    }
    out
}

/// Errors surfaced to the user by a subcommand.
#[derive(Debug)]
pub enum CommandError {
    InvalidName(String),
    NotFound(String),
    NotActive(String),
    NotStarted(String),
    StillActive(String),
    NothingSelected,
    Config(ConfigError),
    Store(StoreError),
    Spawn(SpawnError),
    Supervisor(SupervisorError),
    Logs(LogsError),
    Render(String),
    Io(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::InvalidName(msg) => write!(f, "invalid name: {msg}"),
            CommandError::NotFound(name) => write!(f, "app: {name} does not exist"),
            CommandError::NotActive(name) => write!(f, "app: {name} is not running"),
            CommandError::NotStarted(name) => {
                write!(f, "app: {name} has not started yet, try again shortly")
            }
            CommandError::StillActive(name) => write!(
                f,
                "app: {name} is running and cannot be removed, use `runapp kill {name}` to stop it"
            ),
            CommandError::NothingSelected => {
                write!(f, "select at least one of --failed, --success")
            }
            CommandError::Config(e) => write!(f, "{e}"),
            CommandError::Store(e) => write!(f, "{e}"),
            CommandError::Spawn(e) => write!(f, "{e}"),
            CommandError::Supervisor(e) => write!(f, "{e}"),
            CommandError::Logs(e) => write!(f, "{e}"),
            CommandError::Render(msg) => write!(f, "failed to render output: {msg}"),
            CommandError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Config(e) => Some(e),
            CommandError::Store(e) => Some(e),
            CommandError::Spawn(e) => Some(e),
            CommandError::Supervisor(e) => Some(e),
            CommandError::Logs(e) => Some(e),
            CommandError::Io(e) => Some(e),
            _ => None,
        }
    }
}
