mod app;
mod commands;
mod config;
mod data_dir;
mod kill;
mod logs;
mod probe;
mod reconcile;
mod shell;
mod spawn;
mod store;
mod supervisor;

use clap::{Parser, Subcommand};
use commands::{Context, OutputFormat};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Run and manage background processes (apps) without a daemon.
#[derive(Parser, Debug)]
#[command(name = "runapp", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Print the app list as JSON
    #[arg(long, conflicts_with = "yaml")]
    json: bool,

    /// Print the app list as YAML
    #[arg(long)]
    yaml: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an app
    Run {
        /// Name of the app
        name: String,
        /// Command that will be executed
        #[arg(long)]
        command: String,
        /// Automatically start the app on boot
        #[arg(long)]
        start_on_boot: bool,
        /// Skip log streaming after start
        #[arg(long)]
        skip_logs: bool,
    },
    /// Restart a finished app with its original command, directory and environment
    Restart {
        name: String,
        /// Skip log streaming after restart
        #[arg(long)]
        skip_logs: bool,
    },
    /// Kill an app
    Kill { name: String },
    /// Remove a finished app
    Remove { name: String },
    /// Remove all finished apps with the selected status
    Removemany {
        /// All failed apps
        #[arg(long)]
        failed: bool,
        /// All successful apps
        #[arg(long)]
        success: bool,
    },
    /// Read the status of an app
    Status {
        name: String,
        /// Output as JSON
        #[arg(long, conflicts_with = "yaml")]
        json: bool,
        /// Output as YAML
        #[arg(long)]
        yaml: bool,
    },
    /// Stream the logs (stdout, stderr) of an app
    Logs { name: String },
    /// Relaunch on-boot apps
    #[command(hide = true)]
    Onboot,
    /// Supervise an app in the foreground
    #[command(hide = true)]
    Background {
        #[arg(long)]
        name: String,
    },
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn dispatch(cli: Cli, ctx: &Context) -> Result<ExitCode, commands::CommandError> {
    match cli.command {
        None => commands::list(ctx, OutputFormat::from_flags(cli.json, cli.yaml)).await,
        Some(Command::Run {
            name,
            command,
            start_on_boot,
            skip_logs,
        }) => commands::run(ctx, &name, &command, start_on_boot, skip_logs).await,
        Some(Command::Restart { name, skip_logs }) => {
            commands::restart(ctx, &name, skip_logs).await
        }
        Some(Command::Kill { name }) => commands::kill(ctx, &name).await,
        Some(Command::Remove { name }) => commands::remove(ctx, &name).await,
        Some(Command::Removemany { failed, success }) => {
            commands::remove_many(ctx, failed, success)
                .await
                .map(|_| ExitCode::SUCCESS)
        }
        Some(Command::Status { name, json, yaml }) => {
            commands::status(ctx, &name, OutputFormat::from_flags(json, yaml)).await
        }
        Some(Command::Logs { name }) => commands::logs(ctx, &name).await,
        Some(Command::Onboot) => commands::onboot(ctx).await,
        Some(Command::Background { name }) => commands::background(ctx, &name).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(config::is_debug(
        std::env::var(config::DEBUG_ENV).ok().as_deref(),
    ));
    tracing::debug!(?cli, "parsed CLI arguments");

    let result = match Context::load() {
        Ok(ctx) => dispatch(cli, &ctx).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
