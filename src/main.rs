use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod poll;
mod provider;
mod session;
mod tasks;

#[derive(Parser)]
#[command(name = "sandman")]
#[command(
    author,
    version,
    about = "Session manager for ephemeral compute sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./sandman.toml)
    #[arg(long, global = true, env = "SANDMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Route operations through task submissions
    #[arg(long, global = true)]
    via_tasks: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox
    Create {
        /// Lifetime in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Port to expose (repeatable)
        #[arg(short, long = "port")]
        ports: Vec<u16>,

        /// Print a JSON object
        #[arg(long)]
        json: bool,
    },

    /// Run a command in a sandbox
    Exec {
        /// Sandbox ID
        id: String,

        /// Run with sudo
        #[arg(long)]
        sudo: bool,

        /// Return once the command has started
        #[arg(long)]
        background: bool,

        /// Start in the background and stream NDJSON log lines until it ends
        #[arg(long)]
        follow: bool,

        /// Print a JSON object
        #[arg(long)]
        json: bool,

        /// Program and arguments
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },

    /// Write a file into a sandbox
    Write {
        /// Sandbox ID
        id: String,

        /// Destination path inside the sandbox
        path: String,

        /// Local source file (defaults to stdin)
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Print a file from a sandbox
    Read {
        /// Sandbox ID
        id: String,

        /// Path inside the sandbox
        path: String,
    },

    /// Print the public URL of an exposed port
    Url {
        /// Sandbox ID
        id: String,

        /// Port number
        port: u16,

        /// Print a JSON object
        #[arg(long)]
        json: bool,
    },

    /// Show whether a sandbox is running
    Status {
        /// Sandbox ID
        id: String,

        /// Also run a probe command inside the sandbox
        #[arg(long)]
        deep: bool,

        /// Print a JSON object
        #[arg(long)]
        json: bool,
    },

    /// Terminate a sandbox
    Kill {
        /// Sandbox ID
        id: String,
    },
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = if cli.verbose {
        EnvFilter::new("sandman=debug")
    } else {
        EnvFilter::new("sandman=info")
    };

    let stderr_layer = if cli.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let backend = commands::Backend::load(cli.config.as_deref(), cli.via_tasks)?;

    match cli.command {
        Commands::Create {
            timeout_ms,
            ports,
            json,
        } => {
            commands::create::run(&backend, timeout_ms, ports, json).await?;
        }
        Commands::Exec {
            id,
            sudo,
            background,
            follow,
            json,
            argv,
        } => {
            let args = commands::exec::ExecArgs {
                id,
                argv,
                sudo,
                background,
                follow,
                json,
            };
            return commands::exec::run(&backend, args).await;
        }
        Commands::Write { id, path, from } => {
            commands::write::run(&backend, &id, &path, from.as_deref()).await?;
        }
        Commands::Read { id, path } => {
            commands::read::run(&backend, &id, &path).await?;
        }
        Commands::Url { id, port, json } => {
            commands::url::run(&backend, &id, port, json).await?;
        }
        Commands::Status { id, deep, json } => {
            commands::status::run(&backend, &id, deep, json).await?;
        }
        Commands::Kill { id } => {
            commands::kill::run(&backend, &id).await?;
        }
    }

    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = init_logging(&cli)?;

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            if let Some(hint) = commands::hint(&e) {
                eprintln!("{} {}", "hint:".yellow(), hint);
            }
            1
        }
    };

    // Flush the log file before a non-zero exit skips destructors
    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
