//! Run a command inside a sandbox.
//!
//! In the foreground the command's output is replayed on our own stdout and
//! stderr and its exit code becomes ours. With `--follow` the command runs in
//! the background and its log lines are streamed as NDJSON until it ends.

use anyhow::{Context, Result};
use colored::Colorize;
use futures_util::StreamExt;
use std::io::Write as _;
use tokio::io::AsyncWriteExt;

use super::{to_json, Backend};
use crate::session::{CommandOutcome, CommandStatus};

pub struct ExecArgs {
    pub id: String,
    pub argv: Vec<String>,
    pub sudo: bool,
    pub background: bool,
    pub follow: bool,
    pub json: bool,
}

/// Format a background start for humans
pub fn format_started(outcome: &CommandOutcome) -> String {
    format!(
        "{} Started command {}\n",
        "✓".green(),
        outcome.command_id.cyan()
    )
}

/// Exit code to report for a finished foreground command
pub fn exit_code(outcome: &CommandOutcome) -> i32 {
    outcome.exit_code.unwrap_or(0)
}

/// Exit code to report once a followed command has ended
pub fn final_exit_code(status: &CommandStatus) -> i32 {
    match (status.exit_code, &status.error_text) {
        (Some(code), _) => code,
        (None, Some(_)) => 1,
        (None, None) => 0,
    }
}

pub async fn run(backend: &Backend, args: ExecArgs) -> Result<i32> {
    let (command, rest) = args.argv.split_first().context("No program given")?;
    let wait = !(args.background || args.follow);

    let outcome = backend
        .run(&args.id, command, rest, args.sudo, wait)
        .await?;

    if args.follow {
        return follow(backend, &outcome.command_id).await;
    }

    if args.json {
        println!("{}", to_json(&outcome)?);
        return Ok(exit_code(&outcome));
    }

    if wait {
        print!("{}", outcome.stdout.as_deref().unwrap_or_default());
        std::io::stdout().flush().context("Failed to flush stdout")?;
        eprint!("{}", outcome.stderr.as_deref().unwrap_or_default());
        Ok(exit_code(&outcome))
    } else {
        print!("{}", format_started(&outcome));
        Ok(0)
    }
}

async fn follow(backend: &Backend, command_id: &str) -> Result<i32> {
    let manager = backend.manager();
    let mut logs = manager.stream_command_logs(command_id).await?;
    let mut stdout = tokio::io::stdout();

    while let Some(line) = logs.next().await {
        let record = line.to_ndjson().context("Failed to encode log line")?;
        stdout
            .write_all(record.as_bytes())
            .await
            .context("Failed to write log line")?;
    }
    stdout.flush().await.context("Failed to flush stdout")?;

    let status = manager.command_status(command_id).await?;
    Ok(final_exit_code(&status))
}
