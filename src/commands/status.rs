//! Report whether a sandbox is running.
//!
//! A stopped sandbox is a normal answer, not an error: the command exits 0
//! either way and prints the status.

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use super::{to_json, Backend};
use crate::session::SessionStatus;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOutput<'a> {
    sandbox_id: &'a str,
    status: SessionStatus,
}

/// Format a status line for humans
pub fn format_status(id: &str, status: SessionStatus) -> String {
    let label = match status {
        SessionStatus::Running => "running".green().bold(),
        SessionStatus::Stopped => "stopped".red(),
    };
    format!("  {}  {}\n", id.cyan(), label)
}

pub async fn run(backend: &Backend, id: &str, deep: bool, json: bool) -> Result<()> {
    let status = backend.status(id, deep).await?;

    if json {
        println!(
            "{}",
            to_json(&StatusOutput {
                sandbox_id: id,
                status
            })?
        );
    } else {
        print!("{}", format_status(id, status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_status() {
        assert!(format_status("sbx1", SessionStatus::Running).contains("running"));
        assert!(format_status("sbx1", SessionStatus::Stopped).contains("stopped"));
    }

    #[test]
    fn test_json_shape() {
        let json = to_json(&StatusOutput {
            sandbox_id: "sbx1",
            status: SessionStatus::Stopped,
        })
        .unwrap();
        assert_eq!(json, r#"{"sandboxId":"sbx1","status":"stopped"}"#);
    }
}
