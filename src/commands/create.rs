//! Create a sandbox.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use super::{to_json, Backend};
use crate::session::SessionInfo;

/// Format a created session for humans
pub fn format_created(info: &SessionInfo, provider: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} Created {} sandbox", "✓".green(), provider);
    let _ = writeln!(out, "  ID:       {}", info.session_id.cyan());
    let _ = writeln!(out, "  Timeout:  {}", format_timeout(info.timeout_ms).cyan());

    let ports = if info.exposed_ports.is_empty() {
        "none".to_string()
    } else {
        info.exposed_ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = writeln!(out, "  Ports:    {}", ports.cyan());
    out
}

/// Whole minutes when exact, seconds otherwise
fn format_timeout(timeout_ms: u64) -> String {
    if timeout_ms % 60_000 == 0 {
        format!("{}m", timeout_ms / 60_000)
    } else {
        format!("{}s", timeout_ms / 1000)
    }
}

pub async fn run(backend: &Backend, timeout_ms: Option<u64>, ports: Vec<u16>, json: bool) -> Result<()> {
    let info = backend.create(timeout_ms, ports).await?;

    if json {
        println!("{}", to_json(&info)?);
    } else {
        print!("{}", format_created(&info, backend.manager().provider_name()));
    }
    Ok(())
}
