//! Resolve the public URL of an exposed port.

use anyhow::Result;
use serde::Serialize;

use super::{to_json, Backend};

#[derive(Serialize)]
struct UrlOutput<'a> {
    url: &'a str,
}

pub async fn run(backend: &Backend, id: &str, port: u16, json: bool) -> Result<()> {
    let url = backend.url(id, port).await?;

    if json {
        println!("{}", to_json(&UrlOutput { url: &url })?);
    } else {
        println!("{url}");
    }
    Ok(())
}
