pub mod admin;
pub mod append;
pub mod query;
pub mod status;

use std::path::Path;

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;

use kb::config::KbConfig;
use kb::daemon::Request;
use kb::{lifecycle, KbError};

/// Send `request` to the project's daemon (auto-starting it) and decode the
/// result.
pub async fn request<T: DeserializeOwned>(
    project: &Path,
    config: &KbConfig,
    request: Request,
) -> Result<T> {
    let response = lifecycle::call(project, config, &request).await?;
    match response.into_result() {
        Ok(value) => Ok(value),
        Err(err) if err.code() == "not_initialized" => bail!(
            "no knowledge store in {} yet; run `kb init` or append a fact first",
            project.display()
        ),
        Err(err) => Err(err.into()),
    }
}

/// Cut `text` to at most `max` characters, marking the cut.
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

pub fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Map a client error for commands that must not auto-start the daemon.
pub fn not_running(err: KbError) -> anyhow::Error {
    match err {
        KbError::DaemonUnreachable { .. } => anyhow::anyhow!("daemon is not running"),
        other => other.into(),
    }
}
