use std::path::Path;

use anyhow::Result;

use kb::config::KbConfig;
use kb::daemon::{DaemonClient, DaemonStatus, Request};
use kb::lifecycle;

/// Show the daemon's view of the project store.
pub async fn status(project: &Path, config: &KbConfig, json: bool) -> Result<()> {
    let status: DaemonStatus = super::request(project, config, Request::Status).await?;
    if json {
        return super::print_json(&status);
    }

    println!("Knowledge Store Status");
    println!("{}", "=".repeat(40));
    println!("  Project:             {}", status.project_root.display());
    println!("  Daemon phase:        {}", status.phase);
    println!("  Daemon pid:          {}", status.pid);
    println!("  Uptime:              {}s", status.uptime_secs);
    println!("  Initialized:         {}", status.initialized);
    println!("  Facts:               {}", status.fact_count);
    println!("  Index freshness:     {:?}", status.freshness);
    println!("  Appends since build: {}", status.incremental_since_rebuild);
    if let Some(at) = status.last_rebuild_at {
        println!("  Last full build:     {}", at.to_rfc3339());
    }
    if status.rebuilding {
        println!("  Rebuild in progress");
    }
    if status.skipped_lines > 0 {
        println!(
            "  Malformed log lines: {} (run `kb admin validate`)",
            status.skipped_lines
        );
    }
    Ok(())
}

/// Liveness check that never starts a daemon.
pub async fn ping(project: &Path, config: &KbConfig) -> Result<()> {
    let endpoint = lifecycle::resolve_endpoint(project, &config.lifecycle.resolved_runtime_dir())?;
    let client = DaemonClient::new(&endpoint.socket).with_timeout(config.lifecycle.ping_timeout());
    client.ping().await.map_err(super::not_running)?;
    match lifecycle::read_pid(&endpoint.pid_file) {
        Some(pid) => println!("daemon alive (pid {pid}, socket {})", endpoint.socket.display()),
        None => println!("daemon alive (socket {})", endpoint.socket.display()),
    }
    Ok(())
}

/// Ask the project's daemon to shut down.
pub async fn stop(project: &Path, config: &KbConfig) -> Result<()> {
    let endpoint = lifecycle::resolve_endpoint(project, &config.lifecycle.resolved_runtime_dir())?;
    let client = DaemonClient::new(&endpoint.socket).with_timeout(config.server.request_timeout());
    match client.stop().await {
        Ok(()) => println!("daemon stop requested"),
        Err(kb::KbError::DaemonUnreachable { .. }) => {
            if lifecycle::clean_stale_endpoint(&endpoint, config).await? {
                println!("daemon was not running (stale files cleaned)");
            } else {
                println!("daemon is not running");
            }
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}
