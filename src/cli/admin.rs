use std::path::Path;

use anyhow::Result;

use kb::config::KbConfig;
use kb::daemon::{AdminAction, Request};
use kb::index::RebuildReport;
use kb::store::{RepairReport, ValidateReport};

/// Create the store through the daemon so the single-writer rule holds.
pub async fn init(project: &Path, config: &KbConfig) -> Result<()> {
    let created: bool = super::request(
        project,
        config,
        Request::Admin {
            action: AdminAction::Init,
        },
    )
    .await?;
    let dir = project.join(&config.storage.store_dir);
    if created {
        println!("Initialized knowledge store at {}", dir.display());
    } else {
        println!("Knowledge store already initialized at {}", dir.display());
    }
    Ok(())
}

pub async fn rebuild(project: &Path, config: &KbConfig) -> Result<()> {
    let report: RebuildReport = super::request(
        project,
        config,
        Request::Admin {
            action: AdminAction::Rebuild,
        },
    )
    .await?;
    println!(
        "Rebuilt index: {} facts ({} embedded) in {}ms",
        report.facts, report.embedded, report.elapsed_ms
    );
    Ok(())
}

pub async fn validate(project: &Path, config: &KbConfig) -> Result<()> {
    let report: ValidateReport = super::request(
        project,
        config,
        Request::Admin {
            action: AdminAction::Validate,
        },
    )
    .await?;
    println!("Scanned {} line(s)", report.lines);
    if report.errors.is_empty() {
        println!("No malformed lines.");
        return Ok(());
    }
    println!("{} malformed line(s):", report.malformed);
    for err in &report.errors {
        println!("  line {}: {}", err.line, super::preview(&err.error, 100));
    }
    println!("\nRun `kb admin repair` to drop them.");
    Ok(())
}

pub async fn repair(project: &Path, config: &KbConfig) -> Result<()> {
    let report: RepairReport = super::request(
        project,
        config,
        Request::Admin {
            action: AdminAction::Repair,
        },
    )
    .await?;
    println!("Repair complete");
    println!("{}", "=".repeat(40));
    println!("  Facts kept:          {}", report.kept);
    println!("  Corrupt dropped:     {}", report.dropped_corrupt);
    println!("  Superseded dropped:  {}", report.dropped_superseded);
    if let Some(first) = &report.first_error {
        println!(
            "  First bad line:      {} ({})",
            first.line,
            super::preview(&first.error, 80)
        );
    }
    println!("  Index rebuilt:       {} facts", report.rebuild.facts);
    Ok(())
}
