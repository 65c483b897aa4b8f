use std::path::Path;

use anyhow::Result;
use clap::Args;

use kb::config::KbConfig;
use kb::daemon::Request;
use kb::fact::{FactType, NewFact, Quality};
use kb::store::AppendOutcome;

#[derive(Debug, Args)]
pub struct AppendArgs {
    /// Short title of the fact
    pub title: String,
    /// Prose summary
    #[arg(long, default_value = "")]
    pub summary: String,
    /// One-sentence atomic insight
    #[arg(long)]
    pub insight: Option<String>,
    /// lesson, finding, solution, pattern, decision or note
    #[arg(long = "type", default_value = "note")]
    pub fact_type: FactType,
    /// Key concept; repeat the flag or separate with commas
    #[arg(long = "concept", value_delimiter = ',')]
    pub concepts: Vec<String>,
    /// high, medium or low
    #[arg(long, default_value = "medium")]
    pub quality: Quality,
    /// Who or what produced the fact
    #[arg(long)]
    pub provenance: Option<String>,
    /// URL or file path the fact came from
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long)]
    pub relevance: Option<f64>,
    #[arg(long)]
    pub confidence: Option<f64>,
    /// Print the daemon's reply as JSON
    #[arg(long)]
    pub json: bool,
}

impl AppendArgs {
    fn into_new_fact(self) -> NewFact {
        NewFact {
            title: self.title,
            summary: self.summary,
            atomic_insight: self.insight,
            fact_type: self.fact_type,
            key_concepts: self.concepts,
            quality: self.quality,
            provenance: self.provenance,
            source: self.source,
            relevance: self.relevance,
            confidence: self.confidence,
        }
    }
}

/// Append one fact through the project's daemon.
pub async fn append(project: &Path, config: &KbConfig, args: AppendArgs) -> Result<()> {
    let json = args.json;
    let fact = args.into_new_fact();
    fact.validate()?;

    let outcome: AppendOutcome = super::request(project, config, Request::Append { fact }).await?;
    if json {
        return super::print_json(&outcome);
    }
    println!("Appended {}", outcome.id);
    if !outcome.indexed {
        println!("  (logged; the index will pick it up on the next rebuild)");
    }
    Ok(())
}
