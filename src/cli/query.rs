use std::path::Path;

use anyhow::Result;
use clap::Args;

use kb::config::KbConfig;
use kb::daemon::Request;
use kb::fact::{FactType, Quality};
use kb::query::{QueryFilters, ScoredFact};

#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Free-text query
    pub text: String,
    /// Maximum number of results
    #[arg(long)]
    pub top_k: Option<usize>,
    /// Only facts of this type
    #[arg(long = "type")]
    pub fact_type: Option<FactType>,
    /// Only facts of this quality tier
    #[arg(long)]
    pub quality: Option<Quality>,
    /// Only facts with this provenance
    #[arg(long)]
    pub provenance: Option<String>,
    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run a hybrid query from the terminal.
pub async fn query(project: &Path, config: &KbConfig, args: QueryArgs) -> Result<()> {
    let request = Request::Query {
        text: args.text,
        filters: QueryFilters {
            fact_type: args.fact_type,
            quality: args.quality,
            provenance: args.provenance,
        },
        top_k: args.top_k,
    };
    let results: Vec<ScoredFact> = super::request(project, config, request).await?;

    if args.json {
        return super::print_json(&results);
    }
    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s)\n", results.len());
    for (i, result) in results.iter().enumerate() {
        let fact = &result.fact;
        println!(
            "  {}. [{}] {} (quality: {}, score: {:.4}, used: {})",
            i + 1,
            fact.fact_type,
            fact.title,
            fact.quality,
            result.score,
            fact.usage_count
        );
        if !fact.summary.is_empty() {
            println!("     {}", super::preview(&fact.summary, 120));
        }
        if let Some(insight) = &fact.atomic_insight {
            println!("     insight: {}", super::preview(insight, 120));
        }
        if !fact.key_concepts.is_empty() {
            println!("     concepts: {}", fact.key_concepts.join(", "));
        }
        println!("     id: {}", fact.id);
        println!();
    }
    Ok(())
}
