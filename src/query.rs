//! Hybrid query: lexical + vector candidates merged by Reciprocal Rank Fusion.
//!
//! Each fact's fused score is `Σ 1 / (rrf_k + position)` over the sub-indexes it
//! appears in, with 1-based positions. Filters are applied while candidates are
//! collected, so filtered-out facts never occupy a rank.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::error::{KbError, KbResult};
use crate::fact::{Fact, FactType, Quality};
use crate::index::{IndexManager, SearchFilter};

/// Optional pre-filters on the candidate sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<FactType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl QueryFilters {
    /// The filter in the form the index stores its attributes.
    pub fn to_search_filter(&self) -> SearchFilter {
        SearchFilter {
            fact_type: self.fact_type.map(|t| t.as_str().to_string()),
            quality: self.quality.map(|q| q.as_str().to_string()),
            provenance: self.provenance.clone(),
        }
    }
}

/// A fact id with its fused score and per-list positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked {
    pub id: String,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

/// A hydrated query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredFact {
    #[serde(flatten)]
    pub fact: Fact,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lexical_rank: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_rank: Option<usize>,
}

/// Reciprocal Rank Fusion of two best-first id lists.
pub fn rrf_merge(lexical: &[String], vector: &[String], k: usize) -> Vec<Ranked> {
    let mut merged: HashMap<&str, Ranked> = HashMap::new();

    for (pos, id) in lexical.iter().enumerate() {
        let entry = merged.entry(id.as_str()).or_insert_with(|| Ranked {
            id: id.clone(),
            score: 0.0,
            lexical_rank: None,
            vector_rank: None,
        });
        entry.score += 1.0 / (k as f64 + (pos + 1) as f64);
        entry.lexical_rank = Some(pos + 1);
    }

    for (pos, id) in vector.iter().enumerate() {
        let entry = merged.entry(id.as_str()).or_insert_with(|| Ranked {
            id: id.clone(),
            score: 0.0,
            lexical_rank: None,
            vector_rank: None,
        });
        entry.score += 1.0 / (k as f64 + (pos + 1) as f64);
        entry.vector_rank = Some(pos + 1);
    }

    merged.into_values().collect()
}

/// Rank facts for `text`: candidates from both sub-indexes, fused, ordered by
/// score then most recent creation, truncated to `top_k`.
pub fn rank(
    index: &IndexManager,
    text: &str,
    filters: &QueryFilters,
    top_k: usize,
    config: &RetrievalConfig,
) -> KbResult<Vec<Ranked>> {
    if text.trim().is_empty() {
        return Err(KbError::Protocol("query text must not be empty".into()));
    }
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let depth = config.candidate_depth(top_k);
    let candidates = index.search(
        text,
        &filters.to_search_filter(),
        depth,
        config.min_similarity,
    )?;

    let lexical: Vec<String> = candidates.lexical.into_iter().map(|(id, _)| id).collect();
    let vector: Vec<String> = candidates.vector.into_iter().map(|(id, _)| id).collect();
    let mut fused = rrf_merge(&lexical, &vector, config.rrf_k);

    let created: HashMap<String, _> = fused
        .iter()
        .filter_map(|r| index.created_at(&r.id).map(|at| (r.id.clone(), at)))
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| created.get(&b.id).cmp(&created.get(&a.id)))
            .then_with(|| b.id.cmp(&a.id))
    });
    fused.truncate(top_k);

    tracing::debug!(
        query = %text,
        lexical = lexical.len(),
        vector = vector.len(),
        returned = fused.len(),
        "query ranked"
    );
    Ok(fused)
}
