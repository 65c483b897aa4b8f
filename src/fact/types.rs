//! Fact record definitions.
//!
//! A [`Fact`] is versioned by field presence: every field added after the first
//! release carries a serde default, so older log lines keep parsing. Fields this
//! build does not know about are kept in [`Fact::extra`] and written back
//! unchanged on compaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};

/// Knowledge category of a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Lesson,
    Finding,
    Solution,
    Pattern,
    Decision,
    #[default]
    Note,
    /// A tag written by a newer build.
    #[serde(other)]
    Other,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lesson => "lesson",
            Self::Finding => "finding",
            Self::Solution => "solution",
            Self::Pattern => "pattern",
            Self::Decision => "decision",
            Self::Note => "note",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lesson" => Ok(Self::Lesson),
            "finding" => Ok(Self::Finding),
            "solution" => Ok(Self::Solution),
            "pattern" => Ok(Self::Pattern),
            "decision" => Ok(Self::Decision),
            "note" => Ok(Self::Note),
            _ => Err(format!("unknown fact type: {s}")),
        }
    }
}

/// Quality tier assigned by whoever captured the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    High,
    #[default]
    Medium,
    Low,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("unknown quality tier: {s}")),
        }
    }
}

fn default_provenance() -> String {
    "unknown".into()
}

fn default_score() -> f64 {
    0.5
}

/// One knowledge record, exactly as stored on a `facts.log` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// UUID v7, assigned on append and never reused.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atomic_insight: Option<String>,
    #[serde(rename = "type", default)]
    pub fact_type: FactType,
    #[serde(default)]
    pub key_concepts: Vec<String>,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "default_provenance")]
    pub provenance: String,
    /// URL or file path the fact was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default = "default_score")]
    pub relevance: f64,
    #[serde(default = "default_score")]
    pub confidence: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Fact {
    /// Text fed to both the lexical and the vector sub-index.
    pub fn index_text(&self) -> String {
        let mut text = String::with_capacity(
            self.title.len() * 2 + self.summary.len() + 64,
        );
        // Title is repeated so it outweighs body matches.
        text.push_str(&self.title);
        text.push(' ');
        text.push_str(&self.title);
        text.push(' ');
        text.push_str(&self.summary);
        if let Some(insight) = &self.atomic_insight {
            text.push(' ');
            text.push_str(insight);
        }
        for concept in &self.key_concepts {
            text.push(' ');
            text.push_str(concept);
        }
        text
    }

    /// Record one successful retrieval.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used = Some(at);
    }
}

/// Append payload: everything a collaborator supplies for a new fact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewFact {
    pub title: String,
    pub summary: String,
    pub atomic_insight: Option<String>,
    #[serde(rename = "type")]
    pub fact_type: FactType,
    pub key_concepts: Vec<String>,
    pub quality: Quality,
    pub provenance: Option<String>,
    pub source: Option<String>,
    pub relevance: Option<f64>,
    pub confidence: Option<f64>,
}

impl NewFact {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Reject payloads that could never be a valid fact.
    pub fn validate(&self) -> KbResult<()> {
        if self.title.trim().is_empty() {
            return Err(KbError::Protocol("title must not be empty".into()));
        }
        if self.fact_type == FactType::Other {
            return Err(KbError::Protocol("unknown fact type".into()));
        }
        for (name, value) in [("relevance", self.relevance), ("confidence", self.confidence)] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(KbError::Protocol(format!(
                        "{name} must be between 0.0 and 1.0"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Assign identity and creation time.
    pub fn into_fact(self, now: DateTime<Utc>) -> Fact {
        Fact {
            id: uuid::Uuid::now_v7().to_string(),
            title: self.title.trim().to_string(),
            summary: self.summary,
            atomic_insight: self.atomic_insight.filter(|s| !s.trim().is_empty()),
            fact_type: self.fact_type,
            key_concepts: self
                .key_concepts
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            quality: self.quality,
            provenance: self.provenance.unwrap_or_else(default_provenance),
            source: self.source,
            created_at: now,
            usage_count: 0,
            last_used: None,
            relevance: self.relevance.unwrap_or_else(default_score),
            confidence: self.confidence.unwrap_or_else(default_score),
            extra: serde_json::Map::new(),
        }
    }
}
