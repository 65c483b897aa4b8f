//! Folded, in-memory view of the fact log.
//!
//! The log may hold several lines for one fact id: usage updates are persisted by
//! appending a fresh copy of the fact. [`FactTable`] folds them so the first line
//! stays authoritative for identity and content, and the newest usage counters win.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::log::{FactLog, LineError};
use super::types::Fact;
use crate::error::KbResult;

#[derive(Debug, Default, Clone)]
pub struct FactTable {
    order: Vec<String>,
    facts: HashMap<String, Fact>,
    superseded_lines: usize,
}

/// Outcome of loading a table from disk.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub lines_read: usize,
    pub errors: Vec<LineError>,
}

impl FactTable {
    /// Scan `log` and fold every parsable line.
    pub fn load(log: &FactLog) -> KbResult<(Self, LoadReport)> {
        let mut iter = log.read_all()?;
        let mut table = Self::default();
        for fact in iter.by_ref() {
            table.upsert(fact);
        }
        let report = LoadReport {
            lines_read: iter.lines_read(),
            errors: iter.errors().to_vec(),
        };
        if !report.errors.is_empty() {
            tracing::warn!(
                skipped = report.errors.len(),
                first_line = report.errors[0].line,
                "fact log contains malformed lines"
            );
        }
        Ok((table, report))
    }

    /// Fold one log line. Returns `true` if the id was new.
    pub fn upsert(&mut self, fact: Fact) -> bool {
        match self.facts.get_mut(&fact.id) {
            Some(existing) => {
                self.superseded_lines += 1;
                existing.usage_count = existing.usage_count.max(fact.usage_count);
                existing.last_used = existing.last_used.max(fact.last_used);
                false
            }
            None => {
                self.order.push(fact.id.clone());
                self.facts.insert(fact.id.clone(), fact);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Fact> {
        self.facts.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.facts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Log lines that only carried a newer copy of an existing fact.
    pub fn superseded_lines(&self) -> usize {
        self.superseded_lines
    }

    /// Facts in first-appearance order.
    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.order.iter().filter_map(|id| self.facts.get(id))
    }

    /// Bump usage for `ids` and return the updated copies to persist.
    pub fn touch(&mut self, ids: &[String], at: DateTime<Utc>) -> Vec<Fact> {
        ids.iter()
            .filter_map(|id| {
                let fact = self.facts.get_mut(id)?;
                fact.touch(at);
                Some(fact.clone())
            })
            .collect()
    }

    /// Forget superseded-line bookkeeping after the log was compacted.
    pub(crate) fn mark_compacted(&mut self) {
        self.superseded_lines = 0;
    }
}
