//! The per-project knowledge store: fact log, folded fact table and hybrid index
//! behind one writer.
//!
//! Every mutation of the log (appends, usage updates, compaction, rebuilds) runs
//! while holding the writer mutex. Queries never wait for it: they read the live
//! index snapshot and, if the writer is busy, park their usage updates until the
//! next writer flushes them. A table swapped in by a rebuild or repair picks up
//! the parked updates before anyone can read it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{KbConfig, RetrievalConfig};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{KbError, KbResult};
use crate::fact::{Fact, FactLog, FactTable, LineError, NewFact};
use crate::index::{IndexManager, IndexStatus, RebuildReport};
use crate::query::{self, QueryFilters, ScoredFact};

/// On-disk locations of one project's store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub root: PathBuf,
    pub store_dir: PathBuf,
    pub log_path: PathBuf,
    pub index_dir: PathBuf,
    pub timeline_path: PathBuf,
}

impl StoreLayout {
    pub fn new(project_root: impl Into<PathBuf>, store_dir: &str) -> Self {
        let root = project_root.into();
        let store_dir = root.join(store_dir);
        Self {
            log_path: store_dir.join("facts.log"),
            index_dir: store_dir.join("index"),
            timeline_path: store_dir.join("timeline.log"),
            store_dir,
            root,
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendOutcome {
    pub id: String,
    /// Whether the fact reached the live index immediately.
    pub indexed: bool,
    /// The incremental update failed; the caller should schedule a rebuild.
    #[serde(skip)]
    pub rebuild_needed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub initialized: bool,
    pub fact_count: usize,
    pub skipped_lines: usize,
    pub superseded_lines: usize,
    pub index: IndexStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateReport {
    pub lines: usize,
    pub malformed: usize,
    pub errors: Vec<LineError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReport {
    pub kept: usize,
    pub dropped_corrupt: usize,
    pub dropped_superseded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error: Option<LineError>,
    pub rebuild: RebuildReport,
}

pub struct KnowledgeStore {
    layout: StoreLayout,
    retrieval: RetrievalConfig,
    writer: Mutex<FactLog>,
    table: RwLock<Option<FactTable>>,
    skipped_lines: AtomicUsize,
    pending_usage: Mutex<Vec<Fact>>,
    index: IndexManager,
}

impl KnowledgeStore {
    /// Open the store of `project_root` with the configured embedding provider.
    /// Nothing is read or created on disk until the first operation.
    pub fn open(project_root: impl Into<PathBuf>, config: &KbConfig) -> KbResult<Self> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        Ok(Self::with_embedder(project_root, config, embedder))
    }

    pub fn with_embedder(
        project_root: impl Into<PathBuf>,
        config: &KbConfig,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let layout = StoreLayout::new(project_root, &config.storage.store_dir);
        let mut log = FactLog::new(&layout.log_path);
        if config.storage.timeline {
            log = log.with_timeline(&layout.timeline_path);
        }
        let index = IndexManager::with_cache_dir(embedder, &layout.index_dir);
        Self {
            layout,
            retrieval: config.retrieval.clone(),
            writer: Mutex::new(log),
            table: RwLock::new(None),
            skipped_lines: AtomicUsize::new(0),
            pending_usage: Mutex::new(Vec::new()),
            index,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn project_root(&self) -> &Path {
        &self.layout.root
    }

    pub fn is_initialized(&self) -> bool {
        self.layout.log_path.is_file()
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    /// Create the store directory and an empty fact log. Returns `true` if the
    /// store did not exist before.
    pub fn init(&self) -> KbResult<bool> {
        let log = self.write_lock();
        log.init()
    }

    /// Load the table and build the index if that has not happened yet.
    ///
    /// Returns `Ok(false)` when the store is not initialized, so a daemon can
    /// come up for a project that has no facts yet.
    pub fn warm(&self) -> KbResult<bool> {
        match self.ensure_loaded() {
            Ok(()) => Ok(true),
            Err(KbError::NotInitialized(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn ensure_loaded(&self) -> KbResult<()> {
        if self.read_table().is_some() {
            return Ok(());
        }
        let log = self.write_lock();
        if self.read_table().is_some() {
            return Ok(());
        }
        self.load_locked(&log)
    }

    fn load_locked(&self, log: &FactLog) -> KbResult<()> {
        let (table, report) = FactTable::load(log)?;
        self.skipped_lines.store(report.errors.len(), Ordering::SeqCst);
        let built = self.index.load(table.iter());
        let facts = table.len();
        *self.write_table() = Some(table);
        let built = built?;
        tracing::info!(
            facts,
            lines = report.lines_read,
            skipped = report.errors.len(),
            embedded = built.embedded,
            "store loaded"
        );
        Ok(())
    }

    /// Durably append a new fact, then index it.
    ///
    /// The log write happens first and its failure fails the append. A failed
    /// index update leaves the fact logged and marks the index stale.
    pub fn append(&self, new_fact: NewFact) -> KbResult<AppendOutcome> {
        new_fact.validate()?;
        let fact = new_fact.into_fact(Utc::now());

        let log = self.write_lock();
        log.init()?;
        let mut rebuild_needed = false;
        if self.read_table().is_none() {
            if let Err(err) = self.load_locked(&log) {
                if self.read_table().is_none() {
                    return Err(err);
                }
                tracing::warn!(error = %err, "index load failed, appending anyway");
                rebuild_needed = true;
            }
        }
        self.flush_usage_locked(&log);

        log.append(&fact)?;
        if let Some(table) = self.write_table().as_mut() {
            table.upsert(fact.clone());
        }

        let outcome = match self.index.apply_incremental(&fact) {
            Ok(indexed) => AppendOutcome {
                id: fact.id.clone(),
                indexed,
                rebuild_needed,
            },
            Err(err) => {
                tracing::warn!(error = %err, fact_id = %fact.id, "incremental index update failed");
                self.index.mark_stale();
                AppendOutcome {
                    id: fact.id.clone(),
                    indexed: false,
                    rebuild_needed: true,
                }
            }
        };
        tracing::info!(fact_id = %fact.id, fact_type = %fact.fact_type, "fact appended");
        Ok(outcome)
    }

    /// Run a hybrid query and record usage on every returned fact.
    pub fn query(
        &self,
        text: &str,
        filters: &QueryFilters,
        top_k: Option<usize>,
    ) -> KbResult<Vec<ScoredFact>> {
        if !self.is_initialized() {
            return Err(KbError::NotInitialized(self.layout.log_path.clone()));
        }
        self.ensure_loaded()?;

        let top_k = top_k.unwrap_or(self.retrieval.default_top_k);
        let ranked = query::rank(&self.index, text, filters, top_k, &self.retrieval)?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = ranked.iter().map(|r| r.id.clone()).collect();
        let touched = match self.write_table().as_mut() {
            Some(table) => table.touch(&ids, Utc::now()),
            None => Vec::new(),
        };
        self.persist_usage(&touched);

        let results = ranked
            .into_iter()
            .filter_map(|r| {
                let fact = touched.iter().find(|f| f.id == r.id)?.clone();
                Some(ScoredFact {
                    fact,
                    score: r.score,
                    lexical_rank: r.lexical_rank,
                    vector_rank: r.vector_rank,
                })
            })
            .collect();
        Ok(results)
    }

    /// Persist usage updates now if the writer is free, otherwise park them
    /// for the next writer.
    fn persist_usage(&self, touched: &[Fact]) {
        if touched.is_empty() {
            return;
        }
        lock(&self.pending_usage).extend_from_slice(touched);
        if let Ok(log) = self.writer.try_lock() {
            self.flush_usage_locked(&log);
        }
    }

    /// Write parked usage updates to the log now. Called once more by the
    /// daemon after its last request drained.
    pub fn flush(&self) {
        let log = self.write_lock();
        self.flush_usage_locked(&log);
    }

    fn flush_usage_locked(&self, log: &FactLog) {
        let mut table = self.write_table();
        self.drain_usage(log, table.as_mut());
    }

    /// Replace the table with one freshly loaded from the log, carrying over
    /// usage that queries recorded against the old one meanwhile.
    fn install_table_locked(&self, log: &FactLog, table: FactTable) {
        let mut slot = self.write_table();
        *slot = Some(table);
        self.drain_usage(log, slot.as_mut());
    }

    fn drain_usage(&self, log: &FactLog, mut table: Option<&mut FactTable>) {
        let pending = std::mem::take(&mut *lock(&self.pending_usage));
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        for fact in pending {
            if let Err(err) = log.append_usage(&fact) {
                tracing::warn!(error = %err, fact_id = %fact.id, "failed to persist usage update");
                continue;
            }
            if let Some(table) = table.as_deref_mut() {
                table.upsert(fact);
            }
        }
        tracing::debug!(count, "usage updates flushed");
    }

    pub fn status(&self) -> StoreStatus {
        let (fact_count, superseded_lines) = match self.read_table().as_ref() {
            Some(table) => (table.len(), table.superseded_lines()),
            None => (0, 0),
        };
        StoreStatus {
            initialized: self.is_initialized(),
            fact_count,
            skipped_lines: self.skipped_lines.load(Ordering::SeqCst),
            superseded_lines,
            index: self.index.status(),
        }
    }

    /// Discard the index and rebuild it from a full log scan.
    ///
    /// Queries keep using the previous snapshot until the new one is swapped in.
    /// Returns [`KbError::Cancelled`] if [`cancel_rebuild`] was called meanwhile.
    ///
    /// [`cancel_rebuild`]: KnowledgeStore::cancel_rebuild
    pub fn rebuild(&self) -> KbResult<RebuildReport> {
        let log = self.write_lock();
        self.flush_usage_locked(&log);
        let (table, load) = FactTable::load(&log)?;
        let report = self.index.rebuild(table.iter())?;
        self.skipped_lines.store(load.errors.len(), Ordering::SeqCst);
        self.install_table_locked(&log, table);
        Ok(report)
    }

    /// Ask an in-flight rebuild to stop. Sticky: the store is expected to be
    /// shutting down.
    pub fn cancel_rebuild(&self) {
        self.index.request_cancel();
    }

    /// Report malformed log lines without modifying anything.
    pub fn validate(&self) -> KbResult<ValidateReport> {
        let log = self.write_lock();
        let mut iter = log.read_all()?;
        let parsed = iter.by_ref().count();
        let errors = iter.errors().to_vec();
        tracing::debug!(parsed, malformed = errors.len(), "fact log validated");
        Ok(ValidateReport {
            lines: iter.lines_read(),
            malformed: errors.len(),
            errors,
        })
    }

    /// Compact the log to one line per fact, dropping unparsable and superseded
    /// lines, then rebuild the index from scratch.
    pub fn repair(&self) -> KbResult<RepairReport> {
        let log = self.write_lock();
        self.flush_usage_locked(&log);

        let (mut table, load) = FactTable::load(&log)?;
        let dropped_superseded = table.superseded_lines();
        log.rewrite(table.iter())?;
        table.mark_compacted();

        self.index.reset_cache()?;
        let rebuild = self.index.rebuild(table.iter())?;

        let report = RepairReport {
            kept: table.len(),
            dropped_corrupt: load.errors.len(),
            dropped_superseded,
            first_error: load.errors.first().cloned(),
            rebuild,
        };
        tracing::info!(
            kept = report.kept,
            dropped_corrupt = report.dropped_corrupt,
            dropped_superseded = report.dropped_superseded,
            "fact log repaired"
        );
        self.skipped_lines.store(0, Ordering::SeqCst);
        self.install_table_locked(&log, table);
        Ok(report)
    }

    fn write_lock(&self) -> MutexGuard<'_, FactLog> {
        lock(&self.writer)
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, Option<FactTable>> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, Option<FactTable>> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactType;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> KnowledgeStore {
        KnowledgeStore::open(dir.path(), &KbConfig::default()).unwrap()
    }

    #[test]
    fn query_before_init_is_not_initialized() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let err = store.query("anything", &QueryFilters::default(), None).unwrap_err();
        assert_eq!(err.code(), "not_initialized");
        assert!(!tmp.path().join(".kb").exists());
    }

    #[test]
    fn initialized_but_empty_returns_no_results() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(store.init().unwrap());
        assert!(!store.init().unwrap());
        let results = store.query("anything", &QueryFilters::default(), None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn append_initializes_lazily_and_is_queryable() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let outcome = store.append(NewFact::new("Lazy init works")).unwrap();
        assert!(outcome.indexed);
        assert!(store.is_initialized());

        let results = store.query("lazy init", &QueryFilters::default(), Some(3)).unwrap();
        assert_eq!(results[0].fact.id, outcome.id);
    }

    #[test]
    fn usage_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let store = store(&tmp);
            let id = store.append(NewFact::new("Persistent usage")).unwrap().id;
            store.query("persistent usage", &QueryFilters::default(), None).unwrap();
            store.query("persistent usage", &QueryFilters::default(), None).unwrap();
            id
        };

        let reopened = store(&tmp);
        let results = reopened
            .query("persistent usage", &QueryFilters::default(), None)
            .unwrap();
        let fact = results.iter().find(|r| r.fact.id == id).unwrap();
        assert_eq!(fact.fact.usage_count, 3);
    }

    #[test]
    fn invalid_fact_is_rejected_before_logging() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let err = store.append(NewFact::new("  ")).unwrap_err();
        assert_eq!(err.code(), "protocol");
        assert!(!store.is_initialized());
    }

    #[test]
    fn repair_compacts_superseded_and_corrupt_lines() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut fact = NewFact::new("Compaction target");
        fact.fact_type = FactType::Finding;
        store.append(fact).unwrap();
        store.query("compaction target", &QueryFilters::default(), None).unwrap();
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&store.layout().log_path)
                .unwrap();
            f.write_all(b"{not json}\n").unwrap();
        }

        let validated = store.validate().unwrap();
        assert_eq!(validated.malformed, 1);
        assert_eq!(validated.errors[0].line, 3);

        let report = store.repair().unwrap();
        assert_eq!(report.kept, 1);
        assert_eq!(report.dropped_corrupt, 1);
        assert_eq!(report.dropped_superseded, 1);
        assert_eq!(report.first_error.unwrap().line, 3);

        let contents = std::fs::read_to_string(&store.layout().log_path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"usage_count\":1"));
        assert_eq!(store.validate().unwrap().malformed, 0);
    }

    #[test]
    fn rebuild_reports_every_fact() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        for title in ["one fact", "two fact", "three fact"] {
            store.append(NewFact::new(title)).unwrap();
        }
        let report = store.rebuild().unwrap();
        assert_eq!(report.facts, 3);
        let status = store.status();
        assert_eq!(status.fact_count, 3);
        assert_eq!(status.index.incremental_since_rebuild, 0);
    }
}
