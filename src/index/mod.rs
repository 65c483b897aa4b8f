//! Hybrid index manager: a lexical and a vector sub-index over the same facts.
//!
//! Both sub-indexes live in one in-memory SQLite database per generation: an
//! FTS5 table for BM25 and embedding blobs scored by sqlite-vec. The live
//! generation sits behind an `RwLock`. A full rebuild fills a fresh database
//! without holding the lock and swaps it in at the end, so queries keep being
//! served from the previous snapshot while a rebuild runs. Incremental updates
//! take the write lock briefly and are deduplicated by fact id.

pub mod lexical;
pub mod vector;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::{embedding_to_bytes, open_search_database, VectorCache};
use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, KbResult};
use crate::fact::Fact;

/// Filter values as stored in the search tables. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub fact_type: Option<String>,
    pub quality: Option<String>,
    pub provenance: Option<String>,
}

/// One consistent generation of both sub-indexes.
pub struct HybridIndex {
    conn: Mutex<Connection>,
    created: HashMap<String, DateTime<Utc>>,
}

impl HybridIndex {
    fn open() -> KbResult<Self> {
        Ok(Self {
            conn: Mutex::new(open_search_database()?),
            created: HashMap::new(),
        })
    }

    /// Add every fact not indexed yet, in one transaction. Returns how many
    /// were added.
    fn insert_all<'a>(
        &mut self,
        entries: impl IntoIterator<Item = (&'a Fact, &'a [f32])>,
    ) -> KbResult<usize> {
        let conn = self.conn.get_mut().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let mut added = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO facts \
                 (id, fact_type, quality, provenance, created_at, embedding) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (fact, embedding) in entries {
                if self.created.contains_key(&fact.id) {
                    continue;
                }
                let inserted = stmt.execute(params![
                    fact.id,
                    fact.fact_type.as_str(),
                    fact.quality.as_str(),
                    fact.provenance,
                    fact.created_at.to_rfc3339(),
                    embedding_to_bytes(embedding),
                ])?;
                if inserted == 0 {
                    continue;
                }
                lexical::insert(&tx, tx.last_insert_rowid(), &fact.index_text())?;
                added.push((fact.id.clone(), fact.created_at));
            }
        }
        tx.commit()?;
        let count = added.len();
        self.created.extend(added);
        Ok(count)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.created.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }
}

/// How the live index relates to the fact log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Nothing built yet.
    Unbuilt,
    /// Built by a full rebuild, no appends since.
    Rebuilt,
    /// Full rebuild plus incremental updates.
    Incremental,
    /// An incremental update failed; a rebuild is pending.
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub freshness: Freshness,
    pub indexed: usize,
    pub incremental_since_rebuild: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rebuild_at: Option<DateTime<Utc>>,
    pub rebuilding: bool,
}

/// Candidate lists from each sub-index, best first. Fusion happens in the caller.
#[derive(Debug, Default, Clone)]
pub struct Candidates {
    pub lexical: Vec<(String, f64)>,
    pub vector: Vec<(String, f32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildReport {
    pub facts: usize,
    /// Facts whose vectors had to be computed (not served from the cache).
    pub embedded: usize,
    pub elapsed_ms: u64,
}

/// Facts embedded per provider call during a build.
const EMBED_BATCH: usize = 64;

pub struct IndexManager {
    live: RwLock<Option<HybridIndex>>,
    status: Mutex<IndexStatus>,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Mutex<Option<VectorCache>>,
    cache_path: Option<PathBuf>,
    cancel: AtomicBool,
}

impl IndexManager {
    /// An index with no persisted state.
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            live: RwLock::new(None),
            status: Mutex::new(IndexStatus {
                freshness: Freshness::Unbuilt,
                indexed: 0,
                incremental_since_rebuild: 0,
                last_rebuild_at: None,
                rebuilding: false,
            }),
            embedder,
            cache: Mutex::new(None),
            cache_path: None,
            cancel: AtomicBool::new(false),
        }
    }

    /// An index persisting its vectors under `dir` (the store's `index/`).
    ///
    /// The cache is opened on first use. An unreadable cache is deleted and
    /// recreated; if that fails too the index runs without persistence.
    pub fn with_cache_dir(embedder: Arc<dyn EmbeddingProvider>, dir: impl Into<PathBuf>) -> Self {
        let mut manager = Self::new(embedder);
        manager.cache_path = Some(dir.into().join("vectors.db"));
        manager
    }

    pub fn status(&self) -> IndexStatus {
        lock(&self.status).clone()
    }

    pub fn is_built(&self) -> bool {
        self.status().freshness != Freshness::Unbuilt
    }

    /// Ask a running rebuild to abandon its work. Sticky until [`reset_cancel`].
    ///
    /// [`reset_cancel`]: IndexManager::reset_cancel
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Discard all index state, including cached vectors, and rebuild from `facts`.
    pub fn rebuild<'a>(&self, facts: impl IntoIterator<Item = &'a Fact>) -> KbResult<RebuildReport> {
        if let Some(cache) = self.cache().as_ref() {
            cache.clear()?;
        }
        self.build(facts, HashMap::new(), true)
    }

    /// Startup fast path: reuse cached vectors, embed only what is missing.
    ///
    /// The last full rebuild recorded in the cache stays the reported
    /// `last_rebuild_at`; a cache without history records this build instead.
    pub fn load<'a>(&self, facts: impl IntoIterator<Item = &'a Fact>) -> KbResult<RebuildReport> {
        let cached = match self.cache().as_ref() {
            Some(cache) => cache.load_all().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "vector cache unreadable, embedding everything");
                HashMap::new()
            }),
            None => HashMap::new(),
        };
        self.build(facts, cached, false)
    }

    fn build<'a>(
        &self,
        facts: impl IntoIterator<Item = &'a Fact>,
        mut cached: HashMap<String, Vec<f32>>,
        full_rebuild: bool,
    ) -> KbResult<RebuildReport> {
        let started = std::time::Instant::now();
        let recorded = if full_rebuild {
            None
        } else {
            self.recorded_rebuild()
        };

        lock(&self.status).rebuilding = true;
        let result = self.build_inner(facts, &mut cached);
        lock(&self.status).rebuilding = false;

        let (fresh, new_vectors) = match result {
            Ok(built) => built,
            Err(err) => {
                if matches!(err, KbError::Cancelled) {
                    tracing::info!("rebuild cancelled, keeping previous index");
                }
                return Err(err);
            }
        };

        let report = RebuildReport {
            facts: fresh.len(),
            embedded: new_vectors.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        let finished_at = Utc::now();

        {
            let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
            *live = Some(fresh);
        }
        {
            let mut status = lock(&self.status);
            status.freshness = Freshness::Rebuilt;
            status.indexed = report.facts;
            status.incremental_since_rebuild = 0;
            status.last_rebuild_at = Some(recorded.unwrap_or(finished_at));
        }

        if let Some(cache) = self.cache().as_mut() {
            let persisted = cache
                .put_many(new_vectors.iter().map(|(id, v)| (id.as_str(), v.as_slice())))
                .and_then(|_| match recorded {
                    Some(_) => Ok(()),
                    None => cache.record_rebuild(report.facts, report.embedded, finished_at),
                });
            if let Err(err) = persisted {
                tracing::warn!(error = %err, "failed to persist vectors");
            }
        }

        tracing::info!(
            facts = report.facts,
            embedded = report.embedded,
            elapsed_ms = report.elapsed_ms,
            full_rebuild,
            "index built"
        );
        Ok(report)
    }

    fn build_inner<'a>(
        &self,
        facts: impl IntoIterator<Item = &'a Fact>,
        cached: &mut HashMap<String, Vec<f32>>,
    ) -> KbResult<(HybridIndex, Vec<(String, Vec<f32>)>)> {
        let dims = self.embedder.dimensions();
        let mut ready: Vec<(&Fact, Vec<f32>)> = Vec::new();
        let mut seen = HashSet::new();
        let mut missing = Vec::new();

        for fact in facts {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(KbError::Cancelled);
            }
            if !seen.insert(fact.id.as_str()) {
                continue;
            }
            match cached.remove(&fact.id) {
                Some(v) if v.len() == dims => ready.push((fact, v)),
                _ => missing.push(fact),
            }
        }

        let mut new_vectors = Vec::with_capacity(missing.len());
        for chunk in missing.chunks(EMBED_BATCH) {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(KbError::Cancelled);
            }
            let texts: Vec<String> = chunk.iter().map(|f| f.index_text()).collect();
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            let vectors = self.embedder.embed_batch(&refs)?;
            for (fact, v) in chunk.iter().zip(vectors) {
                new_vectors.push((fact.id.clone(), v.clone()));
                ready.push((*fact, v));
            }
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Err(KbError::Cancelled);
        }

        let mut fresh = HybridIndex::open()?;
        fresh.insert_all(ready.iter().map(|(fact, v)| (*fact, v.as_slice())))?;
        Ok((fresh, new_vectors))
    }

    /// Index exactly one new fact. Idempotent: returns `false` if the id is
    /// already indexed or the index has not been built yet (the first build
    /// will pick it up from the log).
    pub fn apply_incremental(&self, fact: &Fact) -> KbResult<bool> {
        if !self.is_built() {
            return Ok(false);
        }
        if self.read_live().as_ref().map_or(true, |live| live.contains(&fact.id)) {
            return Ok(false);
        }

        let embedding = self.embedder.embed(&fact.index_text())?;

        let inserted = {
            let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
            match live.as_mut() {
                Some(live) => live.insert_all([(fact, embedding.as_slice())])? > 0,
                None => false,
            }
        };
        if !inserted {
            return Ok(false);
        }

        {
            let mut status = lock(&self.status);
            status.indexed += 1;
            status.incremental_since_rebuild += 1;
            if status.freshness == Freshness::Rebuilt {
                status.freshness = Freshness::Incremental;
            }
        }
        if let Some(cache) = self.cache().as_ref() {
            if let Err(err) = cache.put(&fact.id, &embedding) {
                tracing::warn!(error = %err, fact_id = %fact.id, "failed to cache vector");
            }
        }
        tracing::debug!(fact_id = %fact.id, "fact indexed incrementally");
        Ok(true)
    }

    /// Flag the index as behind the log after a failed incremental update.
    pub fn mark_stale(&self) {
        let mut status = lock(&self.status);
        if status.freshness != Freshness::Unbuilt {
            status.freshness = Freshness::Stale;
        }
    }

    /// Candidates from each sub-index independently, `filter` applied before
    /// truncation to `depth`.
    pub fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        depth: usize,
        min_similarity: f32,
    ) -> KbResult<Candidates> {
        let query_vector = self.embedder.embed(query)?;
        let live = self.read_live();
        let Some(live) = live.as_ref() else {
            return Ok(Candidates::default());
        };
        let conn = lock(&live.conn);
        Ok(Candidates {
            lexical: lexical::search(&conn, query, filter, depth)?,
            vector: vector::search(&conn, &query_vector, filter, depth, min_similarity)?,
        })
    }

    /// Creation time of an indexed fact, used for tie-breaking.
    pub fn created_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.read_live()
            .as_ref()
            .and_then(|live| live.created.get(id).copied())
    }

    pub fn len(&self) -> usize {
        self.read_live().as_ref().map_or(0, HybridIndex::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the cache file entirely. Used when the cache itself is corrupt.
    pub fn reset_cache(&self) -> KbResult<()> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };
        let mut guard = lock(&self.cache);
        *guard = None;
        remove_db_files(path);
        *guard = open_cache(path, &self.embedder.model_id());
        Ok(())
    }

    /// Finish time of the last full rebuild recorded in the cache.
    fn recorded_rebuild(&self) -> Option<DateTime<Utc>> {
        let cache = self.cache();
        match cache.as_ref()?.last_rebuild() {
            Ok(record) => record.map(|r| r.finished_at),
            Err(err) => {
                tracing::warn!(error = %err, "rebuild history unreadable");
                None
            }
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, Option<VectorCache>> {
        let mut guard = lock(&self.cache);
        if guard.is_none() {
            if let Some(path) = &self.cache_path {
                *guard = open_cache(path, &self.embedder.model_id());
            }
        }
        guard
    }

    fn read_live(&self) -> std::sync::RwLockReadGuard<'_, Option<HybridIndex>> {
        self.live.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn open_cache(path: &std::path::Path, model_id: &str) -> Option<VectorCache> {
    match VectorCache::open(path, model_id) {
        Ok(cache) => Some(cache),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "vector cache unusable, recreating");
            remove_db_files(path);
            match VectorCache::open(path, model_id) {
                Ok(cache) => Some(cache),
                Err(err) => {
                    tracing::error!(error = %err, "running without a vector cache");
                    None
                }
            }
        }
    }
}

fn remove_db_files(path: &std::path::Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::hashing::HashingEmbedder;
    use crate::fact::{FactType, NewFact};

    fn manager() -> IndexManager {
        IndexManager::new(Arc::new(HashingEmbedder::new(64).unwrap()))
    }

    fn fact(title: &str) -> Fact {
        NewFact::new(title).into_fact(Utc::now())
    }

    #[test]
    fn incremental_before_first_build_is_deferred() {
        let index = manager();
        assert!(!index.apply_incremental(&fact("early")).unwrap());
        assert_eq!(index.status().freshness, Freshness::Unbuilt);
    }

    #[test]
    fn freshness_tracks_rebuild_and_appends() {
        let index = manager();
        let facts = vec![fact("alpha"), fact("beta")];
        index.rebuild(facts.iter()).unwrap();
        assert_eq!(index.status().freshness, Freshness::Rebuilt);

        assert!(index.apply_incremental(&fact("gamma")).unwrap());
        let status = index.status();
        assert_eq!(status.freshness, Freshness::Incremental);
        assert_eq!(status.incremental_since_rebuild, 1);
        assert_eq!(status.indexed, 3);
    }

    #[test]
    fn cancelled_rebuild_keeps_previous_snapshot() {
        let index = manager();
        let first = vec![fact("kept")];
        index.rebuild(first.iter()).unwrap();

        index.request_cancel();
        let second = vec![fact("lost one"), fact("lost two")];
        assert!(matches!(index.rebuild(second.iter()), Err(KbError::Cancelled)));
        assert_eq!(index.len(), 1);
        assert!(!index.status().rebuilding);

        index.reset_cancel();
        index.rebuild(second.iter()).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn filters_apply_to_both_sub_indexes() {
        let index = manager();
        let mut pattern = NewFact::new("retry backoff");
        pattern.fact_type = FactType::Pattern;
        let mut lesson = NewFact::new("retry backoff lesson");
        lesson.fact_type = FactType::Lesson;
        let facts = vec![pattern.into_fact(Utc::now()), lesson.into_fact(Utc::now())];
        index.rebuild(facts.iter()).unwrap();

        let only_lessons = SearchFilter {
            fact_type: Some("lesson".into()),
            ..SearchFilter::default()
        };
        let candidates = index.search("retry backoff", &only_lessons, 10, 0.0).unwrap();
        assert!(candidates.lexical.iter().all(|(id, _)| id == &facts[1].id));
        assert!(candidates.vector.iter().all(|(id, _)| id == &facts[1].id));
        assert_eq!(candidates.lexical.len(), 1);
    }

    #[test]
    fn unbuilt_index_has_no_candidates() {
        let index = manager();
        let candidates = index.search("anything", &SearchFilter::default(), 10, 0.0).unwrap();
        assert!(candidates.lexical.is_empty());
        assert!(candidates.vector.is_empty());
    }

    #[test]
    fn load_reuses_cached_vectors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::new(32).unwrap());
        let facts = vec![fact("one"), fact("two")];

        let first = IndexManager::with_cache_dir(embedder.clone(), tmp.path());
        let report = first.load(facts.iter()).unwrap();
        assert_eq!(report.embedded, 2);
        drop(first);

        let second = IndexManager::with_cache_dir(embedder, tmp.path());
        let report = second.load(facts.iter()).unwrap();
        assert_eq!(report.facts, 2);
        assert_eq!(report.embedded, 0);
    }

    #[test]
    fn load_reports_the_recorded_rebuild_time() {
        let tmp = tempfile::TempDir::new().unwrap();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::new(32).unwrap());
        let facts = vec![fact("one")];

        let first = IndexManager::with_cache_dir(embedder.clone(), tmp.path());
        first.rebuild(facts.iter()).unwrap();
        let rebuilt_at = first.status().last_rebuild_at.unwrap();
        drop(first);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = IndexManager::with_cache_dir(embedder, tmp.path());
        second.load(facts.iter()).unwrap();
        assert_eq!(second.status().last_rebuild_at, Some(rebuilt_at));
    }
}
