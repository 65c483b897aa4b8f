#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kb::config::KbConfig;
use kb::daemon::{Daemon, DaemonClient};
use kb::embedding::hashing::HashingEmbedder;
use kb::embedding::EmbeddingProvider;
use kb::fact::{FactType, NewFact, Quality};
use kb::store::KnowledgeStore;
use kb::{KbError, KbResult};
use tempfile::TempDir;
use tokio::net::UnixListener;

/// A throwaway project directory plus a private runtime directory for sockets.
pub struct TestProject {
    pub dir: TempDir,
    pub runtime: TempDir,
    pub config: KbConfig,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let runtime = tempfile::tempdir().unwrap();
        let mut config = KbConfig::default();
        config.lifecycle.runtime_dir = runtime.path().to_string_lossy().into_owned();
        config.server.idle_timeout_secs = 0;
        Self {
            dir,
            runtime,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> KnowledgeStore {
        KnowledgeStore::open(self.root(), &self.config).unwrap()
    }

    /// A store whose embedder the test can stall or break.
    pub fn controlled_store(&self) -> (KnowledgeStore, Arc<ControlledEmbedder>) {
        let embedder = Arc::new(ControlledEmbedder::new(self.config.embedding.dimensions));
        let store = KnowledgeStore::with_embedder(self.root(), &self.config, embedder.clone());
        (store, embedder)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root().join(&self.config.storage.store_dir).join("facts.log")
    }
}

/// The default hashing embedder with two switches: batch calls (used by full
/// builds) can be held until released, and single embeds (used by appends and
/// queries) can be made to fail. Cached vectors stay compatible with
/// [`TestProject::store`].
pub struct ControlledEmbedder {
    inner: HashingEmbedder,
    batches_open: AtomicBool,
    single_fails: AtomicBool,
}

impl ControlledEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            inner: HashingEmbedder::new(dimensions).unwrap(),
            batches_open: AtomicBool::new(true),
            single_fails: AtomicBool::new(false),
        }
    }

    pub fn hold_batches(&self) {
        self.batches_open.store(false, Ordering::SeqCst);
    }

    pub fn release_batches(&self) {
        self.batches_open.store(true, Ordering::SeqCst);
    }

    pub fn fail_single(&self, fail: bool) {
        self.single_fails.store(fail, Ordering::SeqCst);
    }
}

impl EmbeddingProvider for ControlledEmbedder {
    fn embed(&self, text: &str) -> KbResult<Vec<f32>> {
        if self.single_fails.load(Ordering::SeqCst) {
            return Err(KbError::Embedding("embedder switched off".into()));
        }
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> KbResult<Vec<Vec<f32>>> {
        while !self.batches_open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        texts.iter().map(|t| self.inner.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}

/// Poll `condition` for up to five seconds.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

/// [`wait_until`] for async tests: yields to the runtime between polls.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Build an append payload with the fields most tests care about.
pub fn new_fact(title: &str, summary: &str, fact_type: FactType) -> NewFact {
    NewFact {
        summary: summary.to_string(),
        fact_type,
        quality: Quality::Medium,
        provenance: Some("test".to_string()),
        ..NewFact::new(title)
    }
}

/// A daemon serving `store` on a socket inside `runtime_dir`, driven by the
/// current tokio runtime instead of a separate process.
pub struct InProcessDaemon {
    pub daemon: Arc<Daemon>,
    pub socket: PathBuf,
    pub handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl InProcessDaemon {
    pub fn client(&self) -> DaemonClient {
        DaemonClient::new(&self.socket)
    }
}

pub fn serve_in_process(store: KnowledgeStore, config: &KbConfig, runtime_dir: &Path) -> InProcessDaemon {
    let socket = runtime_dir.join(format!("kb-test-{}.sock", uuid::Uuid::now_v7().simple()));
    let listener = UnixListener::bind(&socket).unwrap();
    let daemon = Daemon::new(Arc::new(store), config.server.clone());
    let handle = tokio::spawn(Arc::clone(&daemon).serve(listener));
    InProcessDaemon {
        daemon,
        socket,
        handle,
    }
}
