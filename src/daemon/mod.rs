//! Per-project daemon: keeps one store's index warm and serves it over a Unix
//! socket.
//!
//! The daemon binds its socket before loading anything, so `ping` and `status`
//! answer while the initial index load runs. Every other command waits for the
//! `Ready` phase and for one of `max_connections` work permits; `ping`,
//! `status` and `stop` never take a permit. Store work runs on the blocking
//! pool; reads proceed in parallel and writes serialize inside
//! [`KnowledgeStore`].

pub mod client;
mod connection;
pub mod protocol;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{KbConfig, ServerConfig};
use crate::error::{KbError, KbResult};
use crate::lifecycle::{self, DaemonLock};
use crate::store::KnowledgeStore;

pub use client::DaemonClient;
pub use protocol::{AdminAction, DaemonStatus, Phase, Request, Response, PING_ACK};

/// How long a stopping daemon waits for in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Daemon {
    store: Arc<KnowledgeStore>,
    config: ServerConfig,
    phase: watch::Sender<Phase>,
    launch_time: Instant,
    last_activity: AtomicU64,
    rebuild_scheduled: AtomicBool,
    work_permits: Arc<Semaphore>,
}

impl Daemon {
    pub fn new(store: Arc<KnowledgeStore>, config: ServerConfig) -> Arc<Self> {
        let (phase, _) = watch::channel(Phase::Starting);
        let work_permits = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Arc::new(Self {
            store,
            config,
            phase,
            launch_time: Instant::now(),
            last_activity: AtomicU64::new(0),
            rebuild_scheduled: AtomicBool::new(false),
            work_permits,
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    fn clock(&self) -> u64 {
        self.launch_time.elapsed().as_millis() as u64
    }

    /// Record query/append traffic for the idle timer.
    fn touch(&self) {
        self.last_activity.fetch_max(self.clock(), Ordering::Relaxed);
    }

    fn idle_duration(&self) -> Duration {
        let idle = self
            .clock()
            .saturating_sub(self.last_activity.load(Ordering::Relaxed));
        Duration::from_millis(idle)
    }

    /// Move to `ShuttingDown` and interrupt any running rebuild.
    pub fn request_shutdown(&self, reason: &str) {
        self.store.cancel_rebuild();
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == Phase::ShuttingDown {
                return false;
            }
            *phase = Phase::ShuttingDown;
            true
        });
        if changed {
            info!(reason, "daemon shutting down");
        }
    }

    pub fn status(&self) -> DaemonStatus {
        let store = self.store.status();
        DaemonStatus {
            phase: self.phase(),
            project_root: self.store.project_root().to_path_buf(),
            initialized: store.initialized,
            fact_count: store.fact_count,
            freshness: store.index.freshness,
            incremental_since_rebuild: store.index.incremental_since_rebuild,
            last_rebuild_at: store.index.last_rebuild_at,
            rebuilding: store.index.rebuilding,
            uptime_secs: self.launch_time.elapsed().as_secs(),
            pid: std::process::id(),
            skipped_lines: store.skipped_lines,
        }
    }

    /// Block until the initial load finished. Fails once shutdown started.
    async fn wait_ready(&self) -> KbResult<()> {
        let mut rx = self.phase.subscribe();
        let phase = rx
            .wait_for(|phase| *phase != Phase::Starting)
            .await
            .map(|phase| *phase)
            .unwrap_or(Phase::ShuttingDown);
        match phase {
            Phase::Ready => Ok(()),
            _ => Err(KbError::Cancelled),
        }
    }

    /// Run `f` against the store on the blocking pool once the daemon is ready
    /// and a work permit is free.
    async fn with_store<T, F>(&self, f: F) -> KbResult<T>
    where
        F: FnOnce(&KnowledgeStore) -> KbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.wait_ready().await?;
        let _permit = self
            .work_permits
            .acquire()
            .await
            .map_err(|_| KbError::Cancelled)?;
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| KbError::Io(std::io::Error::other(format!("store task failed: {err}"))))?
    }

    /// Rebuild in the background unless one is already queued.
    fn schedule_rebuild(self: &Arc<Self>) {
        if self.rebuild_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            info!("background rebuild scheduled");
            match daemon.with_store(|store| store.rebuild()).await {
                Ok(report) => info!(facts = report.facts, "background rebuild finished"),
                Err(KbError::Cancelled) => info!("background rebuild cancelled"),
                Err(err) => error!(error = %err, "background rebuild failed"),
            }
            daemon.rebuild_scheduled.store(false, Ordering::SeqCst);
        });
    }

    async fn warm_up(self: Arc<Self>) {
        let started = Instant::now();
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.warm()).await;
        let needs_rebuild = match result {
            Ok(Ok(initialized)) => {
                info!(
                    initialized,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "initial index load finished"
                );
                false
            }
            Ok(Err(err)) => {
                error!(error = %err, "initial index load failed");
                true
            }
            Err(err) => {
                error!(error = %err, "initial index load panicked");
                true
            }
        };

        let ready = self.phase.send_if_modified(|phase| {
            if *phase != Phase::Starting {
                return false;
            }
            *phase = Phase::Ready;
            true
        });
        if ready {
            info!("daemon ready");
            if needs_rebuild {
                self.schedule_rebuild();
            }
        }
    }

    fn spawn_idle_watcher(self: &Arc<Self>, timeout: Duration) {
        let daemon = Arc::clone(self);
        let check_interval = (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(30));
        let mut phase_rx = self.phase.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(check_interval) => {}
                    changed = phase_rx.changed() => {
                        if changed.is_err() || *phase_rx.borrow() == Phase::ShuttingDown {
                            break;
                        }
                        continue;
                    }
                }
                if daemon.store.status().index.rebuilding {
                    continue;
                }
                if daemon.idle_duration() > timeout {
                    daemon.request_shutdown("idle timeout");
                    break;
                }
            }
        });
    }

    /// Accept connections until the daemon reaches `ShuttingDown`, then drain
    /// in-flight store work and flush parked usage updates.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        let max_connections = self.config.max_connections.max(1);

        let warm = tokio::spawn(Arc::clone(&self).warm_up());
        if let Some(timeout) = self.config.idle_timeout() {
            self.spawn_idle_watcher(timeout);
        }

        let mut phase_rx = self.phase.subscribe();
        loop {
            if *phase_rx.borrow_and_update() == Phase::ShuttingDown {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            error!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let daemon = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = connection::handle_connection(stream, daemon).await {
                            debug!(error = %err, "connection error");
                        }
                    });
                }
                changed = phase_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        let drained = tokio::time::timeout(
            DRAIN_TIMEOUT,
            self.work_permits.acquire_many(max_connections as u32),
        )
        .await;
        if drained.is_err() {
            warn!("in-flight requests still running at shutdown");
        }
        warm.abort();

        let store = Arc::clone(&self.store);
        if let Err(err) = tokio::task::spawn_blocking(move || store.flush()).await {
            error!(error = %err, "final usage flush panicked");
        }
        info!("daemon stopped");
        Ok(())
    }
}

/// Entry point of `kb daemon run`: claim the project's endpoint, serve until
/// stopped, then remove the endpoint artifacts.
///
/// Exits quietly if another daemon already holds the endpoint lock.
pub async fn run(project_root: &Path, config: KbConfig) -> Result<()> {
    let runtime_dir = config.lifecycle.resolved_runtime_dir();
    let endpoint = lifecycle::resolve_endpoint(project_root, &runtime_dir)?;
    std::fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("failed to create {}", runtime_dir.display()))?;

    let Some(_lock) = DaemonLock::try_acquire(&endpoint.lock_file)? else {
        info!(socket = %endpoint.socket.display(), "daemon already running for this project");
        return Ok(());
    };

    // Holding the lock means any socket file left behind is stale.
    if endpoint.socket.exists() {
        std::fs::remove_file(&endpoint.socket)?;
    }
    let listener = UnixListener::bind(&endpoint.socket)
        .with_context(|| format!("failed to bind {}", endpoint.socket.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&endpoint.socket, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::write(&endpoint.pid_file, std::process::id().to_string())?;
    let _artifacts = lifecycle::EndpointGuard::new(&endpoint);

    info!(
        project = %endpoint.project_root.display(),
        socket = %endpoint.socket.display(),
        pid = std::process::id(),
        "daemon listening"
    );

    let store = Arc::new(KnowledgeStore::open(&endpoint.project_root, &config)?);
    let daemon = Daemon::new(store, config.server.clone());

    let signals = Arc::clone(&daemon);
    tokio::spawn(async move {
        let reason = shutdown_signal().await;
        signals.request_shutdown(reason);
    });

    daemon.serve(listener).await
}

async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return "interrupt";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "interrupt",
        _ = terminate.recv() => "terminate",
    }
}
