//! Daemon lifecycle: endpoint identity, stale-state cleanup and supervised
//! auto-start.
//!
//! A project's daemon is identified by a hash of its canonical root. All of its
//! runtime artifacts live side by side in the runtime directory:
//!
//! | file | purpose |
//! |------|---------|
//! | `kb-<hash>.sock` | Unix socket endpoint |
//! | `kb-<hash>.pid` | PID of the serving daemon |
//! | `kb-<hash>.lock` | held exclusively by the live daemon for its whole life |
//! | `kb-<hash>.spawn.lock` | serializes concurrent auto-starts |
//! | `kb-<hash>.log` | stdout/stderr of the most recent spawn |
//!
//! The daemon lock is what makes "at most one daemon per project" hold; the
//! socket and PID files are only advertisements.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::KbConfig;
use crate::daemon::{DaemonClient, Request, Response};
use crate::error::{KbError, KbResult};

/// Hex characters of the project hash used in artifact names.
const HASH_LEN: usize = 16;
/// Tail of the startup log surfaced on a failed start.
const MAX_LOG_BYTES: u64 = 16 * 1024;

/// Where one project's daemon lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub project_root: PathBuf,
    pub hash: String,
    pub socket: PathBuf,
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    pub spawn_lock: PathBuf,
    pub log_file: PathBuf,
}

/// Fixed-width identity of a canonical project root.
pub fn project_hash(canonical_root: &Path) -> String {
    let digest = Sha256::digest(canonical_root.as_os_str().as_encoded_bytes());
    let mut hex = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Compute the endpoint of `project_root`'s daemon. Reads the filesystem to
/// canonicalize the root but creates nothing.
pub fn resolve_endpoint(project_root: &Path, runtime_dir: &Path) -> KbResult<EndpointInfo> {
    let project_root = fs::canonicalize(project_root)?;
    let hash = project_hash(&project_root);
    let file = |suffix: &str| runtime_dir.join(format!("kb-{hash}.{suffix}"));
    Ok(EndpointInfo {
        socket: file("sock"),
        pid_file: file("pid"),
        lock_file: file("lock"),
        spawn_lock: file("spawn.lock"),
        log_file: file("log"),
        hash,
        project_root,
    })
}

pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Exclusive lock held by a running daemon.
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
}

impl DaemonLock {
    /// Take the lock without blocking. `None` means another process holds it.
    pub fn try_acquire(path: &Path) -> KbResult<Option<Self>> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Removes a daemon's socket and PID file when it stops.
pub struct EndpointGuard {
    socket: PathBuf,
    pid_file: PathBuf,
}

impl EndpointGuard {
    pub fn new(endpoint: &EndpointInfo) -> Self {
        Self {
            socket: endpoint.socket.clone(),
            pid_file: endpoint.pid_file.clone(),
        }
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket);
        let _ = fs::remove_file(&self.pid_file);
    }
}

fn open_lock_file(path: &Path) -> KbResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn client_for(endpoint: &EndpointInfo, config: &KbConfig) -> DaemonClient {
    DaemonClient::new(&endpoint.socket).with_timeout(config.lifecycle.ping_timeout())
}

/// Remove `endpoint`'s socket and PID file if no live daemon owns them.
///
/// A daemon counts as dead only if it fails `ping` *and* its lock can be
/// taken; a slow daemon that misses the ping still holds the lock and is left
/// alone. Returns whether anything was removed.
pub async fn clean_stale_endpoint(endpoint: &EndpointInfo, config: &KbConfig) -> KbResult<bool> {
    if client_for(endpoint, config).ping().await.is_ok() {
        return Ok(false);
    }
    if !endpoint.lock_file.exists() && !endpoint.socket.exists() && !endpoint.pid_file.exists() {
        return Ok(false);
    }
    let Some(_lock) = DaemonLock::try_acquire(&endpoint.lock_file)? else {
        debug!(socket = %endpoint.socket.display(), "daemon unresponsive but alive, leaving endpoint");
        return Ok(false);
    };

    let mut removed = false;
    for path in [&endpoint.socket, &endpoint.pid_file] {
        match fs::remove_file(path) {
            Ok(()) => removed = true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    if removed {
        info!(socket = %endpoint.socket.display(), "removed stale daemon artifacts");
    }
    Ok(removed)
}

/// [`clean_stale_endpoint`] for a project root.
pub async fn clean_stale(project_root: &Path, config: &KbConfig) -> KbResult<bool> {
    let endpoint = resolve_endpoint(project_root, &config.lifecycle.resolved_runtime_dir())?;
    clean_stale_endpoint(&endpoint, config).await
}

/// Make sure a live daemon serves `project_root`, starting one if needed.
///
/// Concurrent callers serialize on the spawn lock, so at most one of them
/// spawns; the others find the daemon alive once they get the lock.
pub async fn ensure_daemon(project_root: &Path, config: &KbConfig) -> KbResult<EndpointInfo> {
    let runtime_dir = config.lifecycle.resolved_runtime_dir();
    let endpoint = resolve_endpoint(project_root, &runtime_dir)?;
    let client = client_for(&endpoint, config);
    if client.ping().await.is_ok() {
        return Ok(endpoint);
    }

    fs::create_dir_all(&runtime_dir)?;
    let spawn_lock = open_lock_file(&endpoint.spawn_lock)?;
    let spawn_lock = tokio::task::spawn_blocking(move || spawn_lock.lock_exclusive().map(|_| spawn_lock))
        .await
        .map_err(|err| KbError::Io(std::io::Error::other(err.to_string())))??;

    let result = start_locked(&endpoint, config, &client).await;
    let _ = FileExt::unlock(&spawn_lock);
    result.map(|_| endpoint)
}

async fn start_locked(endpoint: &EndpointInfo, config: &KbConfig, client: &DaemonClient) -> KbResult<()> {
    if client.ping().await.is_ok() {
        return Ok(());
    }
    clean_stale_endpoint(endpoint, config).await?;

    // A daemon holding the lock without answering is still loading; wait for it
    // instead of spawning a second one that would exit immediately.
    let mut child = match DaemonLock::try_acquire(&endpoint.lock_file)? {
        Some(lock) => {
            drop(lock);
            Some(spawn_daemon(endpoint, config)?)
        }
        None => None,
    };

    let deadline = Instant::now() + config.lifecycle.startup_timeout();
    let mut delay = Duration::from_millis(25);
    loop {
        if client.ping().await.is_ok() {
            info!(socket = %endpoint.socket.display(), "daemon is up");
            if let Some(spawned) = child {
                reap_in_background(spawned);
            }
            return Ok(());
        }
        if let Some(spawned) = child.as_mut() {
            if let Some(status) = spawned.try_wait()? {
                return Err(startup_failure(endpoint, format!("daemon exited during startup ({status})")));
            }
        }
        if Instant::now() >= deadline {
            if let Some(mut spawned) = child {
                warn!(pid = spawned.id(), "daemon did not answer in time, killing it");
                let _ = spawned.kill();
                let _ = spawned.wait();
            }
            return Err(startup_failure(
                endpoint,
                format!(
                    "no ping reply within {:?}",
                    config.lifecycle.startup_timeout()
                ),
            ));
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_millis(500));
    }
}

/// Start `kb daemon run` in its own session, with stdout/stderr going to the
/// endpoint log.
fn spawn_daemon(endpoint: &EndpointInfo, config: &KbConfig) -> KbResult<Child> {
    use std::os::unix::process::CommandExt;

    let exe = config
        .lifecycle
        .resolved_daemon_exe()
        .map_err(|err| startup_failure(endpoint, format!("{err:#}")))?;
    let out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&endpoint.log_file)?;
    let err = out.try_clone()?;

    let runtime_dir = config.lifecycle.resolved_runtime_dir();
    let mut command = Command::new(&exe);
    command
        .arg("--project")
        .arg(&endpoint.project_root)
        .args(["daemon", "run"])
        .env("KB_RUNTIME_DIR", &runtime_dir)
        .env("KB_STORE_DIR", &config.storage.store_dir)
        .env("KB_IDLE_TIMEOUT_SECS", config.server.idle_timeout_secs.to_string())
        .env("KB_LOG_LEVEL", &config.server.log_level)
        .current_dir(&endpoint.project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));
    // No controlling terminal and no job-control signals from the caller.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command
        .spawn()
        .map_err(|e| startup_failure(endpoint, format!("failed to spawn {}: {e}", exe.display())))?;

    info!(pid = child.id(), exe = %exe.display(), log = %endpoint.log_file.display(), "daemon spawned");
    Ok(child)
}

/// Wait for a daemon we spawned on a background thread, so a long-lived caller
/// does not keep it as a zombie once it exits.
fn reap_in_background(mut child: Child) {
    let pid = child.id();
    let spawned = std::thread::Builder::new()
        .name("kb-daemon-reaper".into())
        .spawn(move || match child.wait() {
            Ok(status) => debug!(pid, %status, "daemon exited"),
            Err(err) => debug!(pid, error = %err, "failed to reap daemon"),
        });
    if let Err(err) = spawned {
        warn!(pid, error = %err, "cannot start daemon reaper");
    }
}

fn startup_failure(endpoint: &EndpointInfo, message: String) -> KbError {
    KbError::DaemonStartup {
        message,
        log: read_log_tail(&endpoint.log_file),
    }
}

fn read_log_tail(path: &Path) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::from("(no startup log)");
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > MAX_LOG_BYTES {
        let _ = file.seek(SeekFrom::Start(len - MAX_LOG_BYTES));
    }
    let mut buf = Vec::new();
    let _ = file.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Send `request` to the project's daemon, starting it first if needed.
///
/// A request that could not even connect is retried once after cleaning stale
/// artifacts and restarting the daemon. Requests that may have reached a
/// daemon are never retried, so an append cannot be applied twice.
pub async fn call(project_root: &Path, config: &KbConfig, request: &Request) -> KbResult<Response> {
    let endpoint = ensure_daemon(project_root, config).await?;
    let client = DaemonClient::new(&endpoint.socket).with_timeout(request_timeout(request, config));
    match client.send(request).await {
        Err(KbError::DaemonUnreachable { reason, .. }) => {
            warn!(reason = %reason, "daemon vanished, restarting");
            clean_stale_endpoint(&endpoint, config).await?;
            ensure_daemon(project_root, config).await?;
            client.send(request).await
        }
        other => other,
    }
}

/// Administrative commands may walk the whole log, so they get more time.
fn request_timeout(request: &Request, config: &KbConfig) -> Duration {
    let base = config.server.request_timeout();
    match request {
        Request::Admin { .. } => base * 12,
        Request::Query { .. } | Request::Append { .. } => base + config.lifecycle.startup_timeout(),
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn endpoint_is_deterministic_and_fixed_width() {
        let project = TempDir::new().unwrap();
        let runtime = TempDir::new().unwrap();
        let a = resolve_endpoint(project.path(), runtime.path()).unwrap();
        let b = resolve_endpoint(&project.path().join("."), runtime.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash.len(), HASH_LEN);
        assert!(a.socket.ends_with(format!("kb-{}.sock", a.hash)));
        assert!(a.pid_file.ends_with(format!("kb-{}.pid", a.hash)));
    }

    #[test]
    fn different_roots_get_different_endpoints() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        let runtime = TempDir::new().unwrap();
        let a = resolve_endpoint(one.path(), runtime.path()).unwrap();
        let b = resolve_endpoint(two.path(), runtime.path()).unwrap();
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.socket, b.socket);
    }

    #[test]
    fn resolve_has_no_side_effects() {
        let project = TempDir::new().unwrap();
        let runtime = TempDir::new().unwrap();
        let missing = runtime.path().join("not-yet");
        resolve_endpoint(project.path(), &missing).unwrap();
        assert!(!missing.exists());
    }

    #[test]
    fn daemon_lock_is_exclusive() {
        let runtime = TempDir::new().unwrap();
        let path = runtime.path().join("kb-test.lock");
        let held = DaemonLock::try_acquire(&path).unwrap();
        assert!(held.is_some());
        assert!(DaemonLock::try_acquire(&path).unwrap().is_none());
        drop(held);
        assert!(DaemonLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn pid_file_parsing_tolerates_whitespace() {
        let runtime = TempDir::new().unwrap();
        let path = runtime.path().join("kb.pid");
        assert_eq!(read_pid(&path), None);
        fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path), Some(4242));
        fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid(&path), None);
    }
}
