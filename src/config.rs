use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KbConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    pub idle_timeout_secs: u64,
    pub request_timeout_ms: u64,
    pub max_request_bytes: usize,
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub store_dir: String,
    pub timeline: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub dimensions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub rrf_k: usize,
    pub candidate_multiplier: usize,
    pub min_candidates: usize,
    pub min_similarity: f32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub runtime_dir: String,
    pub startup_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub daemon_exe: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            idle_timeout_secs: 1800,
            request_timeout_ms: 5000,
            max_request_bytes: 1024 * 1024,
            max_connections: 64,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_dir: ".kb".into(),
            timeline: true,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".into(),
            dimensions: 256,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            rrf_k: 60,
            candidate_multiplier: 3,
            min_candidates: 20,
            min_similarity: 0.05,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            runtime_dir: String::new(),
            startup_timeout_ms: 10_000,
            ping_timeout_ms: 500,
            daemon_exe: String::new(),
        }
    }
}

impl ServerConfig {
    /// `None` disables idle shutdown.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl RetrievalConfig {
    /// Candidate depth requested from each sub-index for a given `top_k`.
    pub fn candidate_depth(&self, top_k: usize) -> usize {
        top_k
            .saturating_mul(self.candidate_multiplier.max(1))
            .max(self.min_candidates)
    }
}

impl LifecycleConfig {
    /// Directory holding endpoint sockets, PID files and startup logs.
    pub fn resolved_runtime_dir(&self) -> PathBuf {
        if !self.runtime_dir.is_empty() {
            return expand_tilde(&self.runtime_dir);
        }
        dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Executable spawned as the daemon; defaults to the running binary.
    pub fn resolved_daemon_exe(&self) -> Result<PathBuf> {
        if !self.daemon_exe.is_empty() {
            return Ok(expand_tilde(&self.daemon_exe));
        }
        std::env::current_exe().context("failed to locate the kb executable")
    }
}

/// Returns `~/.config/kb/`, falling back to `~/.kb/` when no config dir is known.
pub fn default_kb_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("kb"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".kb")))
        .unwrap_or_else(|| PathBuf::from(".kb"))
}

/// Returns the default config file path, honoring `KB_CONFIG`.
pub fn default_config_path() -> PathBuf {
    match std::env::var("KB_CONFIG") {
        Ok(path) if !path.is_empty() => expand_tilde(&path),
        _ => default_kb_dir().join("config.toml"),
    }
}

impl KbConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            KbConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("KB_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("KB_RUNTIME_DIR") {
            self.lifecycle.runtime_dir = val;
        }
        if let Ok(val) = std::env::var("KB_STORE_DIR") {
            self.storage.store_dir = val;
        }
        if let Ok(val) = std::env::var("KB_DAEMON_EXE") {
            self.lifecycle.daemon_exe = val;
        }
        if let Ok(val) = std::env::var("KB_IDLE_TIMEOUT_SECS") {
            match val.parse() {
                Ok(secs) => self.server.idle_timeout_secs = secs,
                Err(_) => tracing::warn!(value = %val, "ignoring unparsable KB_IDLE_TIMEOUT_SECS"),
            }
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
