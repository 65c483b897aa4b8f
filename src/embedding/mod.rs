//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait and the built-in feature-hashing
//! provider. The provider is created via [`create_provider`] from configuration;
//! anything implementing the trait can be plugged into the index instead.

pub mod hashing;

use crate::error::{KbError, KbResult};

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`dimensions`]
/// length. All methods are synchronous: callers in async contexts should use
/// `tokio::task::spawn_blocking`.
///
/// [`dimensions`]: EmbeddingProvider::dimensions
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> KbResult<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> KbResult<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Identifier persisted next to cached vectors; a change invalidates the cache.
    fn model_id(&self) -> String;
}

/// Create an embedding provider from config.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> KbResult<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Box::new(hashing::HashingEmbedder::new(config.dimensions)?)),
        other => Err(KbError::Embedding(format!(
            "unknown embedding provider: {other}. Supported: hashing"
        ))),
    }
}
