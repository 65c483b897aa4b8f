//! Per-project knowledge store: an append-only fact log served by a warm hybrid
//! search daemon.
//!
//! Each project keeps its knowledge under `<project>/.kb/`. Facts are appended
//! to `facts.log` and never rewritten except by an explicit repair. A
//! per-project daemon holds the derived search index in memory so repeated
//! queries skip the cold start, and clients reach it over a Unix socket named
//! after a hash of the project root.
//!
//! | Fact type | Typical use |
//! |-----------|-------------|
//! | **lesson** | Something learned the hard way |
//! | **finding** | An observation about the codebase or environment |
//! | **solution** | A fix that worked |
//! | **pattern** | A reusable approach |
//! | **decision** | A choice and its context |
//! | **note** | Anything else |
//!
//! # Architecture
//!
//! - **Storage**: JSON lines in `facts.log`, fsynced per append; the log is the
//!   single source of truth
//! - **Index**: an in-memory SQLite database per generation, with FTS5 for
//!   BM25 and sqlite-vec for cosine similarity; embeddings are cached on disk
//!   under `index/vectors.db`
//! - **Search**: both sub-indexes merged via Reciprocal Rank Fusion
//! - **Transport**: newline-delimited JSON over a Unix socket, one request per
//!   connection
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`fact`]: Fact records, the append-only log and its folded view
//! - [`embedding`]: Pluggable text-to-vector embedding
//! - [`index`]: Lexical and vector sub-indexes and their manager
//! - [`db`]: SQLite embedding cache and per-generation search databases
//! - [`query`]: Hybrid ranking with Reciprocal Rank Fusion
//! - [`store`]: The store facade serializing all writes
//! - [`daemon`]: Socket server, wire protocol and client
//! - [`lifecycle`]: Endpoint identity, stale cleanup and daemon auto-start

pub mod config;
pub mod daemon;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fact;
pub mod index;
pub mod lifecycle;
pub mod query;
pub mod store;

pub use error::{KbError, KbResult};
