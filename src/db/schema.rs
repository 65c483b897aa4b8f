//! SQL DDL for the persisted index state and the in-memory search database.
//!
//! The on-disk cache holds `fact_vectors` and `schema_meta`. Each index
//! generation gets its own in-memory database with a `facts` table, the
//! `facts_fts` FTS5 table sharing its rowids, and one embedding blob per fact
//! scored with sqlite-vec. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- One cached embedding per fact, little-endian f32 blob
CREATE TABLE IF NOT EXISTS fact_vectors (
    fact_id TEXT PRIMARY KEY,
    dims INTEGER NOT NULL CHECK(dims > 0),
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Searchable facts of one index generation. Filter columns are indexed so
/// filters apply inside the ranking query, before `LIMIT`.
const SEARCH_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS facts (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    fact_type TEXT NOT NULL,
    quality TEXT NOT NULL,
    provenance TEXT NOT NULL,
    created_at TEXT NOT NULL,
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_facts_type ON facts(fact_type);
CREATE INDEX IF NOT EXISTS idx_facts_quality ON facts(quality);
CREATE INDEX IF NOT EXISTS idx_facts_provenance ON facts(provenance);

-- Full-text search (BM25), rowid = facts.seq
CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
    body,
    tokenize = 'porter unicode61'
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

/// Initialize the search tables of an index generation.
pub fn init_search_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SEARCH_SQL)
}
