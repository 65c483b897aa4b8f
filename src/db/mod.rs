//! SQLite plumbing: the persisted embedding cache and the in-memory search
//! databases the index is built on.
//!
//! The cache only saves re-embedding work on daemon start. It never holds data
//! that is missing from the fact log, so deleting it is always safe.

pub mod migrations;
pub mod schema;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Once;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use sqlite_vec::sqlite3_vec_init;

use crate::error::KbResult;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open a fresh in-memory search database with sqlite-vec loaded.
pub fn open_search_database() -> KbResult<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory()?;
    schema::init_search_schema(&conn)?;
    Ok(conn)
}

pub struct VectorCache {
    conn: Connection,
}

/// Most recent full rebuild recorded in the cache.
#[derive(Debug, Clone)]
pub struct RebuildRecord {
    pub facts: u64,
    pub embedded: u64,
    pub finished_at: DateTime<Utc>,
}

impl VectorCache {
    /// Open (or create) the cache at `path`, discarding vectors produced by a
    /// different embedding model.
    pub fn open(path: impl AsRef<Path>, model_id: &str) -> KbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn, model_id)
    }

    /// Open an in-memory cache for testing.
    pub fn open_in_memory(model_id: &str) -> KbResult<Self> {
        Self::init(Connection::open_in_memory()?, model_id)
    }

    fn init(mut conn: Connection, model_id: &str) -> KbResult<Self> {
        schema::init_schema(&conn)?;
        migrations::run_migrations(&mut conn)?;

        let quick_check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if quick_check != "ok" {
            return Err(crate::error::KbError::Corrupt {
                line: 0,
                message: format!("index database failed quick_check: {quick_check}"),
            });
        }

        let cache = Self { conn };
        match migrations::get_embedding_model(&cache.conn)? {
            Some(stored) if stored == model_id => {}
            Some(stored) => {
                tracing::warn!(
                    stored = %stored,
                    configured = %model_id,
                    "embedding model changed, discarding cached vectors"
                );
                cache.clear()?;
                migrations::set_embedding_model(&cache.conn, model_id)?;
            }
            None => migrations::set_embedding_model(&cache.conn, model_id)?,
        }
        Ok(cache)
    }

    pub fn load_all(&self) -> KbResult<HashMap<String, Vec<f32>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT fact_id, dims, embedding FROM fact_vectors")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut vectors = HashMap::new();
        for row in rows {
            let (id, dims, blob) = row?;
            match bytes_to_embedding(&blob) {
                Some(v) if v.len() as i64 == dims => {
                    vectors.insert(id, v);
                }
                _ => tracing::warn!(fact_id = %id, "dropping malformed cached vector"),
            }
        }
        Ok(vectors)
    }

    pub fn put(&self, fact_id: &str, embedding: &[f32]) -> KbResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO fact_vectors (fact_id, dims, embedding, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                fact_id,
                embedding.len() as i64,
                embedding_to_bytes(embedding),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Insert many vectors in one transaction.
    pub fn put_many<'a>(
        &mut self,
        entries: impl IntoIterator<Item = (&'a str, &'a [f32])>,
    ) -> KbResult<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO fact_vectors (fact_id, dims, embedding, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (id, embedding) in entries {
                stmt.execute(params![
                    id,
                    embedding.len() as i64,
                    embedding_to_bytes(embedding),
                    now
                ])?;
                count += 1;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn clear(&self) -> KbResult<()> {
        self.conn.execute("DELETE FROM fact_vectors", [])?;
        Ok(())
    }

    pub fn count(&self) -> KbResult<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM fact_vectors", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn record_rebuild(
        &self,
        facts: usize,
        embedded: usize,
        finished_at: DateTime<Utc>,
    ) -> KbResult<()> {
        self.conn.execute(
            "INSERT INTO rebuild_log (facts, embedded, finished_at) VALUES (?1, ?2, ?3)",
            params![facts as i64, embedded as i64, finished_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn last_rebuild(&self) -> KbResult<Option<RebuildRecord>> {
        let result = self.conn.query_row(
            "SELECT facts, embedded, finished_at FROM rebuild_log ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                let finished_at: String = row.get(2)?;
                let finished_at = DateTime::parse_from_rfc3339(&finished_at)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?
                    .with_timezone(&Utc);
                Ok(RebuildRecord {
                    facts: row.get::<_, i64>(0)? as u64,
                    embedded: row.get::<_, i64>(1)? as u64,
                    finished_at,
                })
            },
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Encode an embedding as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes; `None` if the length is not a multiple of 4.
pub fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
