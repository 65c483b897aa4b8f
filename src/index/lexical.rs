//! Lexical sub-index: FTS5 BM25 ranking over fact text.

use rusqlite::{params, Connection};

use super::SearchFilter;
use crate::error::KbResult;

/// Index the text of the fact stored at `seq` in `facts`.
pub fn insert(conn: &Connection, seq: i64, text: &str) -> KbResult<()> {
    conn.execute(
        "INSERT INTO facts_fts (rowid, body) VALUES (?1, ?2)",
        params![seq, text],
    )?;
    Ok(())
}

/// FTS5 BM25 keyword search, best first.
///
/// Returns (id, score) pairs. FTS5 rank is negative (more negative = better),
/// so it is negated. Filters are part of the `WHERE` clause and apply before
/// `LIMIT`.
pub fn search(
    conn: &Connection,
    query: &str,
    filter: &SearchFilter,
    limit: usize,
) -> KbResult<Vec<(String, f64)>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT f.id, facts_fts.rank FROM facts_fts \
         JOIN facts f ON f.seq = facts_fts.rowid \
         WHERE facts_fts MATCH ?1 \
         AND (?2 IS NULL OR f.fact_type = ?2) \
         AND (?3 IS NULL OR f.quality = ?3) \
         AND (?4 IS NULL OR f.provenance = ?4) \
         ORDER BY facts_fts.rank, f.id LIMIT ?5",
    )?;
    let results = stmt
        .query_map(
            params![
                escaped,
                filter.fact_type,
                filter.quality,
                filter.provenance,
                limit as i64
            ],
            |row| Ok((row.get::<_, String>(0)?, -row.get::<_, f64>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Splits on the same boundaries as the `unicode61` tokenizer, quotes each
/// word and joins them with `OR`, so any shared term makes a candidate and
/// BM25 orders them.
pub fn escape_fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{word}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}
