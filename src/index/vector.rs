//! Vector sub-index: cosine similarity scored by sqlite-vec.

use rusqlite::{params, Connection};

use super::SearchFilter;
use crate::db::embedding_to_bytes;
use crate::error::KbResult;

/// Nearest facts with similarity above `min_similarity`, best first.
///
/// The scan is exact: every fact passing `filter` is scored, so filtered-out
/// facts never take one of the `limit` slots. Facts with a zero vector have no
/// defined distance and never match.
pub fn search(
    conn: &Connection,
    query: &[f32],
    filter: &SearchFilter,
    limit: usize,
    min_similarity: f32,
) -> KbResult<Vec<(String, f32)>> {
    if limit == 0 || query.iter().all(|x| *x == 0.0) {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT id, distance FROM ( \
             SELECT f.id AS id, \
             CASE WHEN length(f.embedding) = length(?1) \
             THEN vec_distance_cosine(f.embedding, ?1) END AS distance \
             FROM facts f \
             WHERE (?2 IS NULL OR f.fact_type = ?2) \
             AND (?3 IS NULL OR f.quality = ?3) \
             AND (?4 IS NULL OR f.provenance = ?4) \
         ) WHERE distance < ?5 ORDER BY distance, id LIMIT ?6",
    )?;
    let max_distance = 1.0 - f64::from(min_similarity);
    let results = stmt
        .query_map(
            params![
                embedding_to_bytes(query),
                filter.fact_type,
                filter.quality,
                filter.provenance,
                max_distance,
                limit as i64
            ],
            |row| {
                let distance: f64 = row.get(1)?;
                Ok((row.get::<_, String>(0)?, (1.0 - distance) as f32))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_search_database;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    fn seed(conn: &Connection, rows: &[(&str, Vec<f32>)]) {
        for (id, vector) in rows {
            conn.execute(
                "INSERT INTO facts (id, fact_type, quality, provenance, created_at, embedding) \
                 VALUES (?1, 'note', 'medium', '', '', ?2)",
                params![id, embedding_to_bytes(vector)],
            )
            .unwrap();
        }
    }

    #[test]
    fn nearest_first_and_threshold_applies() {
        let conn = open_search_database().unwrap();
        seed(
            &conn,
            &[
                ("x", unit(4, 0)),
                ("y", vec![0.6, 0.8, 0.0, 0.0]),
                ("z", unit(4, 3)),
            ],
        );

        let results = search(&conn, &unit(4, 0), &SearchFilter::default(), 10, 0.1).unwrap();
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
        assert!((results[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_dimensions_are_skipped() {
        let conn = open_search_database().unwrap();
        seed(&conn, &[("short", vec![1.0, 0.0])]);
        assert!(search(&conn, &unit(4, 0), &SearchFilter::default(), 10, 0.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn filter_applies_before_limit() {
        let conn = open_search_database().unwrap();
        seed(&conn, &[("near", unit(4, 0)), ("far", vec![0.6, 0.8, 0.0, 0.0])]);
        conn.execute("UPDATE facts SET fact_type = 'lesson' WHERE id = 'far'", [])
            .unwrap();

        let filter = SearchFilter {
            fact_type: Some("lesson".into()),
            ..SearchFilter::default()
        };
        let results = search(&conn, &unit(4, 0), &filter, 1, 0.0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "far");
    }
}
