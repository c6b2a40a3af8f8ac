use std::cmp::Ordering;

use mnemo_common::{Error, Result};
use rusqlite::params;

use crate::pool::{Database, map_sql_error};

/// Persisted embeddings and brute-force similarity search.
///
/// Vectors are stored as concatenated little-endian `f32`; length is implied
/// by the blob size. A full scan over one user's embeddings is the intended
/// design at the expected scale.
#[derive(Clone)]
pub struct VectorStore {
    db: Database,
}

impl VectorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the embedding for a memory.
    pub async fn upsert(&self, memory_id: i64, embedding: Vec<f32>) -> Result<()> {
        let blob = embedding_to_blob(&embedding);
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO memory_embeddings (memory_id, embedding)
                     VALUES (?1, ?2)
                     ON CONFLICT(memory_id) DO UPDATE SET
                        embedding = excluded.embedding,
                        updated_at = datetime('now')",
                    params![memory_id, blob],
                )
                .map_err(map_sql_error("upsert embedding"))?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, memory_id: i64) -> Result<Option<Vec<f32>>> {
        self.db
            .with_conn(move |conn| {
                let blob: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT embedding FROM memory_embeddings WHERE memory_id = ?1",
                        params![memory_id],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(map_sql_error("select embedding")(other)),
                    })?;
                blob.map(|b| blob_to_embedding(&b)).transpose()
            })
            .await
    }

    pub async fn delete(&self, memory_id: i64) -> Result<()> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM memory_embeddings WHERE memory_id = ?1",
                    params![memory_id],
                )
                .map_err(map_sql_error("delete embedding"))?;
                Ok(())
            })
            .await
    }

    /// Scan all of one user's embeddings and return the most similar memory
    /// ids. Results are `(memory_id, score)` with score ≥ `min_similarity`,
    /// sorted by score descending; ties break to the newer memory id so
    /// output is deterministic.
    pub async fn search(
        &self,
        user_id: i64,
        query: Vec<f32>,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(i64, f32)>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT e.memory_id, e.embedding
                         FROM memory_embeddings e
                         JOIN memories m ON m.memory_id = e.memory_id
                         WHERE m.user_id = ?1",
                    )
                    .map_err(map_sql_error("prepare embedding scan"))?;
                let rows = stmt
                    .query_map(params![user_id], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })
                    .map_err(map_sql_error("query embeddings"))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(map_sql_error("collect embeddings"))?;

                let mut scored: Vec<(i64, f32)> = Vec::new();
                for (memory_id, blob) in rows {
                    let embedding = blob_to_embedding(&blob)?;
                    let score = cosine_similarity(&query, &embedding);
                    if score >= min_similarity {
                        scored.push((memory_id, score));
                    }
                }

                scored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| b.0.cmp(&a.0))
                });
                scored.truncate(limit);
                Ok(scored)
            })
            .await
    }
}

pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend(value.to_le_bytes());
    }
    bytes
}

pub fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::Integrity(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}

/// Cosine similarity in [-1, 1]; zero when either vector has zero norm or
/// the dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
