//! Persisted summary chunks + embeddings in a single SQLite file.
//!
//! Two logical tables: `summaries(id, url, title, text, created_at)` and
//! `embeddings(summary_id, dim, vec_blob)`. `vec_blob` is little-endian
//! IEEE-754 f32, `dim × 4` bytes. A `cosine_sim(q_blob, v_blob, dim)` scalar
//! function is registered at connection time; when registration fails (or the
//! store is empty) top-k falls back to an in-memory scan. Cosine similarity
//! always accumulates in f64 so near-ties order stably.
//!
//! Writes must be serialized: the orchestrator guarantees the ASSEMBLE stage
//! is the sole writer. Concurrent readers are fine.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use tracing::{debug, warn};

/// One persisted chunk. Chunks are immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub id: String,
    pub source_url: String,
    pub title: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

pub struct VectorStore {
    conn: Mutex<Connection>,
    cosine_registered: bool,
}

impl VectorStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open vector store at {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS summaries (
                 id         TEXT PRIMARY KEY,
                 url        TEXT NOT NULL,
                 title      TEXT NOT NULL,
                 text       TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS embeddings (
                 summary_id TEXT PRIMARY KEY REFERENCES summaries(id),
                 dim        INTEGER NOT NULL,
                 vec_blob   BLOB NOT NULL
             );",
        )?;

        let cosine_registered = match conn.create_scalar_function(
            "cosine_sim",
            3,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let q: Vec<u8> = ctx.get(0)?;
                let v: Vec<u8> = ctx.get(1)?;
                let dim: i64 = ctx.get(2)?;
                Ok(cosine_blobs(&q, &v, dim.max(0) as usize))
            },
        ) {
            Ok(()) => true,
            Err(e) => {
                warn!("cosine_sim registration failed ({}), using in-memory top-k", e);
                false
            }
        };

        Ok(Self {
            conn: Mutex::new(conn),
            cosine_registered,
        })
    }

    /// Insert-or-replace chunks. Embedding dimensions must agree with
    /// whatever the store already holds.
    pub fn upsert(&self, chunks: &[StoredChunk]) -> Result<()> {
        let mut conn = self.conn.lock().expect("vector store lock poisoned");

        let existing_dim: Option<usize> = conn
            .query_row("SELECT dim FROM embeddings LIMIT 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|d| d as usize)
            .ok();

        let mut dim = existing_dim;
        for chunk in chunks {
            if let Some(embedding) = &chunk.embedding {
                match dim {
                    Some(d) if d != embedding.len() => anyhow::bail!(
                        "embedding dimension mismatch: store holds {}, chunk {} has {}",
                        d,
                        chunk.id,
                        embedding.len()
                    ),
                    None => dim = Some(embedding.len()),
                    _ => {}
                }
            }
        }

        let tx = conn.transaction()?;
        {
            let now = Utc::now().to_rfc3339();
            let mut insert_summary = tx.prepare(
                "INSERT OR REPLACE INTO summaries (id, url, title, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut insert_embedding = tx.prepare(
                "INSERT OR REPLACE INTO embeddings (summary_id, dim, vec_blob)
                 VALUES (?1, ?2, ?3)",
            )?;

            for chunk in chunks {
                insert_summary.execute(rusqlite::params![
                    chunk.id,
                    chunk.source_url,
                    chunk.title,
                    chunk.text,
                    now
                ])?;
                if let Some(embedding) = &chunk.embedding {
                    insert_embedding.execute(rusqlite::params![
                        chunk.id,
                        embedding.len() as i64,
                        encode_blob(embedding)
                    ])?;
                }
            }
        }
        tx.commit()?;

        debug!(chunks = chunks.len(), "vector store upsert");
        Ok(())
    }

    /// Top-k chunks by cosine similarity to `query_embedding`, descending,
    /// size `min(k, chunks with embeddings)`. Ties keep insertion order.
    pub fn top_k(&self, query_embedding: &[f32], k: usize) -> Result<Vec<(StoredChunk, f32)>> {
        if k == 0 || query_embedding.is_empty() {
            return Ok(Vec::new());
        }

        if self.cosine_registered {
            self.top_k_indexed(query_embedding, k)
        } else {
            self.top_k_fallback(query_embedding, k)
        }
    }

    /// Indexed path: the backing engine ranks via the registered function.
    fn top_k_indexed(&self, query_embedding: &[f32], k: usize) -> Result<Vec<(StoredChunk, f32)>> {
        let conn = self.conn.lock().expect("vector store lock poisoned");
        let q_blob = encode_blob(query_embedding);

        let mut stmt = conn.prepare(
            "SELECT s.id, s.url, s.title, s.text, e.vec_blob,
                    cosine_sim(?1, e.vec_blob, e.dim) AS score
             FROM embeddings e
             JOIN summaries s ON s.id = e.summary_id
             ORDER BY score DESC, s.rowid ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(rusqlite::params![q_blob, k as i64], |row| {
            let blob: Vec<u8> = row.get(4)?;
            Ok((
                StoredChunk {
                    id: row.get(0)?,
                    source_url: row.get(1)?,
                    title: row.get(2)?,
                    text: row.get(3)?,
                    embedding: Some(decode_blob(&blob)),
                },
                row.get::<_, f64>(5)? as f32,
            ))
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Fallback path: pull every embedded chunk and rank in memory.
    fn top_k_fallback(&self, query_embedding: &[f32], k: usize) -> Result<Vec<(StoredChunk, f32)>> {
        let conn = self.conn.lock().expect("vector store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT s.id, s.url, s.title, s.text, e.vec_blob
             FROM embeddings e
             JOIN summaries s ON s.id = e.summary_id
             ORDER BY s.rowid ASC",
        )?;

        let chunks = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(4)?;
                Ok(StoredChunk {
                    id: row.get(0)?,
                    source_url: row.get(1)?,
                    title: row.get(2)?,
                    text: row.get(3)?,
                    embedding: Some(decode_blob(&blob)),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut scored: Vec<(StoredChunk, f32)> = chunks
            .into_iter()
            .map(|c| {
                let score = c
                    .embedding
                    .as_deref()
                    .map(|e| cosine_f64(query_embedding, e) as f32)
                    .unwrap_or(0.0);
                (c, score)
            })
            .collect();

        // Stable sort: equal scores keep insertion (rowid) order.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn embedded_count(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("vector store lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Blob codec + cosine math
// ─────────────────────────────────────────────────────────────────────────────

pub fn encode_blob(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn cosine_blobs(q_blob: &[u8], v_blob: &[u8], dim: usize) -> f64 {
    let want = dim * 4;
    if q_blob.len() < want || v_blob.len() < want {
        return 0.0;
    }
    let q = decode_blob(&q_blob[..want]);
    let v = decode_blob(&v_blob[..want]);
    cosine_f64(&q, &v)
}

/// Cosine similarity with f64 accumulation over f32-stored vectors, so
/// precision drift cannot reorder near-ties.
pub fn cosine_f64(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut mag_a = 0.0f64;
    let mut mag_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a.sqrt() * mag_b.sqrt())).clamp(-1.0, 1.0)
}
