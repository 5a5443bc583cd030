//! Retrieval Index (RAG)
//!
//! Similarity search over previously indexed document chunks. Chunks are
//! immutable once indexed and only superseded by re-indexing the same
//! document. Embeddings come from an HTTP service behind the `Embedder`
//! seam; ranking is brute-force cosine over a user's chunks, which is the
//! right tool at personal-assistant scale.

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use rusqlite::{params, Connection};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Embedding seam. The embedding model itself is out of scope; only this
/// invocation contract is.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Ollama-compatible HTTP embedder with an LRU query cache.
pub struct HttpEmbedder {
    url: String,
    model: String,
    client: reqwest::Client,
    cache: Cache<String, Vec<f32>>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        // 1000 entries, 1 hour TTL
        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Self {
            url: url.trim_end_matches('/').to_string(),
            model: std::env::var("CONCIERGE_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            client,
            cache,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = text.trim().to_string();
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.url))
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .context("embedding request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("embedding service returned {}", response.status());
        }

        let body: EmbeddingResponse = response.json().await.context("invalid embedding response")?;
        self.cache.insert(key, body.embedding.clone()).await;
        Ok(body.embedding)
    }
}

/// An indexed chunk returned from a query.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub doc_id: String,
    pub seq: usize,
    pub content: String,
    pub created_at: i64,
    pub score: f32,
}

/// Similarity index over per-user document chunks.
pub struct RetrievalIndex {
    conn: Mutex<Connection>,
}

impl RetrievalIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_user ON chunks(user_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(user_id, doc_id);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn chunk_id(user_id: &str, doc_id: &str, seq: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(doc_id.as_bytes());
        hasher.update(seq.to_le_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    /// Chunk, embed and index a document, superseding any previous index
    /// of the same doc_id. Returns the number of chunks stored.
    pub async fn index_document(
        &self,
        embedder: &dyn Embedder,
        user_id: &str,
        doc_id: &str,
        text: &str,
    ) -> Result<usize> {
        let chunks = split_into_chunks(text, 800);
        let now = chrono::Utc::now().timestamp();

        let mut embedded = Vec::with_capacity(chunks.len());
        for (seq, content) in chunks.iter().enumerate() {
            let vector = embedder.embed(content).await?;
            embedded.push((seq, content, embedding_to_bytes(&vector)));
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM chunks WHERE user_id = ?1 AND doc_id = ?2",
            params![user_id, doc_id],
        )?;
        for (seq, content, bytes) in &embedded {
            tx.execute(
                "INSERT INTO chunks (id, user_id, doc_id, seq, content, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Self::chunk_id(user_id, doc_id, *seq),
                    user_id,
                    doc_id,
                    *seq as i64,
                    content,
                    bytes,
                    now
                ],
            )?;
        }
        tx.commit()?;

        info!(user_id, doc_id, chunks = embedded.len(), "document indexed");
        Ok(embedded.len())
    }

    /// Top-k chunks for a query, ranked by cosine similarity descending;
    /// ties break toward the most recently indexed chunk.
    pub async fn query(
        &self,
        embedder: &dyn Embedder,
        user_id: &str,
        text: &str,
        k: usize,
    ) -> Result<Vec<DocumentChunk>> {
        let query_vec = embedder.embed(text).await?;

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT doc_id, seq, content, embedding, created_at
             FROM chunks WHERE user_id = ?1",
        )?;

        let mut scored: Vec<DocumentChunk> = stmt
            .query_map(params![user_id], |row| {
                let bytes: Vec<u8> = row.get(3)?;
                Ok(DocumentChunk {
                    doc_id: row.get(0)?,
                    seq: row.get::<_, i64>(1)? as usize,
                    content: row.get(2)?,
                    created_at: row.get(4)?,
                    score: cosine_similarity(&query_vec, &embedding_from_bytes(&bytes)),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });
        scored.truncate(k);

        debug!(user_id, k, returned = scored.len(), "retrieval query");
        Ok(scored)
    }

    /// Total chunks indexed for a user.
    pub fn chunk_count(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// Split text into chunks of at most `max_chars`, breaking on word
/// boundaries.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + word.len() + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic test embedder: a fixed axis per known keyword.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let lower = text.to_lowercase();
            Ok(vec![
                if lower.contains("rust") { 1.0 } else { 0.0 },
                if lower.contains("coffee") { 1.0 } else { 0.0 },
                if lower.contains("weather") { 1.0 } else { 0.0 },
                0.1,
            ])
        }
    }

    #[test]
    fn test_split_into_chunks_respects_limit() {
        let text = "alpha beta gamma delta epsilon";
        let chunks = split_into_chunks(text, 12);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 12);
        }
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_embedding_byte_codec() {
        let vector = vec![0.5f32, -1.25, 3.0];
        assert_eq!(embedding_from_bytes(&embedding_to_bytes(&vector)), vector);
    }

    #[tokio::test]
    async fn test_index_and_query_ranking() {
        let index = RetrievalIndex::open_in_memory().unwrap();
        let embedder = KeywordEmbedder;

        index
            .index_document(&embedder, "u1", "doc1", "Rust notes about ownership")
            .await
            .unwrap();
        index
            .index_document(&embedder, "u1", "doc2", "Coffee brewing guide")
            .await
            .unwrap();

        let results = index.query(&embedder, "u1", "tell me about rust", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].doc_id, "doc1");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_reindex_supersedes_old_chunks() {
        let index = RetrievalIndex::open_in_memory().unwrap();
        let embedder = KeywordEmbedder;

        index
            .index_document(&embedder, "u1", "doc1", "first version")
            .await
            .unwrap();
        index
            .index_document(&embedder, "u1", "doc1", "second version entirely")
            .await
            .unwrap();

        assert_eq!(index.chunk_count("u1").unwrap(), 1);
        let results = index.query(&embedder, "u1", "anything", 5).await.unwrap();
        assert!(results[0].content.contains("second"));
    }

    #[tokio::test]
    async fn test_query_scoped_to_user() {
        let index = RetrievalIndex::open_in_memory().unwrap();
        let embedder = KeywordEmbedder;

        index
            .index_document(&embedder, "u1", "doc1", "rust content")
            .await
            .unwrap();

        let results = index.query(&embedder, "u2", "rust", 5).await.unwrap();
        assert!(results.is_empty());
    }
}
