//! Document indexing pipeline: clean → chunk → embed → dual-index.
//!
//! The vector write is authoritative; a failed BM25 append degrades
//! keyword search but never fails the document. Every phase is timed and
//! the result is a structured outcome rather than an error, so job
//! handlers can report failures as data.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canonical::{canonicalize, domain_of};
use crate::chunker::clean_markdown;
use crate::document::{Document, DocumentMeta};
use crate::error::AppError;
use crate::services::ServicePool;
use crate::vector::Point;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOutcome {
    pub success: bool,
    pub url: String,
    pub chunks_indexed: usize,
    pub total_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexOutcome {
    fn failure(url: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: url.to_string(),
            chunks_indexed: 0,
            total_tokens: 0,
            error: Some(error.into()),
        }
    }
}

/// Run the full ingestion pipeline for one document.
pub async fn index_document(pool: &ServicePool, doc: Document) -> IndexOutcome {
    let started = Instant::now();
    let url = doc.url.clone();

    // Phase 1: clean. The markdown is the authoritative text.
    let phase = Instant::now();
    let cleaned = clean_markdown(&doc.markdown);
    if cleaned.is_empty() {
        return IndexOutcome::failure(&url, "no content after cleaning");
    }
    let clean_ms = phase.elapsed().as_millis();

    // Phase 2: identity metadata.
    let canonical_url = match canonicalize(&url) {
        Ok(canonical) => canonical,
        Err(e) => return IndexOutcome::failure(&url, e.to_string()),
    };
    let domain = domain_of(&url).unwrap_or_default();
    let meta = DocumentMeta {
        url: url.clone(),
        canonical_url,
        domain,
        title: doc.title.clone(),
        description: doc.description.clone(),
        language: doc.language.clone(),
        country: doc.country.clone(),
        is_mobile: doc.is_mobile,
    };

    // Phase 3: chunk.
    let phase = Instant::now();
    let chunks = pool.chunker.chunk(&cleaned, &meta);
    if chunks.is_empty() {
        return IndexOutcome::failure(&url, "no chunks generated");
    }
    let chunk_ms = phase.elapsed().as_millis();
    let total_tokens: usize = chunks.iter().map(|c| c.token_count).sum();

    // Phase 4: embed.
    let phase = Instant::now();
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = match pool.embedder.embed_batch(&texts).await {
        Ok(vectors) => vectors,
        Err(AppError::DimensionMismatch { .. }) => {
            return IndexOutcome::failure(&url, "dimension mismatch");
        }
        Err(e) => return IndexOutcome::failure(&url, e.to_string()),
    };
    if vectors.len() != chunks.len() {
        return IndexOutcome::failure(&url, "embedder returned wrong batch size");
    }
    if vectors.iter().any(|v| v.len() != pool.vector_dim) {
        return IndexOutcome::failure(&url, "dimension mismatch");
    }
    let embed_ms = phase.elapsed().as_millis();

    // Phase 5: vector upsert. Chunks get fresh ids; search-time dedup by
    // canonical URL absorbs re-index duplicates.
    let phase = Instant::now();
    let points: Vec<Point> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| Point {
            id: Uuid::new_v4(),
            vector,
            payload: chunk.meta.to_payload(&chunk.text, chunk.chunk_index, chunk.token_count),
        })
        .collect();
    if let Err(e) = pool.vector.upsert(points).await {
        return IndexOutcome::failure(&url, format!("vector upsert failed: {}", e));
    }
    let upsert_ms = phase.elapsed().as_millis();

    // Phase 6: BM25 append. Keyword search degrading is preferable to
    // dropping the document, so failure here only warns.
    let phase = Instant::now();
    let bm25 = pool.bm25.clone();
    let bm25_meta = meta.clone();
    let bm25_text = cleaned.clone();
    let bm25_result =
        tokio::task::spawn_blocking(move || bm25.index_document(&bm25_text, bm25_meta)).await;
    match bm25_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("bm25 append failed for {} (continuing): {}", url, e),
        Err(e) => warn!("bm25 append task failed for {} (continuing): {}", url, e),
    }
    let bm25_ms = phase.elapsed().as_millis();

    debug!(
        url = %url,
        clean_ms, chunk_ms, embed_ms, upsert_ms, bm25_ms,
        "pipeline phase timings"
    );
    info!(
        "indexed {} ({} chunks, {} tokens, {:?})",
        url,
        chunks.len(),
        total_tokens,
        started.elapsed()
    );

    IndexOutcome {
        success: true,
        url,
        chunks_indexed: chunks.len(),
        total_tokens,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm25::{tokenize, Bm25Engine};
    use crate::chunker::TokenChunker;
    use crate::testing::{FakeEmbedder, FakeVectorIndex};
    use crate::vector::{SearchFilter, VectorIndex};
    use std::sync::Arc;

    fn doc(url: &str, markdown: &str) -> Document {
        Document {
            url: url.to_string(),
            resolved_url: Some(url.to_string()),
            title: Some("Test".to_string()),
            description: None,
            markdown: markdown.to_string(),
            status_code: Some(200),
            language: Some("en".to_string()),
            country: None,
            is_mobile: None,
        }
    }

    fn pool_with(
        embedder: Arc<dyn crate::embedder::Embedder>,
        vector: Arc<FakeVectorIndex>,
    ) -> (ServicePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let chunker = Arc::new(TokenChunker::load(64, 8).unwrap());
        let bm25 = Arc::new(Bm25Engine::open(dir.path().join("idx.bin"), 1.5, 0.75));
        (
            ServicePool::from_parts(chunker, embedder, vector, bm25, 4, 60),
            dir,
        )
    }

    #[tokio::test]
    async fn test_happy_path_indexes_both_sides() {
        let vector = Arc::new(FakeVectorIndex::new(4));
        let (pool, _dir) = pool_with(Arc::new(FakeEmbedder::new(4)), vector.clone());

        let outcome = index_document(&pool, doc("https://example.com/a", "# Test\nHello world."))
            .await;
        assert!(outcome.success, "error: {:?}", outcome.error);
        assert!(outcome.chunks_indexed >= 1);
        assert!(outcome.total_tokens > 0);
        assert!(vector.count().await.unwrap() >= 1);
        assert_eq!(pool.bm25.count(), 1);
    }

    #[tokio::test]
    async fn test_empty_markdown_fails_clean() {
        let vector = Arc::new(FakeVectorIndex::new(4));
        let (pool, _dir) = pool_with(Arc::new(FakeEmbedder::new(4)), vector.clone());

        let outcome = index_document(&pool, doc("https://example.com/a", "  \u{0007} \n ")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("no content after cleaning"));
        assert_eq!(vector.count().await.unwrap(), 0);
        assert_eq!(pool.bm25.count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_writes() {
        let vector = Arc::new(FakeVectorIndex::new(4));
        let (pool, _dir) = pool_with(Arc::new(FakeEmbedder::new(4)), vector.clone());

        let outcome = index_document(&pool, doc("ftp://example.com/a", "some text")).await;
        assert!(!outcome.success);
        assert_eq!(vector.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_writes_nothing() {
        // Embedder produces 3-dim vectors while the pool expects 4.
        let vector = Arc::new(FakeVectorIndex::new(4));
        let (pool, _dir) = pool_with(Arc::new(FakeEmbedder::new(3)), vector.clone());

        let outcome = index_document(&pool, doc("https://example.com/a", "hello world")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("dimension mismatch"));
        assert_eq!(vector.count().await.unwrap(), 0);
        assert_eq!(pool.bm25.count(), 0);
    }

    #[tokio::test]
    async fn test_vector_failure_skips_bm25() {
        let vector = Arc::new(FakeVectorIndex::new(4));
        vector.fail_upserts();
        let (pool, _dir) = pool_with(Arc::new(FakeEmbedder::new(4)), vector.clone());

        let outcome = index_document(&pool, doc("https://example.com/a", "hello world")).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("vector upsert failed"));
        assert_eq!(pool.bm25.count(), 0);
    }

    #[tokio::test]
    async fn test_bm25_lock_timeout_still_succeeds() {
        use fs2::FileExt;

        let vector = Arc::new(FakeVectorIndex::new(4));
        let dir = tempfile::tempdir().unwrap();
        let chunker = Arc::new(TokenChunker::load(64, 8).unwrap());
        let path = dir.path().join("idx.bin");
        let mut engine = Bm25Engine::open(&path, 1.5, 0.75);
        engine.set_lock_timing_for_tests(
            std::time::Duration::from_millis(200),
            std::time::Duration::from_millis(50),
        );
        let pool = ServicePool::from_parts(
            chunker,
            Arc::new(FakeEmbedder::new(4)),
            vector.clone(),
            Arc::new(engine),
            4,
            60,
        );

        // Simulate another process holding the write lock.
        let holder = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("idx.bin.lock"))
            .unwrap();
        holder.lock_exclusive().unwrap();

        let outcome = index_document(&pool, doc("https://example.com/a", "hello world")).await;
        assert!(outcome.success, "bm25 outage must not fail indexing");
        assert!(vector.count().await.unwrap() >= 1);
        assert_eq!(
            pool.bm25
                .search(&tokenize("hello"), 5, &SearchFilter::default())
                .map(|hits| hits.len())
                .unwrap_or(0),
            0
        );
    }

    #[tokio::test]
    async fn test_payload_carries_canonical_url() {
        let vector = Arc::new(FakeVectorIndex::new(4));
        let (pool, _dir) = pool_with(Arc::new(FakeEmbedder::new(4)), vector.clone());

        let outcome = index_document(
            &pool,
            doc("https://www.Example.com/x/?utm_source=z&b=1", "hello canonical world"),
        )
        .await;
        assert!(outcome.success);
        let points = vector.points();
        assert!(!points.is_empty());
        assert_eq!(
            points[0].payload["canonical_url"],
            "https://example.com/x?b=1"
        );
    }
}
