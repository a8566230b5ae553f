//! Process-wide pool of the expensive shared collaborators.
//!
//! The tokenizer model load dominates construction cost, so the pool is
//! built exactly once per process and shared by request handlers and job
//! workers alike. Tests assemble a pool from in-memory fakes via
//! `from_parts`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::bm25::Bm25Engine;
use crate::chunker::TokenChunker;
use crate::config::AppConfig;
use crate::embedder::{Embedder, TeiEmbedder};
use crate::error::AppResult;
use crate::vector::{QdrantHttpIndex, VectorIndex};

static GLOBAL_POOL: OnceCell<Arc<ServicePool>> = OnceCell::const_new();

pub struct ServicePool {
    pub chunker: Arc<TokenChunker>,
    pub embedder: Arc<dyn Embedder>,
    pub vector: Arc<dyn VectorIndex>,
    pub bm25: Arc<Bm25Engine>,
    pub vector_dim: usize,
    pub rrf_k: u32,
    closed: AtomicBool,
}

impl ServicePool {
    /// Construct production collaborators from config. The tokenizer
    /// load runs on the blocking pool so a cold start does not stall the
    /// runtime.
    pub async fn init(config: &AppConfig) -> AppResult<Self> {
        let started = std::time::Instant::now();

        let max_tokens = config.max_chunk_tokens;
        let overlap = config.chunk_overlap_tokens;
        let chunker = tokio::task::spawn_blocking(move || TokenChunker::load(max_tokens, overlap))
            .await
            .map_err(|e| crate::error::AppError::Internal(anyhow::anyhow!(e)))??;

        let embedder = TeiEmbedder::new(&config.tei_url, config.vector_dim);
        let vector = QdrantHttpIndex::new(
            &config.qdrant_url,
            &config.qdrant_collection,
            config.vector_dim,
        );
        let bm25 = Bm25Engine::open(&config.bm25_index_path, config.bm25_k1, config.bm25_b);

        info!(
            "service pool initialized in {:?} (dim={}, bm25_path={})",
            started.elapsed(),
            config.vector_dim,
            config.bm25_index_path
        );

        Ok(Self {
            chunker: Arc::new(chunker),
            embedder: Arc::new(embedder),
            vector: Arc::new(vector),
            bm25: Arc::new(bm25),
            vector_dim: config.vector_dim,
            rrf_k: config.rrf_k,
            closed: AtomicBool::new(false),
        })
    }

    /// Assemble a pool from pre-built collaborators. Tests use this to
    /// substitute in-memory doubles for every adapter.
    pub fn from_parts(
        chunker: Arc<TokenChunker>,
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorIndex>,
        bm25: Arc<Bm25Engine>,
        vector_dim: usize,
        rrf_k: u32,
    ) -> Self {
        Self {
            chunker,
            embedder,
            vector,
            bm25,
            vector_dim,
            rrf_k,
            closed: AtomicBool::new(false),
        }
    }

    /// The process-wide pool. The first caller pays construction; every
    /// concurrent and subsequent caller observes the finished instance.
    pub async fn global(config: &AppConfig) -> AppResult<Arc<ServicePool>> {
        GLOBAL_POOL
            .get_or_try_init(|| async {
                let pool = ServicePool::init(config).await?;
                Ok(Arc::new(pool))
            })
            .await
            .cloned()
    }

    /// Release adapter resources. Idempotent; transport clients drop
    /// their connection pools when the last Arc goes away.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("service pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
