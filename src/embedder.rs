//! Embedding adapter for a text-embeddings-inference (TEI) endpoint.
//!
//! The embedder is a remote HTTP service; this module owns the narrow
//! client for it: batched `/embed` calls with transport-only retries and
//! a boolean health probe. The service pool holds exactly one instance
//! per process.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::retry::{retry_transient, BackoffPolicy};

/// Inputs per remote call. TEI batches internally, but bounded requests
/// keep failure blast radius and payload sizes predictable.
const EMBED_BATCH_SIZE: usize = 64;

/// Request timeout for a single embed call.
const EMBED_TIMEOUT: Duration = Duration::from_secs(60);

/// Port consumed by the pipeline and the search orchestrator.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. The output has exactly one vector per
    /// input, in input order. Any empty-after-trim input fails the whole
    /// batch with `InvalidInput` before the remote call.
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;

    /// Convenience over `embed_batch` for a single text.
    async fn embed_single(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::PermanentRemote("embedder returned no vectors".to_string()))
    }

    /// Liveness probe. Never errors.
    async fn health_check(&self) -> bool;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    truncate: bool,
}

pub struct TeiEmbedder {
    base_url: String,
    vector_dim: usize,
    /// Lazily constructed so the client binds to the running scheduler
    /// rather than whichever thread built the config.
    client: OnceLock<reqwest::Client>,
}

impl TeiEmbedder {
    pub fn new(base_url: &str, vector_dim: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            vector_dim,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::Client {
        self.client.get_or_init(|| {
            reqwest::Client::builder()
                .timeout(EMBED_TIMEOUT)
                .build()
                .unwrap_or_default()
        })
    }

    async fn embed_call(&self, inputs: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url);
        let response = self
            .client()
            .post(&url)
            .json(&EmbedRequest {
                inputs,
                truncate: true,
            })
            .send()
            .await
            .map_err(|e| AppError::TransientRemote(format!("embedder unreachable: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AppError::TransientRemote(format!(
                "embedder returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::PermanentRemote(format!(
                "embedder rejected batch ({}): {}",
                status, body
            )));
        }

        response
            .json::<Vec<Vec<f32>>>()
            .await
            .map_err(|e| AppError::PermanentRemote(format!("embedder response malformed: {}", e)))
    }
}

#[async_trait]
impl Embedder for TeiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if let Some(pos) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(AppError::InvalidInput(format!(
                "embed batch input {} is empty after cleaning",
                pos
            )));
        }

        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let vectors = retry_transient("embed_batch", BackoffPolicy::default(), || {
                self.embed_call(batch)
            })
            .await?;

            if vectors.len() != batch.len() {
                return Err(AppError::PermanentRemote(format!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            for vector in &vectors {
                if vector.len() != self.vector_dim {
                    return Err(AppError::DimensionMismatch {
                        expected: self.vector_dim,
                        got: vector.len(),
                    });
                }
            }
            out.extend(vectors);
        }

        debug!("embedded {} texts", out.len());
        Ok(out)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client().get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("embedder health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_embed_batch_shape() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embed");
                then.status(200)
                    .json_body(serde_json::json!([[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]));
            })
            .await;

        let embedder = TeiEmbedder::new(&server.base_url(), 3);
        let vectors = embedder
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 3));
    }

    #[tokio::test]
    async fn test_empty_input_fails_fast_without_remote_call() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embed");
                then.status(200).json_body(serde_json::json!([]));
            })
            .await;

        let embedder = TeiEmbedder::new(&server.base_url(), 3);
        let err = embedder
            .embed_batch(&["ok".to_string(), "   ".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_permanent() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embed");
                then.status(200).json_body(serde_json::json!([[0.1, 0.2]]));
            })
            .await;

        let embedder = TeiEmbedder::new(&server.base_url(), 3);
        let err = embedder.embed_batch(&["alpha".to_string()]).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::DimensionMismatch { expected: 3, got: 2 }
        ));
    }

    #[tokio::test]
    async fn test_client_error_fails_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embed");
                then.status(413).body("payload too large");
            })
            .await;

        let embedder = TeiEmbedder::new(&server.base_url(), 3);
        let err = embedder.embed_batch(&["alpha".to_string()]).await.unwrap_err();
        assert!(matches!(err, AppError::PermanentRemote(_)));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_health_check_never_throws() {
        let embedder = TeiEmbedder::new("http://127.0.0.1:1", 3);
        assert!(!embedder.health_check().await);

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200);
            })
            .await;
        let healthy = TeiEmbedder::new(&server.base_url(), 3);
        assert!(healthy.health_check().await);
    }
}
