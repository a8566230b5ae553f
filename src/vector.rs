//! Vector index adapter for Qdrant's REST API.
//!
//! The core only needs four operations (ensure/upsert/search/count) plus
//! a health probe, so the adapter speaks plain HTTP rather than pulling
//! in the full client stack. One collection, cosine distance, fixed
//! vector dimension.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::retry::{retry_transient, BackoffPolicy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A chunk ready for upsert: fresh opaque id, embedding, JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// One search result from the vector side.
#[derive(Debug, Clone, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}

/// AND of equality predicates over the fixed metadata key set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default, alias = "isMobile")]
    pub is_mobile: Option<bool>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.domain.is_none()
            && self.language.is_none()
            && self.country.is_none()
            && self.is_mobile.is_none()
    }

    /// Whether a payload's metadata satisfies every set predicate.
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        if let Some(domain) = &self.domain {
            if payload.get("domain").and_then(|v| v.as_str()) != Some(domain.as_str()) {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if payload.get("language").and_then(|v| v.as_str()) != Some(language.as_str()) {
                return false;
            }
        }
        if let Some(country) = &self.country {
            if payload.get("country").and_then(|v| v.as_str()) != Some(country.as_str()) {
                return false;
            }
        }
        if let Some(is_mobile) = self.is_mobile {
            if payload.get("is_mobile").and_then(|v| v.as_bool()) != Some(is_mobile) {
                return false;
            }
        }
        true
    }

    /// Same predicate over typed document metadata, used by the BM25
    /// side so both backends filter identically before fusion.
    pub fn matches_meta(&self, meta: &crate::document::DocumentMeta) -> bool {
        if let Some(domain) = &self.domain {
            if &meta.domain != domain {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if meta.language.as_deref() != Some(language.as_str()) {
                return false;
            }
        }
        if let Some(country) = &self.country {
            if meta.country.as_deref() != Some(country.as_str()) {
                return false;
            }
        }
        if let Some(is_mobile) = self.is_mobile {
            if meta.is_mobile != Some(is_mobile) {
                return false;
            }
        }
        true
    }

    fn to_qdrant(&self) -> Option<serde_json::Value> {
        let mut must = Vec::new();
        if let Some(domain) = &self.domain {
            must.push(serde_json::json!({"key": "domain", "match": {"value": domain}}));
        }
        if let Some(language) = &self.language {
            must.push(serde_json::json!({"key": "language", "match": {"value": language}}));
        }
        if let Some(country) = &self.country {
            must.push(serde_json::json!({"key": "country", "match": {"value": country}}));
        }
        if let Some(is_mobile) = self.is_mobile {
            must.push(serde_json::json!({"key": "is_mobile", "match": {"value": is_mobile}}));
        }
        if must.is_empty() {
            None
        } else {
            Some(serde_json::json!({"must": must}))
        }
    }
}

/// Port consumed by the pipeline and the search orchestrator.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if missing. Idempotent.
    async fn ensure_collection(&self) -> AppResult<()>;

    /// Write all points in one call; the adapter treats the call as
    /// all-or-nothing.
    async fn upsert(&self, points: Vec<Point>) -> AppResult<()>;

    /// Up to `limit` hits ordered by descending score.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> AppResult<Vec<VectorHit>>;

    /// Total points in the collection.
    async fn count(&self) -> AppResult<u64>;

    /// Liveness probe. Never errors.
    async fn health_check(&self) -> bool;
}

pub struct QdrantHttpIndex {
    base_url: String,
    collection: String,
    vector_dim: usize,
    client: OnceLock<reqwest::Client>,
}

impl QdrantHttpIndex {
    pub fn new(base_url: &str, collection: &str, vector_dim: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            vector_dim,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::Client {
        self.client.get_or_init(|| {
            reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default()
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> AppResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| AppError::TransientRemote(format!("qdrant unreachable: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AppError::TransientRemote(format!("qdrant returned {}", status)));
        }
        if status.as_u16() == 404 {
            return Err(AppError::NotFound(format!(
                "collection {:?} missing",
                self.collection
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::PermanentRemote(format!(
                "qdrant rejected request ({}): {}",
                status, body
            )));
        }
        Ok(response)
    }

    async fn search_call(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> AppResult<Vec<VectorHit>> {
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(qdrant_filter) = filter.to_qdrant() {
            body["filter"] = qdrant_filter;
        }

        let url = format!("{}/points/search", self.collection_url());
        let response = self.send(self.client().post(&url).json(&body)).await?;

        #[derive(Deserialize)]
        struct SearchResponse {
            result: Vec<RawHit>,
        }
        #[derive(Deserialize)]
        struct RawHit {
            id: serde_json::Value,
            score: f32,
            #[serde(default)]
            payload: serde_json::Value,
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::PermanentRemote(format!("qdrant response malformed: {}", e)))?;

        Ok(parsed
            .result
            .into_iter()
            .map(|hit| VectorHit {
                // Qdrant ids are either integers or uuid strings.
                id: match hit.id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                },
                score: hit.score,
                payload: hit.payload,
            })
            .collect())
    }
}

#[async_trait]
impl VectorIndex for QdrantHttpIndex {
    async fn ensure_collection(&self) -> AppResult<()> {
        let exists = self
            .client()
            .get(self.collection_url())
            .send()
            .await
            .map_err(|e| AppError::TransientRemote(format!("qdrant unreachable: {}", e)))?;

        if exists.status().is_success() {
            return Ok(());
        }
        if exists.status().as_u16() != 404 {
            return Err(AppError::PermanentRemote(format!(
                "unexpected status {} probing collection",
                exists.status()
            )));
        }

        info!(
            "creating qdrant collection {:?} (dim={}, distance=Cosine)",
            self.collection, self.vector_dim
        );
        let body = serde_json::json!({
            "vectors": {"size": self.vector_dim, "distance": "Cosine"}
        });
        self.send(self.client().put(self.collection_url()).json(&body))
            .await?;
        Ok(())
    }

    async fn upsert(&self, points: Vec<Point>) -> AppResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        for point in &points {
            if point.vector.len() != self.vector_dim {
                return Err(AppError::DimensionMismatch {
                    expected: self.vector_dim,
                    got: point.vector.len(),
                });
            }
        }

        let count = points.len();
        let url = format!("{}/points?wait=true", self.collection_url());
        let body = serde_json::json!({ "points": points });
        retry_transient("qdrant_upsert", BackoffPolicy::default(), || {
            self.send(self.client().put(&url).json(&body))
        })
        .await?;
        debug!("upserted {} points", count);
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> AppResult<Vec<VectorHit>> {
        if vector.len() != self.vector_dim {
            return Err(AppError::DimensionMismatch {
                expected: self.vector_dim,
                got: vector.len(),
            });
        }
        match self.search_call(vector, limit, filter).await {
            // A missing collection is recoverable: create it and rerun
            // once against the (empty) index.
            Err(AppError::NotFound(_)) => {
                warn!("collection missing at search time, creating");
                self.ensure_collection().await?;
                self.search_call(vector, limit, filter).await
            }
            other => other,
        }
    }

    async fn count(&self) -> AppResult<u64> {
        let response = self.send(self.client().get(self.collection_url())).await?;

        #[derive(Deserialize)]
        struct CollectionInfo {
            result: CollectionResult,
        }
        #[derive(Deserialize)]
        struct CollectionResult {
            #[serde(default)]
            points_count: Option<u64>,
        }

        let parsed: CollectionInfo = response
            .json()
            .await
            .map_err(|e| AppError::PermanentRemote(format!("qdrant response malformed: {}", e)))?;
        Ok(parsed.result.points_count.unwrap_or(0))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client().get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("qdrant health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_filter_matches_payload() {
        let filter = SearchFilter {
            domain: Some("example.com".to_string()),
            language: Some("en".to_string()),
            ..Default::default()
        };
        let matching = serde_json::json!({"domain": "example.com", "language": "en"});
        let wrong_domain = serde_json::json!({"domain": "other.com", "language": "en"});
        let missing_key = serde_json::json!({"domain": "example.com"});
        assert!(filter.matches(&matching));
        assert!(!filter.matches(&wrong_domain));
        assert!(!filter.matches(&missing_key));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = SearchFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&serde_json::json!({})));
        assert!(filter.to_qdrant().is_none());
    }

    #[test]
    fn test_qdrant_filter_shape() {
        let filter = SearchFilter {
            domain: Some("example.com".to_string()),
            is_mobile: Some(true),
            ..Default::default()
        };
        let body = filter.to_qdrant().unwrap();
        let must = body["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["key"], "domain");
        assert_eq!(must[1]["key"], "is_mobile");
    }

    #[tokio::test]
    async fn test_ensure_collection_idempotent() {
        let server = MockServer::start_async().await;
        let probe = server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/docs");
                then.status(200).json_body(serde_json::json!({"result": {}}));
            })
            .await;

        let index = QdrantHttpIndex::new(&server.base_url(), "docs", 3);
        index.ensure_collection().await.unwrap();
        index.ensure_collection().await.unwrap();
        probe.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn test_ensure_collection_creates_when_missing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/docs");
                then.status(404);
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/docs")
                    .json_body_partial(r#"{"vectors": {"size": 3, "distance": "Cosine"}}"#);
                then.status(200).json_body(serde_json::json!({"result": true}));
            })
            .await;

        let index = QdrantHttpIndex::new(&server.base_url(), "docs", 3);
        index.ensure_collection().await.unwrap();
        create.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_upsert_rejects_bad_dimension_locally() {
        let server = MockServer::start_async().await;
        let index = QdrantHttpIndex::new(&server.base_url(), "docs", 3);
        let err = index
            .upsert(vec![Point {
                id: Uuid::new_v4(),
                vector: vec![0.1, 0.2],
                payload: serde_json::json!({}),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_search_parses_hits() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/docs/points/search");
                then.status(200).json_body(serde_json::json!({
                    "result": [
                        {"id": "0b0f...a", "score": 0.92, "payload": {"url": "https://e.com/1"}},
                        {"id": 7, "score": 0.81, "payload": {"url": "https://e.com/2"}},
                    ]
                }));
            })
            .await;

        let index = QdrantHttpIndex::new(&server.base_url(), "docs", 3);
        let hits = index
            .search(&[0.1, 0.2, 0.3], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[1].id, "7");
    }

    #[tokio::test]
    async fn test_count_reads_collection_info() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/docs");
                then.status(200)
                    .json_body(serde_json::json!({"result": {"points_count": 42}}));
            })
            .await;

        let index = QdrantHttpIndex::new(&server.base_url(), "docs", 3);
        assert_eq!(index.count().await.unwrap(), 42);
    }
}
