use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppError, AppResult};

/// Minimum length for API and webhook secrets.
pub const MIN_SECRET_LENGTH: usize = 32;

/// Secrets that ship in docs and docker-compose examples. Rejected outside
/// test mode regardless of length.
const WEAK_SECRETS: &[&str] = &[
    "changeme",
    "change-me-please-change-me-please",
    "secret",
    "password",
    "dev-secret-dev-secret-dev-secret",
    "00000000000000000000000000000000",
];

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub api_secret: String,
    pub webhook_secret: String,
    pub redis_url: String,
    pub database_url: String,
    pub qdrant_url: String,
    pub qdrant_collection: String,
    pub tei_url: String,
    pub firecrawl_url: String,
    pub firecrawl_api_key: Option<String>,
    pub vector_dim: usize,
    pub max_chunk_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub rrf_k: u32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub bm25_index_path: String,
    /// Reserved for score-based fusion; RRF ignores it.
    pub hybrid_alpha: f32,
    pub enable_worker: bool,
    pub cors_origins: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        let port = env_or("PORT", "8000");

        let bm25_index_path = std::env::var("BM25_INDEX_PATH").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| {
                    d.join("searchbridge")
                        .join("bm25_index.bin")
                        .to_string_lossy()
                        .to_string()
                })
                .unwrap_or_else(|| ".searchbridge/bm25_index.bin".to_string())
        });

        let cors_origins: Vec<String> = env_or("CORS_ORIGINS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if cors_origins.iter().any(|o| o == "*") {
            warn!("CORS_ORIGINS contains a wildcard; every origin will be allowed");
        }

        let config = Self {
            listen_addr: format!("0.0.0.0:{}", port),
            api_secret: env_or("API_SECRET", ""),
            webhook_secret: env_or("WEBHOOK_SECRET", ""),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            database_url: env_or("DATABASE_URL", "postgres://localhost/searchbridge"),
            qdrant_url: env_or("QDRANT_URL", "http://127.0.0.1:6333"),
            qdrant_collection: env_or("QDRANT_COLLECTION", "web_documents"),
            tei_url: env_or("TEI_URL", "http://127.0.0.1:8080"),
            firecrawl_url: env_or("FIRECRAWL_URL", "http://127.0.0.1:3002"),
            firecrawl_api_key: std::env::var("FIRECRAWL_API_KEY").ok().filter(|v| !v.is_empty()),
            vector_dim: env_parse("VECTOR_DIM", 1024),
            max_chunk_tokens: env_parse("MAX_CHUNK_TOKENS", 256),
            chunk_overlap_tokens: env_parse("CHUNK_OVERLAP_TOKENS", 50),
            rrf_k: env_parse("RRF_K", 60),
            bm25_k1: env_parse("BM25_K1", 1.5),
            bm25_b: env_parse("BM25_B", 0.75),
            bm25_index_path,
            hybrid_alpha: env_parse("HYBRID_ALPHA", 0.5),
            enable_worker: env_parse("ENABLE_WORKER", false),
            cors_origins,
        };

        let test_mode = env_parse("APP_TEST_MODE", false);
        if !test_mode {
            validate_secret("API_SECRET", &config.api_secret)?;
            validate_secret("WEBHOOK_SECRET", &config.webhook_secret)?;
        }

        Ok(config)
    }

    /// A config suitable for unit tests: in-memory-ish endpoints and
    /// deliberately long secrets so validation never trips.
    pub fn for_tests() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            api_secret: "test-api-secret-0123456789abcdef0123456789".to_string(),
            webhook_secret: "test-webhook-secret-0123456789abcdef0123".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "postgres://localhost/searchbridge_test".to_string(),
            qdrant_url: "http://127.0.0.1:6333".to_string(),
            qdrant_collection: "web_documents_test".to_string(),
            tei_url: "http://127.0.0.1:8080".to_string(),
            firecrawl_url: "http://127.0.0.1:3002".to_string(),
            firecrawl_api_key: None,
            vector_dim: 4,
            max_chunk_tokens: 256,
            chunk_overlap_tokens: 50,
            rrf_k: 60,
            bm25_k1: 1.5,
            bm25_b: 0.75,
            bm25_index_path: std::env::temp_dir()
                .join("searchbridge-test-bm25.bin")
                .to_string_lossy()
                .to_string(),
            hybrid_alpha: 0.5,
            enable_worker: false,
            cors_origins: vec![],
        }
    }
}

fn validate_secret(name: &str, value: &str) -> AppResult<()> {
    if value.len() < MIN_SECRET_LENGTH {
        return Err(AppError::InvalidInput(format!(
            "{} must be at least {} characters (got {})",
            name,
            MIN_SECRET_LENGTH,
            value.len()
        )));
    }
    let lowered = value.to_lowercase();
    if WEAK_SECRETS.iter().any(|weak| lowered == *weak) {
        return Err(AppError::InvalidInput(format!(
            "{} is a known weak default; generate a random value",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_secret_rejected() {
        let err = validate_secret("API_SECRET", "short").unwrap_err();
        assert!(err.to_string().contains("at least 32"));
    }

    #[test]
    fn test_weak_secret_rejected() {
        let err =
            validate_secret("WEBHOOK_SECRET", "change-me-please-change-me-please").unwrap_err();
        assert!(err.to_string().contains("weak"));
    }

    #[test]
    fn test_strong_secret_accepted() {
        validate_secret("API_SECRET", "fba1c0ffee5ca1ab1efba1c0ffee5ca1ab1e7777").unwrap();
    }

    #[test]
    fn test_for_tests_config_passes_validation() {
        let cfg = AppConfig::for_tests();
        validate_secret("API_SECRET", &cfg.api_secret).unwrap();
        validate_secret("WEBHOOK_SECRET", &cfg.webhook_secret).unwrap();
    }
}
