//! Scraper adapter for re-fetching changed URLs.
//!
//! The rescrape job needs exactly one operation from the scraping
//! service: turn a URL into a `Document`. Firecrawl's `/v1/scrape` is the
//! production backend.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::document::Document;
use crate::error::{AppError, AppResult};
use crate::retry::{retry_transient, BackoffPolicy};

/// Scrapes can legitimately take a while on heavy pages.
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, url: &str) -> AppResult<Document>;
}

pub struct FirecrawlScraper {
    base_url: String,
    api_key: Option<String>,
    client: OnceLock<reqwest::Client>,
}

#[derive(Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<ScrapeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ScrapeData {
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    metadata: Option<ScrapeMetadata>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ScrapeMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "sourceURL")]
    source_url: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    language: Option<String>,
}

impl FirecrawlScraper {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::Client {
        self.client.get_or_init(|| {
            reqwest::Client::builder()
                .timeout(SCRAPE_TIMEOUT)
                .build()
                .unwrap_or_default()
        })
    }

    async fn scrape_call(&self, url: &str) -> AppResult<Document> {
        let endpoint = format!("{}/v1/scrape", self.base_url);
        let mut request = self.client().post(&endpoint).json(&serde_json::json!({
            "url": url,
            "formats": ["markdown"],
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::TransientRemote(format!("scraper unreachable: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AppError::TransientRemote(format!("scraper returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::PermanentRemote(format!(
                "scraper rejected {} ({}): {}",
                url, status, body
            )));
        }

        let parsed: ScrapeResponse = response
            .json()
            .await
            .map_err(|e| AppError::PermanentRemote(format!("scraper response malformed: {}", e)))?;

        if !parsed.success {
            return Err(AppError::PermanentRemote(format!(
                "scrape of {} failed: {}",
                url,
                parsed.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        let data = parsed
            .data
            .ok_or_else(|| AppError::PermanentRemote("scrape succeeded without data".to_string()))?;
        let markdown = data.markdown.unwrap_or_default();
        if markdown.trim().is_empty() {
            return Err(AppError::PermanentRemote(format!(
                "scrape of {} produced no markdown",
                url
            )));
        }
        let metadata = data.metadata.unwrap_or_default();

        debug!("scraped {} ({} bytes of markdown)", url, markdown.len());
        Ok(Document {
            url: url.to_string(),
            resolved_url: metadata.source_url.or_else(|| Some(url.to_string())),
            title: metadata.title,
            description: metadata.description,
            markdown,
            status_code: metadata.status_code,
            language: metadata.language,
            country: None,
            is_mobile: None,
        })
    }
}

#[async_trait]
impl Scraper for FirecrawlScraper {
    async fn scrape(&self, url: &str) -> AppResult<Document> {
        retry_transient("scrape", BackoffPolicy::default(), || self.scrape_call(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_scrape_parses_document() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/scrape");
                then.status(200).json_body(serde_json::json!({
                    "success": true,
                    "data": {
                        "markdown": "# Fresh\ncontent",
                        "metadata": {
                            "title": "Fresh",
                            "sourceURL": "https://e.com/q",
                            "statusCode": 200,
                            "language": "en"
                        }
                    }
                }));
            })
            .await;

        let scraper = FirecrawlScraper::new(&server.base_url(), None);
        let doc = scraper.scrape("https://e.com/q").await.unwrap();
        assert_eq!(doc.title.as_deref(), Some("Fresh"));
        assert_eq!(doc.markdown, "# Fresh\ncontent");
        assert_eq!(doc.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_unsuccessful_scrape_is_permanent() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/scrape");
                then.status(200)
                    .json_body(serde_json::json!({"success": false, "error": "blocked"}));
            })
            .await;

        let scraper = FirecrawlScraper::new(&server.base_url(), None);
        let err = scraper.scrape("https://e.com/q").await.unwrap_err();
        assert!(matches!(err, AppError::PermanentRemote(_)));
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn test_empty_markdown_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/scrape");
                then.status(200)
                    .json_body(serde_json::json!({"success": true, "data": {"markdown": "  "}}));
            })
            .await;

        let scraper = FirecrawlScraper::new(&server.base_url(), None);
        assert!(scraper.scrape("https://e.com/q").await.is_err());
    }
}
