//! Core data shapes shared by ingestion, indexing, and search.

use serde::{Deserialize, Serialize};

/// A scraped web document as delivered by the scrape webhook or the
/// rescrape flow. `markdown` is the authoritative text; raw HTML is never
/// indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    #[serde(default)]
    pub resolved_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub is_mobile: Option<bool>,
}

/// Document metadata carried onto every chunk and BM25 entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub url: String,
    pub canonical_url: String,
    pub domain: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub is_mobile: Option<bool>,
}

impl DocumentMeta {
    /// Flatten into a JSON payload for the vector store.
    pub fn to_payload(&self, text: &str, chunk_index: usize, token_count: usize) -> serde_json::Value {
        serde_json::json!({
            "url": self.url,
            "canonical_url": self.canonical_url,
            "domain": self.domain,
            "title": self.title,
            "description": self.description,
            "language": self.language,
            "country": self.country,
            "is_mobile": self.is_mobile,
            "text": text,
            "chunk_index": chunk_index,
            "token_count": token_count,
        })
    }
}

/// A token-bounded slice of a document's cleaned text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub chunk_index: usize,
    pub token_count: usize,
    pub meta: DocumentMeta,
}
