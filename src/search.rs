//! Search orchestrator: mode dispatch, parallel hybrid fan-out, and
//! Reciprocal Rank Fusion.
//!
//! BM25 scores are unbounded and cosine similarities are not; RRF fuses
//! the two rankings without comparing raw scores. Document identity for
//! the merge is the canonical URL when the payload carries one, then the
//! raw URL, then the backend result id.

use futures_util::future::join;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::bm25::tokenize;
use crate::services::ServicePool;
use crate::vector::SearchFilter;

/// How much deeper than the requested limit each hybrid arm searches, so
/// fusion has candidates that only one backend surfaced.
const HYBRID_FANOUT_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Hybrid,
    Semantic,
    #[serde(alias = "bm25")]
    Keyword,
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Hybrid
    }
}

/// One search result as returned over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub text: String,
    pub score: f64,
    pub metadata: serde_json::Value,
}

/// A ranked candidate from one backend, before fusion.
#[derive(Debug, Clone)]
struct RankedDoc {
    identity: String,
    url: String,
    title: Option<String>,
    description: Option<String>,
    text: String,
    score: f64,
    metadata: serde_json::Value,
}

/// Execute a search in the requested mode. Degrades rather than fails:
/// backend errors shrink the result set, and both backends failing
/// yields an empty list.
pub async fn run_search(
    pool: &ServicePool,
    query: &str,
    mode: SearchMode,
    limit: usize,
    filter: &SearchFilter,
) -> Vec<SearchResultItem> {
    match mode {
        SearchMode::Semantic => {
            let docs = semantic_arm(pool, query, limit, filter).await;
            docs.into_iter().map(to_item).collect()
        }
        SearchMode::Keyword => {
            let docs = keyword_arm(pool, query, limit, filter).await;
            docs.into_iter().map(to_item).collect()
        }
        SearchMode::Hybrid => {
            let fanout = limit.saturating_mul(HYBRID_FANOUT_FACTOR).max(limit);
            let (semantic, keyword) = join(
                semantic_arm(pool, query, fanout, filter),
                keyword_arm(pool, query, fanout, filter),
            )
            .await;
            debug!(
                semantic = semantic.len(),
                keyword = keyword.len(),
                "hybrid candidates"
            );
            rrf_fuse(&[semantic, keyword], pool.rrf_k, limit)
        }
    }
}

/// Embed the query and search the vector index. Any failure returns an
/// empty list; hybrid mode then leans on the keyword arm.
async fn semantic_arm(
    pool: &ServicePool,
    query: &str,
    limit: usize,
    filter: &SearchFilter,
) -> Vec<RankedDoc> {
    let vector = match pool.embedder.embed_single(query).await {
        Ok(vector) if !vector.is_empty() => vector,
        Ok(_) => {
            warn!("query embedding empty, skipping semantic arm");
            return vec![];
        }
        Err(e) => {
            warn!("query embedding failed, skipping semantic arm: {}", e);
            return vec![];
        }
    };

    match pool.vector.search(&vector, limit, filter).await {
        Ok(hits) => hits
            .into_iter()
            .map(|hit| {
                let payload = hit.payload;
                let url = payload
                    .get("url")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let identity = payload
                    .get("canonical_url")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| (!url.is_empty()).then(|| url.clone()))
                    .unwrap_or_else(|| hit.id.clone());
                RankedDoc {
                    identity,
                    url,
                    title: payload.get("title").and_then(|v| v.as_str()).map(str::to_string),
                    description: payload
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    text: payload
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    score: hit.score as f64,
                    metadata: payload,
                }
            })
            .collect(),
        Err(e) => {
            warn!("vector search failed, skipping semantic arm: {}", e);
            vec![]
        }
    }
}

/// BM25 over the blocking pool. Lock timeouts and task failures return
/// an empty list.
async fn keyword_arm(
    pool: &ServicePool,
    query: &str,
    limit: usize,
    filter: &SearchFilter,
) -> Vec<RankedDoc> {
    let bm25 = pool.bm25.clone();
    let tokens = tokenize(query);
    let filter = filter.clone();

    let hits = match tokio::task::spawn_blocking(move || bm25.search(&tokens, limit, &filter)).await
    {
        Ok(Ok(hits)) => hits,
        Ok(Err(e)) => {
            warn!("bm25 search failed, skipping keyword arm: {}", e);
            return vec![];
        }
        Err(e) => {
            warn!("bm25 search task failed, skipping keyword arm: {}", e);
            return vec![];
        }
    };

    hits.into_iter()
        .map(|hit| {
            let identity = if hit.meta.canonical_url.is_empty() {
                hit.meta.url.clone()
            } else {
                hit.meta.canonical_url.clone()
            };
            let metadata = serde_json::to_value(&hit.meta).unwrap_or_default();
            RankedDoc {
                identity,
                url: hit.meta.url.clone(),
                title: hit.meta.title.clone(),
                description: hit.meta.description.clone(),
                text: hit.text,
                score: hit.score,
                metadata,
            }
        })
        .collect()
}

/// Reciprocal Rank Fusion over ranked lists: each document accumulates
/// `1/(rrf_k + rank)` per list it appears in; the first occurrence's
/// payload is kept. Output is sorted by summed score descending with a
/// deterministic identity tie-break.
fn rrf_fuse(lists: &[Vec<RankedDoc>], rrf_k: u32, limit: usize) -> Vec<SearchResultItem> {
    let mut fused: HashMap<String, (RankedDoc, f64)> = HashMap::new();

    for list in lists {
        for (rank, doc) in list.iter().enumerate() {
            let contribution = 1.0 / (rrf_k as f64 + (rank + 1) as f64);
            fused
                .entry(doc.identity.clone())
                .and_modify(|(_, score)| *score += contribution)
                .or_insert_with(|| (doc.clone(), contribution));
        }
    }

    let mut merged: Vec<(RankedDoc, f64)> = fused.into_values().collect();
    merged.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.identity.cmp(&b.0.identity))
    });
    merged.truncate(limit);

    merged
        .into_iter()
        .map(|(doc, rrf_score)| {
            let mut item = to_item(doc);
            item.score = rrf_score;
            if let serde_json::Value::Object(map) = &mut item.metadata {
                map.insert(
                    "rrf_score".to_string(),
                    serde_json::Value::from(rrf_score),
                );
            }
            item
        })
        .collect()
}

fn to_item(doc: RankedDoc) -> SearchResultItem {
    SearchResultItem {
        url: doc.url,
        title: doc.title,
        description: doc.description,
        text: doc.text,
        score: doc.score,
        metadata: doc.metadata,
    }
}
