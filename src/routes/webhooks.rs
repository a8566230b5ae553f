//! Signed webhook endpoints: scrape completions and change detections.
//!
//! The body is read as raw bytes and verified against the HMAC signature
//! before any JSON parsing. Scrape events are a tagged union on `type`;
//! unknown variants are rejected with 422 rather than coerced, while
//! syntactically broken JSON is a 400.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::db::{ChangeEventUpdate, NewChangeEvent};
use crate::document::Document;
use crate::error::{AppError, AppResult};
use crate::jobs::{FN_INDEX_DOCUMENT, FN_RESCRAPE_CHANGED_URL};
use crate::signature::{verify_signature, SignatureError, SIGNATURE_HEADER};
use crate::state::AppState;

/// Scrape lifecycle and page events, discriminated on `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ScrapeEvent {
    #[serde(rename = "crawl.page")]
    CrawlPage {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        data: Vec<Document>,
    },
    #[serde(rename = "batch_scrape.page")]
    BatchScrapePage {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        data: Vec<Document>,
    },
    #[serde(rename = "crawl.started")]
    CrawlStarted {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "crawl.completed")]
    CrawlCompleted {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "crawl.failed")]
    CrawlFailed {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

impl ScrapeEvent {
    fn type_name(&self) -> &'static str {
        match self {
            ScrapeEvent::CrawlPage { .. } => "crawl.page",
            ScrapeEvent::BatchScrapePage { .. } => "batch_scrape.page",
            ScrapeEvent::CrawlStarted { .. } => "crawl.started",
            ScrapeEvent::CrawlCompleted { .. } => "crawl.completed",
            ScrapeEvent::CrawlFailed { .. } => "crawl.failed",
        }
    }

    fn event_id(&self) -> Option<&str> {
        match self {
            ScrapeEvent::CrawlPage { id, .. }
            | ScrapeEvent::BatchScrapePage { id, .. }
            | ScrapeEvent::CrawlStarted { id }
            | ScrapeEvent::CrawlCompleted { id }
            | ScrapeEvent::CrawlFailed { id, .. } => id.as_deref(),
        }
    }
}

/// Change-detection notification payload.
#[derive(Debug, Deserialize)]
pub struct ChangeDetectionPayload {
    pub watch_id: String,
    pub watch_url: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub diff_summary: Option<String>,
    #[serde(default)]
    pub snapshot_url: Option<String>,
}

fn check_signature(state: &AppState, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    verify_signature(&state.config.webhook_secret, body, header).map_err(|e| match e {
        SignatureError::Missing => AppError::AuthFailure("missing webhook signature".to_string()),
        SignatureError::Malformed => {
            AppError::InvalidInput("malformed webhook signature".to_string())
        }
        SignatureError::Mismatch => AppError::AuthFailure("invalid webhook signature".to_string()),
    })
}

/// Decode JSON distinguishing broken syntax (400) from a payload that
/// parses but does not match any known shape (422).
fn decode_event<T: serde::de::DeserializeOwned>(body: &[u8]) -> AppResult<T> {
    serde_json::from_slice(body).map_err(|e| match e.classify() {
        serde_json::error::Category::Syntax | serde_json::error::Category::Eof => {
            AppError::InvalidInput(format!("malformed JSON body: {}", e))
        }
        _ => AppError::Unprocessable(format!("unrecognized event payload: {}", e)),
    })
}

/// POST /api/webhook/firecrawl
pub async fn firecrawl_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    check_signature(&state, &headers, &body)?;
    let event: ScrapeEvent = decode_event(&body)?;

    let event_type = event.type_name();
    let event_id = event.event_id().map(str::to_string);

    let documents = match event {
        ScrapeEvent::CrawlPage { data, .. } | ScrapeEvent::BatchScrapePage { data, .. } => data,
        ScrapeEvent::CrawlStarted { .. } | ScrapeEvent::CrawlCompleted { .. } => {
            info!("acknowledged {} lifecycle event", event_type);
            vec![]
        }
        ScrapeEvent::CrawlFailed { error, .. } => {
            warn!(
                "crawl failed upstream: {}",
                error.as_deref().unwrap_or("no reason given")
            );
            vec![]
        }
    };

    let mut queued_jobs: Vec<String> = Vec::new();
    let mut failed_documents: Vec<serde_json::Value> = Vec::new();
    for doc in documents {
        if doc.url.trim().is_empty() || doc.markdown.trim().is_empty() {
            failed_documents.push(json!({
                "url": doc.url,
                "error": "document missing url or markdown",
            }));
            continue;
        }
        let args = match serde_json::to_value(&doc) {
            Ok(args) => args,
            Err(e) => {
                failed_documents.push(json!({"url": doc.url, "error": e.to_string()}));
                continue;
            }
        };
        match state.broker.enqueue(FN_INDEX_DOCUMENT, args).await {
            Ok(job_id) => queued_jobs.push(job_id),
            Err(e) => {
                warn!("enqueue failed for {}: {}", doc.url, e);
                failed_documents.push(json!({"url": doc.url, "error": e.to_string()}));
            }
        }
    }

    info!(
        "{} webhook: {} queued, {} failed",
        event_type,
        queued_jobs.len(),
        failed_documents.len()
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "event_type": event_type,
            "event_id": event_id,
            "queued_jobs": queued_jobs,
            "failed_documents": failed_documents,
        })),
    ))
}

/// POST /api/webhook/changedetection
pub async fn changedetection_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    check_signature(&state, &headers, &body)?;
    let payload: ChangeDetectionPayload = decode_event(&body)?;

    if payload.watch_id.trim().is_empty() || payload.watch_url.trim().is_empty() {
        return Err(AppError::Unprocessable(
            "watch_id and watch_url are required".to_string(),
        ));
    }

    let event = state
        .db
        .insert_change_event(NewChangeEvent {
            watch_id: payload.watch_id,
            watch_url: payload.watch_url.clone(),
            detected_at: payload.detected_at,
            diff_summary: payload.diff_summary,
            snapshot_url: payload.snapshot_url,
        })
        .await?;

    let job_id = state
        .broker
        .enqueue(FN_RESCRAPE_CHANGED_URL, json!({"change_event_id": event.id}))
        .await?;
    state
        .db
        .update_change_event(
            event.id,
            ChangeEventUpdate {
                rescrape_job_id: Some(job_id.clone()),
                ..Default::default()
            },
        )
        .await?;

    info!(
        "change event {} recorded for {} (job {})",
        event.id, payload.watch_url, job_id
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "queued",
            "job_id": job_id,
            "change_event_id": event.id,
            "url": payload.watch_url,
        })),
    ))
}
