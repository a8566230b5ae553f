//! Typed job handlers.
//!
//! `index_document` treats failures as data: the job finishes normally
//! with a `{success:false, ...}` result so one bad page never shows up
//! as a broker failure. `rescrape_changed_url` re-raises instead — its
//! failure is recorded on both the change-event row and the job record.

use serde_json::json;
use tracing::warn;

use super::{JobContext, FN_INDEX_DOCUMENT, FN_RESCRAPE_CHANGED_URL};
use crate::document::Document;
use crate::error::{AppError, AppResult};
use crate::pipeline;

/// Route a dequeued job to its handler.
pub async fn dispatch(
    ctx: &JobContext,
    function: &str,
    args: serde_json::Value,
) -> AppResult<serde_json::Value> {
    match function {
        FN_INDEX_DOCUMENT => Ok(index_document_job(ctx, args).await),
        FN_RESCRAPE_CHANGED_URL => {
            let id = parse_change_event_id(&args)?;
            super::rescrape::run(ctx, id).await
        }
        other => Err(AppError::InvalidInput(format!(
            "unknown job function {:?}",
            other
        ))),
    }
}

async fn index_document_job(ctx: &JobContext, args: serde_json::Value) -> serde_json::Value {
    let doc: Document = match serde_json::from_value(args) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("index_document job carried an undecodable document: {}", e);
            return json!({
                "success": false,
                "error": format!("invalid document payload: {}", e),
                "error_type": "invalid_input",
            });
        }
    };

    let outcome = pipeline::index_document(&ctx.services, doc).await;
    match serde_json::to_value(&outcome) {
        Ok(value) => value,
        Err(e) => json!({
            "success": false,
            "error": format!("result encoding failed: {}", e),
            "error_type": "internal",
        }),
    }
}

/// Accepts `{"change_event_id": N}` or a bare integer.
fn parse_change_event_id(args: &serde_json::Value) -> AppResult<i64> {
    args.get("change_event_id")
        .and_then(|v| v.as_i64())
        .or_else(|| args.as_i64())
        .ok_or_else(|| {
            AppError::InvalidInput("rescrape job args carry no change_event_id".to_string())
        })
}
