//! Rescrape job: re-fetch a changed URL and reindex it, with the
//! change-event row updated in separate short transactions.
//!
//! The external scrape can take many seconds, so no database transaction
//! spans it: one transaction marks the row in progress, the scrape and
//! reindex run bare, and a final transaction records completed or
//! failed:<reason>. Errors re-raise after the row update so the broker
//! also marks the job failed.

use chrono::Utc;
use serde_json::json;
use tracing::{error, info};

use super::JobContext;
use crate::db::{failed_status, ChangeEventUpdate, STATUS_IN_PROGRESS};
use crate::error::{AppError, AppResult};
use crate::pipeline;

pub async fn run(ctx: &JobContext, change_event_id: i64) -> AppResult<serde_json::Value> {
    // Tx 1 (short): claim the row.
    let event = ctx
        .db
        .get_change_event(change_event_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("change event {} missing", change_event_id)))?;
    ctx.db
        .update_change_event(
            change_event_id,
            ChangeEventUpdate {
                rescrape_status: Some(STATUS_IN_PROGRESS.to_string()),
                ..Default::default()
            },
        )
        .await?;
    info!(
        "rescrape of change event {} ({}) in progress",
        change_event_id, event.watch_url
    );

    // Scrape + reindex, outside any transaction.
    let work = async {
        let doc = ctx.scraper.scrape(&event.watch_url).await?;
        let outcome = pipeline::index_document(&ctx.services, doc).await;
        if !outcome.success {
            return Err(AppError::PermanentRemote(format!(
                "reindex of {} failed: {}",
                event.watch_url,
                outcome.error.as_deref().unwrap_or("unknown error")
            )));
        }
        Ok(outcome)
    };

    match work.await {
        Ok(outcome) => {
            // Tx 3 (short): completed. A second run of the same event
            // overwrites with the later indexed_at.
            let indexed_at = Utc::now();
            ctx.db
                .update_change_event(
                    change_event_id,
                    ChangeEventUpdate {
                        rescrape_status: Some(crate::db::STATUS_COMPLETED.to_string()),
                        indexed_at: Some(indexed_at),
                        merge_metadata: Some(json!({
                            "reindexed_url": outcome.url,
                            "chunks_indexed": outcome.chunks_indexed,
                            "total_tokens": outcome.total_tokens,
                        })),
                        ..Default::default()
                    },
                )
                .await?;
            info!(
                "rescrape of change event {} completed ({} chunks)",
                change_event_id, outcome.chunks_indexed
            );
            Ok(json!({
                "change_event_id": change_event_id,
                "url": outcome.url,
                "chunks_indexed": outcome.chunks_indexed,
                "indexed_at": indexed_at,
            }))
        }
        Err(e) => {
            error!(
                "rescrape of change event {} failed: {}",
                change_event_id, e
            );
            ctx.db
                .update_change_event(
                    change_event_id,
                    ChangeEventUpdate {
                        rescrape_status: Some(failed_status(&e.to_string())),
                        merge_metadata: Some(json!({
                            "error": e.to_string(),
                            "failed_at": Utc::now(),
                        })),
                        ..Default::default()
                    },
                )
                .await?;
            // Re-raise so the broker records the job as failed.
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm25::Bm25Engine;
    use crate::chunker::TokenChunker;
    use crate::db::{MetadataDb, NewChangeEvent};
    use crate::services::ServicePool;
    use crate::testing::{FakeBroker, FakeEmbedder, FakeMetadataDb, FakeScraper, FakeVectorIndex};
    use std::sync::Arc;

    async fn context() -> (JobContext, Arc<FakeMetadataDb>, Arc<FakeScraper>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let chunker = Arc::new(TokenChunker::load(64, 8).unwrap());
        let bm25 = Arc::new(Bm25Engine::open(dir.path().join("idx.bin"), 1.5, 0.75));
        let services = Arc::new(ServicePool::from_parts(
            chunker,
            Arc::new(FakeEmbedder::new(4)),
            Arc::new(FakeVectorIndex::new(4)),
            bm25,
            4,
            60,
        ));
        let db = Arc::new(FakeMetadataDb::new());
        let scraper = Arc::new(FakeScraper::new());
        let ctx = JobContext {
            services,
            db: db.clone(),
            scraper: scraper.clone(),
            broker: Arc::new(FakeBroker::new()),
        };
        (ctx, db, scraper, dir)
    }

    fn new_event(url: &str) -> NewChangeEvent {
        NewChangeEvent {
            watch_id: "watch-1".to_string(),
            watch_url: url.to_string(),
            detected_at: Utc::now(),
            diff_summary: Some("content changed".to_string()),
            snapshot_url: None,
        }
    }

    #[tokio::test]
    async fn test_successful_rescrape_completes_row() {
        let (ctx, db, scraper, _dir) = context().await;
        scraper.preset("https://e.com/q", "# Updated\nfresh content here");
        let event = db.insert_change_event(new_event("https://e.com/q")).await.unwrap();

        let result = run(&ctx, event.id).await.unwrap();
        assert_eq!(result["change_event_id"], event.id);

        let row = db.get_change_event(event.id).await.unwrap().unwrap();
        assert_eq!(row.rescrape_status, "completed");
        assert!(row.indexed_at.is_some());
        assert!(row.extra_metadata["chunks_indexed"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_scrape_error_fails_row_and_reraises() {
        let (ctx, db, scraper, _dir) = context().await;
        scraper.fail_with("connection refused");
        let event = db.insert_change_event(new_event("https://e.com/q")).await.unwrap();

        let err = run(&ctx, event.id).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));

        let row = db.get_change_event(event.id).await.unwrap().unwrap();
        assert!(row.rescrape_status.starts_with("failed:"), "{}", row.rescrape_status);
        assert!(row.indexed_at.is_none());
        assert!(row.extra_metadata["error"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
        assert!(row.extra_metadata.get("failed_at").is_some());
    }

    #[tokio::test]
    async fn test_row_passes_through_in_progress() {
        let (ctx, db, scraper, _dir) = context().await;
        scraper.preset("https://e.com/q", "body text");
        let event = db.insert_change_event(new_event("https://e.com/q")).await.unwrap();
        assert_eq!(
            db.get_change_event(event.id).await.unwrap().unwrap().rescrape_status,
            "queued"
        );

        run(&ctx, event.id).await.unwrap();
        let statuses = db.status_history(event.id);
        assert_eq!(statuses, vec!["queued", "in_progress", "completed"]);
    }

    #[tokio::test]
    async fn test_missing_event_is_not_found() {
        let (ctx, _db, _scraper, _dir) = context().await;
        let err = run(&ctx, 999).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_second_run_overwrites_indexed_at() {
        let (ctx, db, scraper, _dir) = context().await;
        scraper.preset("https://e.com/q", "stable content");
        let event = db.insert_change_event(new_event("https://e.com/q")).await.unwrap();

        run(&ctx, event.id).await.unwrap();
        let first = db
            .get_change_event(event.id)
            .await
            .unwrap()
            .unwrap()
            .indexed_at
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        run(&ctx, event.id).await.unwrap();
        let row = db.get_change_event(event.id).await.unwrap().unwrap();
        assert_eq!(row.rescrape_status, "completed");
        assert!(row.indexed_at.unwrap() > first);
    }
}
