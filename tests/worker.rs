//! Worker loop behavior: bootstrap against a pre-built service pool,
//! status transitions, and watch-channel shutdown.

use std::sync::Arc;
use std::time::Duration;

use searchbridge::bm25::Bm25Engine;
use searchbridge::chunker::TokenChunker;
use searchbridge::db::MetadataDb;
use searchbridge::jobs::{
    JobBroker, JobContext, JobStatus, Worker, FN_INDEX_DOCUMENT, FN_RESCRAPE_CHANGED_URL,
};
use searchbridge::services::ServicePool;
use searchbridge::testing::{
    FakeBroker, FakeEmbedder, FakeMetadataDb, FakeScraper, FakeVectorIndex,
};

fn context(dir: &tempfile::TempDir) -> (JobContext, Arc<FakeBroker>, Arc<FakeMetadataDb>) {
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
    let broker = Arc::new(FakeBroker::new());
    let db = Arc::new(FakeMetadataDb::new());
    let ctx = JobContext {
        services,
        db: db.clone(),
        scraper: Arc::new(FakeScraper::new()),
        broker: broker.clone(),
    };
    (ctx, broker, db)
}

async fn wait_for_status(
    broker: &FakeBroker,
    job_id: &str,
    wanted: JobStatus,
    deadline: Duration,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if let Some(record) = broker.job_status(job_id).await.unwrap() {
            if record.status == wanted {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn worker_finishes_index_jobs_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, broker, _db) = context(&dir);

    let job_id = broker
        .enqueue(
            FN_INDEX_DOCUMENT,
            serde_json::json!({
                "url": "https://example.com/a",
                "markdown": "worker driven content",
            }),
        )
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = Worker::new(broker.clone(), ctx, shutdown_rx);
    let handle = tokio::spawn(worker.run());

    assert!(wait_for_status(&broker, &job_id, JobStatus::Finished, Duration::from_secs(5)).await);
    let record = broker.job_status(&job_id).await.unwrap().unwrap();
    assert_eq!(record.result.unwrap()["success"], true);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker must stop after shutdown signal")
        .unwrap();
}

#[tokio::test]
async fn bad_document_finishes_with_failure_result() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, broker, _db) = context(&dir);

    // Decodes as a Document but produces nothing to index.
    let job_id = broker
        .enqueue(
            FN_INDEX_DOCUMENT,
            serde_json::json!({"url": "https://example.com/a", "markdown": "   "}),
        )
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(Worker::new(broker.clone(), ctx, shutdown_rx).run());

    assert!(wait_for_status(&broker, &job_id, JobStatus::Finished, Duration::from_secs(5)).await);
    let record = broker.job_status(&job_id).await.unwrap().unwrap();
    // The job finishes; failure is carried in the result payload.
    assert_eq!(record.status, JobStatus::Finished);
    let result = record.result.unwrap();
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "no content after cleaning");

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn rescrape_job_failure_marks_job_failed() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, broker, db) = context(&dir);

    // No change event row exists, so the job errors and must be failed.
    let job_id = broker
        .enqueue(FN_RESCRAPE_CHANGED_URL, serde_json::json!({"change_event_id": 404}))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(Worker::new(broker.clone(), ctx, shutdown_rx).run());

    assert!(wait_for_status(&broker, &job_id, JobStatus::Failed, Duration::from_secs(5)).await);
    let record = broker.job_status(&job_id).await.unwrap().unwrap();
    assert!(record.error.unwrap().contains("404"));
    assert!(db.get_change_event(404).await.unwrap().is_none());

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn unknown_function_is_failed_not_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, broker, _db) = context(&dir);

    let job_id = broker
        .enqueue("transmogrify", serde_json::json!({}))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(Worker::new(broker.clone(), ctx, shutdown_rx).run());

    assert!(wait_for_status(&broker, &job_id, JobStatus::Failed, Duration::from_secs(5)).await);

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}
