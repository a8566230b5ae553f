//! In-memory doubles for every adapter port.
//!
//! These back the unit tests beside each module and the end-to-end tests
//! under `tests/`, so the full webhook → job → pipeline → search path
//! runs without Redis, Postgres, Qdrant, or a TEI endpoint.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use crate::db::{ChangeEvent, ChangeEventUpdate, MetadataDb, NewChangeEvent};
use crate::document::Document;
use crate::embedder::Embedder;
use crate::error::{AppError, AppResult};
use crate::jobs::{JobBroker, JobPayload, JobRecord, JobStatus};
use crate::scraper::Scraper;
use crate::vector::{Point, SearchFilter, VectorHit, VectorIndex};

// ---------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------

/// Deterministic embedder: preset vectors per exact text, with a
/// byte-derived fallback so unseen texts still embed consistently.
pub struct FakeEmbedder {
    dim: usize,
    presets: DashMap<String, Vec<f32>>,
    failing: AtomicBool,
}

impl FakeEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            presets: DashMap::new(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn preset(&self, text: &str, vector: &[f32]) {
        self.presets.insert(text.to_string(), vector.to_vec());
    }

    /// Every subsequent call fails as if the endpoint were down.
    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn derive(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dim];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dim] += byte as f32;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::TransientRemote("fake embedder down".to_string()));
        }
        if let Some(pos) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(AppError::InvalidInput(format!(
                "embed batch input {} is empty after cleaning",
                pos
            )));
        }
        Ok(texts
            .iter()
            .map(|text| {
                self.presets
                    .get(text.as_str())
                    .map(|v| v.clone())
                    .unwrap_or_else(|| self.derive(text))
            })
            .collect())
    }

    async fn health_check(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------
// Vector index
// ---------------------------------------------------------------------

/// Brute-force cosine index over stored points.
pub struct FakeVectorIndex {
    dim: usize,
    points: Mutex<Vec<Point>>,
    collection_created: AtomicBool,
    fail_upserts: AtomicBool,
}

impl FakeVectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            points: Mutex::new(Vec::new()),
            collection_created: AtomicBool::new(false),
            fail_upserts: AtomicBool::new(false),
        }
    }

    pub fn fail_upserts(&self) {
        self.fail_upserts.store(true, Ordering::SeqCst);
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().clone()
    }

    pub fn collection_created(&self) -> bool {
        self.collection_created.load(Ordering::SeqCst)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for FakeVectorIndex {
    async fn ensure_collection(&self) -> AppResult<()> {
        self.collection_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert(&self, points: Vec<Point>) -> AppResult<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(AppError::TransientRemote("fake vector index down".to_string()));
        }
        for point in &points {
            if point.vector.len() != self.dim {
                return Err(AppError::DimensionMismatch {
                    expected: self.dim,
                    got: point.vector.len(),
                });
            }
        }
        // All-or-nothing: validate first, then extend.
        self.points.lock().extend(points);
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> AppResult<Vec<VectorHit>> {
        if vector.len() != self.dim {
            return Err(AppError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        let points = self.points.lock();
        let mut hits: Vec<VectorHit> = points
            .iter()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| VectorHit {
                id: p.id.to_string(),
                score: cosine(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self) -> AppResult<u64> {
        Ok(self.points.lock().len() as u64)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------
// Job broker
// ---------------------------------------------------------------------

/// FIFO queue plus status records, all in memory.
pub struct FakeBroker {
    queue: Mutex<VecDeque<JobPayload>>,
    records: DashMap<String, JobRecord>,
    counter: AtomicI64,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            records: DashMap::new(),
            counter: AtomicI64::new(0),
        }
    }

    /// Jobs currently waiting, oldest first.
    pub fn pending(&self) -> Vec<JobPayload> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBroker for FakeBroker {
    async fn enqueue(&self, function: &str, args: serde_json::Value) -> AppResult<String> {
        let job_id = format!("job-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let payload = JobPayload {
            job_id: job_id.clone(),
            function: function.to_string(),
            args,
            enqueued_at: Utc::now(),
        };
        self.records.insert(
            job_id.clone(),
            JobRecord {
                job_id: job_id.clone(),
                function: function.to_string(),
                status: JobStatus::Queued,
                result: None,
                error: None,
            },
        );
        self.queue.lock().push_back(payload);
        Ok(job_id)
    }

    async fn dequeue(&self, wait: Duration) -> AppResult<Option<JobPayload>> {
        if let Some(payload) = self.queue.lock().pop_front() {
            return Ok(Some(payload));
        }
        // Briefly yield like a blocking pop would, so worker loops in
        // tests do not spin hot on an empty queue.
        tokio::time::sleep(wait.min(Duration::from_millis(5))).await;
        Ok(self.queue.lock().pop_front())
    }

    async fn record_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> AppResult<()> {
        let mut record = self
            .records
            .entry(job_id.to_string())
            .or_insert_with(|| JobRecord {
                job_id: job_id.to_string(),
                function: String::new(),
                status: JobStatus::Queued,
                result: None,
                error: None,
            });
        record.status = status;
        if result.is_some() {
            record.result = result;
        }
        if error.is_some() {
            record.error = error;
        }
        Ok(())
    }

    async fn job_status(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        Ok(self.records.get(job_id).map(|r| r.clone()))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------
// Metadata DB
// ---------------------------------------------------------------------

/// Change-event rows in a map, with the status history retained so tests
/// can assert the lifecycle order.
pub struct FakeMetadataDb {
    rows: DashMap<i64, ChangeEvent>,
    history: Mutex<HashMap<i64, Vec<String>>>,
    next_id: AtomicI64,
}

impl FakeMetadataDb {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            history: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Every status the row has held, in order, starting with `queued`.
    pub fn status_history(&self, id: i64) -> Vec<String> {
        self.history.lock().get(&id).cloned().unwrap_or_default()
    }
}

impl Default for FakeMetadataDb {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataDb for FakeMetadataDb {
    async fn insert_change_event(&self, new: NewChangeEvent) -> AppResult<ChangeEvent> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = ChangeEvent {
            id,
            watch_id: new.watch_id,
            watch_url: new.watch_url,
            detected_at: new.detected_at,
            diff_summary: new.diff_summary,
            snapshot_url: new.snapshot_url,
            rescrape_job_id: None,
            rescrape_status: "queued".to_string(),
            indexed_at: None,
            extra_metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        self.history
            .lock()
            .entry(id)
            .or_default()
            .push("queued".to_string());
        self.rows.insert(id, event.clone());
        Ok(event)
    }

    async fn get_change_event(&self, id: i64) -> AppResult<Option<ChangeEvent>> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn update_change_event(&self, id: i64, update: ChangeEventUpdate) -> AppResult<()> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("change event {} missing", id)))?;

        if let Some(status) = update.rescrape_status {
            self.history
                .lock()
                .entry(id)
                .or_default()
                .push(status.clone());
            row.rescrape_status = status;
        }
        if let Some(job_id) = update.rescrape_job_id {
            row.rescrape_job_id = Some(job_id);
        }
        if let Some(indexed_at) = update.indexed_at {
            row.indexed_at = Some(indexed_at);
        }
        if let Some(serde_json::Value::Object(incoming)) = update.merge_metadata {
            if let serde_json::Value::Object(existing) = &mut row.extra_metadata {
                for (key, value) in incoming {
                    existing.insert(key, value);
                }
            } else {
                row.extra_metadata = serde_json::Value::Object(incoming);
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------

/// Preset markdown per URL; unknown URLs or the failure mode error.
pub struct FakeScraper {
    pages: DashMap<String, String>,
    failure: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeScraper {
    pub fn new() -> Self {
        Self {
            pages: DashMap::new(),
            failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn preset(&self, url: &str, markdown: &str) {
        self.pages.insert(url.to_string(), markdown.to_string());
    }

    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Default for FakeScraper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scraper for FakeScraper {
    async fn scrape(&self, url: &str) -> AppResult<Document> {
        self.calls.lock().push(url.to_string());
        if let Some(reason) = self.failure.lock().clone() {
            return Err(AppError::TransientRemote(reason));
        }
        let markdown = self
            .pages
            .get(url)
            .map(|m| m.clone())
            .ok_or_else(|| AppError::PermanentRemote(format!("no page preset for {}", url)))?;
        Ok(Document {
            url: url.to_string(),
            resolved_url: Some(url.to_string()),
            title: Some("Rescraped".to_string()),
            description: None,
            markdown,
            status_code: Some(200),
            language: Some("en".to_string()),
            country: None,
            is_mobile: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_embedder_is_deterministic() {
        let embedder = FakeEmbedder::new(4);
        let a = embedder.embed_single("hello").await.unwrap();
        let b = embedder.embed_single("hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
    }

    #[tokio::test]
    async fn test_fake_vector_index_orders_by_cosine() {
        let index = FakeVectorIndex::new(2);
        index
            .upsert(vec![
                Point {
                    id: uuid::Uuid::new_v4(),
                    vector: vec![1.0, 0.0],
                    payload: serde_json::json!({"url": "a"}),
                },
                Point {
                    id: uuid::Uuid::new_v4(),
                    vector: vec![0.0, 1.0],
                    payload: serde_json::json!({"url": "b"}),
                },
            ])
            .await
            .unwrap();

        let hits = index
            .search(&[1.0, 0.1], 2, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].payload["url"], "a");
    }

    #[tokio::test]
    async fn test_fake_broker_fifo_and_status() {
        let broker = FakeBroker::new();
        let id1 = broker
            .enqueue("index_document", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let _id2 = broker
            .enqueue("index_document", serde_json::json!({"n": 2}))
            .await
            .unwrap();

        let first = broker.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.job_id, id1);

        broker
            .record_status(&id1, JobStatus::Finished, Some(serde_json::json!({"ok": true})), None)
            .await
            .unwrap();
        let record = broker.job_status(&id1).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Finished);
        assert_eq!(record.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_fake_db_merges_metadata() {
        let db = FakeMetadataDb::new();
        let event = db
            .insert_change_event(NewChangeEvent {
                watch_id: "w".to_string(),
                watch_url: "https://e.com".to_string(),
                detected_at: Utc::now(),
                diff_summary: None,
                snapshot_url: None,
            })
            .await
            .unwrap();

        db.update_change_event(
            event.id,
            ChangeEventUpdate {
                merge_metadata: Some(serde_json::json!({"a": 1})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.update_change_event(
            event.id,
            ChangeEventUpdate {
                merge_metadata: Some(serde_json::json!({"b": 2})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let row = db.get_change_event(event.id).await.unwrap().unwrap();
        assert_eq!(row.extra_metadata["a"], 1);
        assert_eq!(row.extra_metadata["b"], 2);
    }
}
