//! Background job system: a named Redis queue, a broker port, and the
//! worker loop that drains it.
//!
//! Jobs are opaque `{function, args}` payloads. The broker records a
//! status hash per job (`queued` → `started` → `finished`/`failed`) so
//! webhook callers can hand out job ids and observers can poll them. The
//! worker runs equally inside the API process (`ENABLE_WORKER`) or as a
//! standalone binary; either way it installs no process-wide signal
//! handlers — shutdown arrives on a watch channel owned by the host.

mod handlers;
pub mod rescrape;

pub use handlers::dispatch;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::MetadataDb;
use crate::error::{AppError, AppResult};
use crate::scraper::Scraper;
use crate::services::ServicePool;

/// Default queue name.
pub const DEFAULT_QUEUE: &str = "indexing";

/// Per-job execution timeout.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(600);

/// How long one dequeue call blocks before the worker re-checks shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_secs(5);

/// Registered job function names.
pub const FN_INDEX_DOCUMENT: &str = "index_document";
pub const FN_RESCRAPE_CHANGED_URL: &str = "rescrape_changed_url";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: String,
    pub function: String,
    pub args: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "started" => Some(JobStatus::Started),
            "finished" => Some(JobStatus::Finished),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub function: String,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Port over the queue backend. The queue is a bag: any worker may pick
/// any job, and no ordering holds across jobs.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Push a job and return its stable id.
    async fn enqueue(&self, function: &str, args: serde_json::Value) -> AppResult<String>;

    /// Block up to `wait` for the next job.
    async fn dequeue(&self, wait: Duration) -> AppResult<Option<JobPayload>>;

    /// Record a status transition, optionally with a result or error.
    async fn record_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> AppResult<()>;

    /// Current record for a job, if the broker still has it.
    async fn job_status(&self, job_id: &str) -> AppResult<Option<JobRecord>>;

    /// Liveness probe. Never errors.
    async fn health_check(&self) -> bool;
}

// ---------------------------------------------------------------------
// Redis broker
// ---------------------------------------------------------------------

pub struct RedisBroker {
    client: redis::Client,
    queue: String,
}

impl RedisBroker {
    pub fn new(redis_url: &str, queue: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            queue: queue.to_string(),
        })
    }

    fn queue_key(&self) -> String {
        format!("searchbridge:queue:{}", self.queue)
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("searchbridge:job:{}", job_id)
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::from)
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn enqueue(&self, function: &str, args: serde_json::Value) -> AppResult<String> {
        let job_id = Uuid::new_v4().to_string();
        let payload = JobPayload {
            job_id: job_id.clone(),
            function: function.to_string(),
            args,
            enqueued_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&payload)?;

        let mut con = self.connection().await?;
        redis::cmd("HSET")
            .arg(self.job_key(&job_id))
            .arg("function")
            .arg(function)
            .arg("status")
            .arg(JobStatus::Queued.as_str())
            .arg("enqueued_at")
            .arg(payload.enqueued_at.to_rfc3339())
            .query_async::<()>(&mut con)
            .await?;
        redis::cmd("LPUSH")
            .arg(self.queue_key())
            .arg(&encoded)
            .query_async::<()>(&mut con)
            .await?;

        info!("enqueued {} job {}", function, job_id);
        Ok(job_id)
    }

    async fn dequeue(&self, wait: Duration) -> AppResult<Option<JobPayload>> {
        // A dedicated connection per poll: BRPOP must not stall commands
        // sharing a multiplexed connection.
        let mut con = self.connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.queue_key())
            .arg(wait.as_secs_f64())
            .query_async(&mut con)
            .await?;

        match popped {
            Some((_key, encoded)) => {
                let payload: JobPayload = serde_json::from_str(&encoded)?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    async fn record_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> AppResult<()> {
        let mut con = self.connection().await?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.job_key(job_id))
            .arg("status")
            .arg(status.as_str())
            .arg("updated_at")
            .arg(Utc::now().to_rfc3339());
        if let Some(result) = result {
            cmd.arg("result").arg(serde_json::to_string(&result)?);
        }
        if let Some(error) = error {
            cmd.arg("error").arg(error);
        }
        cmd.query_async::<()>(&mut con).await?;
        Ok(())
    }

    async fn job_status(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        let mut con = self.connection().await?;
        let fields: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(job_id))
            .query_async(&mut con)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(JobRecord {
            job_id: job_id.to_string(),
            function: fields.get("function").cloned().unwrap_or_default(),
            status: fields
                .get("status")
                .and_then(|s| JobStatus::parse(s))
                .unwrap_or(JobStatus::Queued),
            result: fields
                .get("result")
                .and_then(|r| serde_json::from_str(r).ok()),
            error: fields.get("error").cloned(),
        }))
    }

    async fn health_check(&self) -> bool {
        match self.connection().await {
            Ok(mut con) => redis::cmd("PING")
                .query_async::<String>(&mut con)
                .await
                .is_ok(),
            Err(e) => {
                warn!("broker health check failed: {}", e);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------

/// Shared collaborators handed to every job handler.
#[derive(Clone)]
pub struct JobContext {
    pub services: Arc<ServicePool>,
    pub db: Arc<dyn MetadataDb>,
    pub scraper: Arc<dyn Scraper>,
    pub broker: Arc<dyn JobBroker>,
}

/// Drains the queue until the shutdown channel flips. The service pool
/// in the context is fully constructed before `run` is called, so the
/// first job never pays tokenizer-load latency.
pub struct Worker {
    broker: Arc<dyn JobBroker>,
    ctx: JobContext,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(broker: Arc<dyn JobBroker>, ctx: JobContext, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            broker,
            ctx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("worker started, draining queue");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let broker = self.broker.clone();
            let next = tokio::select! {
                job = broker.dequeue(DEQUEUE_WAIT) => job,
                _ = self.shutdown.changed() => break,
            };

            match next {
                Ok(Some(payload)) => self.execute(payload).await,
                Ok(None) => {}
                Err(e) => {
                    error!("dequeue failed, backing off: {}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        info!("worker stopped");
    }

    async fn execute(&self, payload: JobPayload) {
        let JobPayload {
            job_id,
            function,
            args,
            ..
        } = payload;
        info!("job {} ({}) started", job_id, function);

        if let Err(e) = self
            .broker
            .record_status(&job_id, JobStatus::Started, None, None)
            .await
        {
            warn!("could not mark job {} started: {}", job_id, e);
        }

        let outcome = tokio::time::timeout(JOB_TIMEOUT, dispatch(&self.ctx, &function, args)).await;

        let record = match outcome {
            Ok(Ok(result)) => self
                .broker
                .record_status(&job_id, JobStatus::Finished, Some(result), None)
                .await,
            Ok(Err(e)) => {
                error!("job {} ({}) failed: {}", job_id, function, e);
                self.broker
                    .record_status(&job_id, JobStatus::Failed, None, Some(e.to_string()))
                    .await
            }
            Err(_) => {
                error!("job {} ({}) timed out after {:?}", job_id, function, JOB_TIMEOUT);
                self.broker
                    .record_status(
                        &job_id,
                        JobStatus::Failed,
                        None,
                        Some(format!("timed out after {:?}", JOB_TIMEOUT)),
                    )
                    .await
            }
        };
        if let Err(e) = record {
            warn!("could not record final status for job {}: {}", job_id, e);
        }
    }
}
