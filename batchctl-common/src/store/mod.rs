//! Durable record store: jobs, files, the worker heartbeat, and webhook deliveries.
//!
//! Wraps a `sqlx::PgPool`. This module is the direct descendant of the teacher's
//! `hook_common::pgqueue::PgQueue`: the same `FOR UPDATE SKIP LOCKED` claim CTE and the same
//! compare-and-swap-on-status update pattern, generalized from a single `job_status` enum into
//! the richer batch-job lifecycle plus the heartbeat and webhook-delivery tables that hang off
//! it. Hand-written SQL via `query`/`query_as`, not the compile-time `query!` macro, so this
//! crate builds without a live database at compile time.

pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;

use crate::error::CoreError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(sqlx::Error),
    #[error("{command} query failed: {error}")]
    Query { command: &'static str, error: sqlx::Error },
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("queue is full")]
    QueueFull,
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => CoreError::NotFound(what),
            StoreError::Conflict(reason) => CoreError::Conflict(reason),
            StoreError::InvalidInput(reason) => CoreError::InvalidInput(reason),
            StoreError::QueueFull => CoreError::QueueFull,
            StoreError::Connection(e) => CoreError::Internal(e.to_string()),
            StoreError::Query { command, error } => {
                CoreError::Internal(format!("{command} query failed: {error}"))
            }
        }
    }
}

fn query_err(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |error| StoreError::Query { command, error }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Validating,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "file_purpose", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FilePurpose {
    Batch,
    BatchOutput,
    BatchError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "heartbeat_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    Idle,
    Loading,
    Processing,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "webhook_event", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    Completed,
    Failed,
    Progress,
}

impl std::fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WebhookEvent::Completed => "completed",
            WebhookEvent::Failed => "failed",
            WebhookEvent::Progress => "progress",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "webhook_delivery_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Succeeded,
    DeadLetter,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub purpose: FilePurpose,
    pub filename: String,
    pub bytes: i64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub priority: i16,

    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,

    pub model: String,

    pub total_requests: i64,
    pub completed_requests: i64,
    pub failed_requests: i64,
    pub tokens_processed: i64,

    pub created_at: DateTime<Utc>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub last_progress_update: Option<DateTime<Utc>>,

    pub current_chunk_index: i64,
    pub current_throughput: Option<f64>,
    pub estimated_completion_time: Option<DateTime<Utc>>,

    pub webhook_url: Option<String>,
    pub webhook_events: Vec<String>,

    pub metadata: Json,
    pub errors: Option<Json>,

    pub cancel_requested: bool,
}

impl Job {
    pub fn wants_webhook(&self, event: WebhookEvent) -> bool {
        let key = event.to_string();
        self.webhook_url.is_some() && self.webhook_events.iter().any(|e| *e == key)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Heartbeat {
    pub last_seen: DateTime<Utc>,
    pub status: HeartbeatState,
    pub loaded_model: Option<String>,
    pub model_loaded_at: Option<DateTime<Utc>>,
    pub worker_pid: Option<i32>,
    pub worker_started_at: Option<DateTime<Utc>>,
    pub current_job_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub job_id: String,
    pub event: WebhookEvent,
    pub url: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub state: DeliveryState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

pub struct NewJobSpec {
    pub id: String,
    pub input_file_id: String,
    pub model: String,
    pub priority: i16,
    pub total_requests: i64,
    pub webhook_url: Option<String>,
    pub webhook_events: Vec<String>,
    pub metadata: Json,
}

#[derive(Default, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

#[derive(Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub model: Option<String>,
}

#[derive(Default)]
pub struct JobHistoryFilter {
    pub status: Option<JobStatus>,
    pub model: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct JobStats {
    pub total: i64,
    pub succeeded: i64,
    pub success_rate: f64,
    pub average_duration_seconds: Option<f64>,
    pub average_throughput: Option<f64>,
}

pub struct NewWebhookDelivery {
    pub id: String,
    pub job_id: String,
    pub event: WebhookEvent,
    pub url: String,
    pub payload: Vec<u8>,
}

/// Patch applied by `transition_job`, alongside the status CAS. Only the fields relevant to the
/// target status need to be populated; timestamp columns are always stamped with `NOW()` by the
/// query itself based on the transition direction.
#[derive(Default)]
pub struct TransitionPatch {
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub errors: Option<Json>,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "MIGRATE",
                error: sqlx::Error::Migrate(Box::new(error)),
            })
    }

    // ---- Files -----------------------------------------------------------

    pub async fn create_file(
        &self,
        id: &str,
        purpose: FilePurpose,
        filename: &str,
        bytes: i64,
        sha256: &str,
    ) -> StoreResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(
            r#"
INSERT INTO files (id, purpose, filename, bytes, sha256)
VALUES ($1, $2, $3, $4, $5)
RETURNING id, purpose, filename, bytes, sha256, created_at
            "#,
        )
        .bind(id)
        .bind(purpose)
        .bind(filename)
        .bind(bytes)
        .bind(sha256)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err("INSERT files"))
    }

    pub async fn get_file(&self, id: &str) -> StoreResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT id, purpose, filename, bytes, sha256, created_at FROM files WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("SELECT files"))?
        .ok_or_else(|| StoreError::NotFound(format!("file {id}")))
    }

    // ---- Jobs --------------------------------------------------------------

    /// Inserts a new job with status=validating, failing with `QueueFull` if the runnable
    /// depth (validating + in_progress) is already at `max_queue_depth`. The depth check and
    /// insert happen in one transaction so a burst of concurrent creates can't all observe the
    /// same under-the-limit count.
    pub async fn create_job(&self, spec: NewJobSpec, max_queue_depth: i64) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await.map_err(query_err("BEGIN"))?;

        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('validating', 'in_progress')",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err("SELECT depth"))?;

        if depth >= max_queue_depth {
            tx.rollback().await.ok();
            return Err(StoreError::QueueFull);
        }

        let job = sqlx::query_as::<_, Job>(
            r#"
INSERT INTO jobs (
    id, status, priority, input_file_id, model, total_requests,
    webhook_url, webhook_events, metadata
)
VALUES ($1, 'validating', $2, $3, $4, $5, $6, $7, $8)
RETURNING *
            "#,
        )
        .bind(&spec.id)
        .bind(spec.priority)
        .bind(&spec.input_file_id)
        .bind(&spec.model)
        .bind(spec.total_requests)
        .bind(&spec.webhook_url)
        .bind(&spec.webhook_events)
        .bind(&spec.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err("INSERT jobs"))?;

        tx.commit().await.map_err(query_err("COMMIT"))?;
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> StoreResult<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT jobs"))?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    pub async fn list_jobs(&self, filter: JobFilter, page: Page) -> StoreResult<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
SELECT * FROM jobs
WHERE ($1::job_status IS NULL OR status = $1)
  AND ($2::text IS NULL OR model = $2)
ORDER BY created_at DESC
LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.status)
        .bind(filter.model)
        .bind(page.limit.max(1))
        .bind(page.offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("SELECT jobs"))
    }

    /// Same projection as `list_jobs` but defaults to terminal statuses and exposes a date
    /// range, for the `/v1/jobs/history` admin surface.
    pub async fn job_history(
        &self,
        filter: JobHistoryFilter,
        page: Page,
    ) -> StoreResult<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
SELECT * FROM jobs
WHERE ($1::job_status IS NULL OR status = $1)
  AND ($2::text IS NULL OR model = $2)
  AND ($3::timestamptz IS NULL OR created_at >= $3)
  AND ($4::timestamptz IS NULL OR created_at <= $4)
  AND (
    $1::job_status IS NOT NULL
    OR status IN ('completed', 'failed', 'cancelled', 'expired')
  )
ORDER BY created_at DESC
LIMIT $5 OFFSET $6
            "#,
        )
        .bind(filter.status)
        .bind(filter.model)
        .bind(filter.since)
        .bind(filter.until)
        .bind(page.limit.max(1))
        .bind(page.offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("SELECT job_history"))
    }

    pub async fn job_stats(&self, window: chrono::Duration) -> StoreResult<JobStats> {
        let since = Utc::now() - window;

        let row = sqlx::query(
            r#"
SELECT
    COUNT(*) FILTER (WHERE status IN ('completed', 'failed')) AS total,
    COUNT(*) FILTER (WHERE status = 'completed') AS succeeded,
    AVG(EXTRACT(EPOCH FROM (completed_at - in_progress_at)))
        FILTER (WHERE status = 'completed') AS avg_duration,
    AVG(current_throughput) FILTER (WHERE status = 'completed') AS avg_throughput
FROM jobs
WHERE created_at >= $1
  AND status IN ('completed', 'failed')
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err("SELECT job_stats"))?;

        let total: i64 = row.try_get("total").unwrap_or(0);
        let succeeded: i64 = row.try_get("succeeded").unwrap_or(0);
        let success_rate = if total > 0 {
            succeeded as f64 / total as f64
        } else {
            0.0
        };

        Ok(JobStats {
            total,
            succeeded,
            success_rate,
            average_duration_seconds: row.try_get("avg_duration").ok(),
            average_throughput: row.try_get("avg_throughput").ok(),
        })
    }

    /// Compare-and-swap on status. The only legal transitions are enumerated in the worker and
    /// API layers; this method only enforces that the row's current status still matches
    /// `from` at the moment of update.
    pub async fn transition_job(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        patch: TransitionPatch,
    ) -> StoreResult<Job> {
        let timestamp_column = match to {
            JobStatus::InProgress => "in_progress_at",
            JobStatus::Completed => "completed_at",
            JobStatus::Failed => "failed_at",
            JobStatus::Cancelled => "cancelled_at",
            JobStatus::Validating | JobStatus::Expired => "last_progress_update",
        };

        let sql = format!(
            r#"
UPDATE jobs
SET status = $3,
    {timestamp_column} = NOW(),
    output_file_id = COALESCE($4, output_file_id),
    error_file_id = COALESCE($5, error_file_id),
    errors = COALESCE($6, errors)
WHERE id = $1 AND status = $2
RETURNING *
            "#
        );

        let updated = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(from)
            .bind(to)
            .bind(&patch.output_file_id)
            .bind(&patch.error_file_id)
            .bind(&patch.errors)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("UPDATE jobs"))?;

        match updated {
            Some(job) => Ok(job),
            None => match self.get_job(id).await {
                Ok(_) => Err(StoreError::Conflict(format!(
                    "job {id} is not in status {from:?}"
                ))),
                Err(e) => Err(e),
            },
        }
    }

    /// Advances progress for an in_progress job. Guarded so a stale worker retrying an earlier
    /// chunk after a restart can never regress `current_chunk_index`.
    pub async fn update_progress(
        &self,
        id: &str,
        chunk_index: i64,
        completed_requests: i64,
        failed_requests: i64,
        tokens_processed: i64,
        throughput: f64,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET current_chunk_index = $2,
    completed_requests = $3,
    failed_requests = $4,
    tokens_processed = $5,
    current_throughput = $6,
    last_progress_update = NOW()
WHERE id = $1
  AND status = 'in_progress'
  AND current_chunk_index < $2
            "#,
        )
        .bind(id)
        .bind(chunk_index)
        .bind(completed_requests)
        .bind(failed_requests)
        .bind(tokens_processed)
        .bind(throughput)
        .execute(&self.pool)
        .await
        .map_err(query_err("UPDATE jobs progress"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "job {id} progress update rejected (not in_progress or chunk_index not advancing)"
            )));
        }
        Ok(())
    }

    /// Sets the cooperative-cancellation flag. Callers decide whether this also needs an
    /// immediate status transition (validating→cancelled happens synchronously; in_progress
    /// only sets the flag for the worker to observe at the next chunk boundary).
    pub async fn request_cancel(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET cancel_requested = TRUE WHERE id = $1 AND status IN ('validating', 'in_progress')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err("UPDATE jobs cancel_requested"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "job {id} is already in a terminal state"
            )));
        }
        Ok(())
    }

    /// Atomically selects the highest-priority, oldest validating job, transitions it to
    /// in_progress, and stamps the heartbeat's `current_job_id`, using the same
    /// `FOR UPDATE SKIP LOCKED` idiom as the teacher's `PgQueue::dequeue`.
    pub async fn claim_next_job(&self, worker_pid: i32) -> StoreResult<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(query_err("BEGIN"))?;

        let claimed = sqlx::query_as::<_, Job>(
            r#"
WITH head AS (
    SELECT id
    FROM jobs
    WHERE status = 'validating'
    ORDER BY priority DESC, created_at ASC, id ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE jobs
SET status = 'in_progress', in_progress_at = NOW()
FROM head
WHERE jobs.id = head.id
RETURNING jobs.*
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err("UPDATE claim_next_job"))?;

        if let Some(job) = &claimed {
            sqlx::query(
                "UPDATE worker_heartbeat SET current_job_id = $1, worker_pid = $2, status = 'processing' WHERE id = 1",
            )
            .bind(&job.id)
            .bind(worker_pid)
            .execute(&mut *tx)
            .await
            .map_err(query_err("UPDATE heartbeat current_job_id"))?;
        }

        tx.commit().await.map_err(query_err("COMMIT"))?;
        Ok(claimed)
    }

    /// One plus the count of validating jobs strictly ordered before this one. `None` for
    /// jobs that are in_progress (position 0, represented separately by callers) or terminal.
    pub async fn queue_position(&self, job: &Job) -> StoreResult<Option<i64>> {
        if job.status != JobStatus::Validating {
            return Ok(None);
        }

        let ahead: i64 = sqlx::query_scalar(
            r#"
SELECT COUNT(*) FROM jobs
WHERE status = 'validating'
  AND (
    priority > $1
    OR (priority = $1 AND created_at < $2)
    OR (priority = $1 AND created_at = $2 AND id < $3)
  )
            "#,
        )
        .bind(job.priority)
        .bind(job.created_at)
        .bind(&job.id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err("SELECT queue_position"))?;

        Ok(Some(ahead + 1))
    }

    pub async fn queue_depth(&self) -> StoreResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('validating', 'in_progress')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(query_err("SELECT queue_depth"))
    }

    /// Called once at worker startup (§4.5 step 3): any job left `in_progress` whose id is not
    /// the heartbeat's `current_job_id` is a stray from a crash before the heartbeat could be
    /// stamped, or from a replaced worker. Demote it back to validating for re-claim.
    pub async fn reconcile_stray_in_progress(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET status = 'validating', in_progress_at = NULL
WHERE status = 'in_progress'
  AND id NOT IN (
    SELECT current_job_id FROM worker_heartbeat
    WHERE id = 1 AND current_job_id IS NOT NULL
  )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err("UPDATE reconcile_stray_in_progress"))?;

        Ok(result.rows_affected())
    }

    /// Called once at worker startup alongside `reconcile_stray_in_progress` (§4.5 step 3): if
    /// the heartbeat's `current_job_id` still points at a row that is `in_progress`, that job
    /// was legitimately claimed by a prior process and survived the crash — it should be resumed
    /// from its persisted `current_chunk_index`, not reclaimed from scratch.
    pub async fn resumable_job(&self) -> StoreResult<Option<Job>> {
        let Some(heartbeat) = self.read_heartbeat().await? else {
            return Ok(None);
        };
        let Some(job_id) = heartbeat.current_job_id else {
            return Ok(None);
        };

        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 AND status = 'in_progress'")
            .bind(&job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT resumable_job"))
    }

    // ---- Heartbeat ---------------------------------------------------------

    pub async fn upsert_heartbeat(
        &self,
        status: HeartbeatState,
        loaded_model: Option<&str>,
        worker_pid: i32,
        worker_started_at: DateTime<Utc>,
        current_job_id: Option<&str>,
    ) -> StoreResult<Heartbeat> {
        sqlx::query_as::<_, Heartbeat>(
            r#"
INSERT INTO worker_heartbeat (id, last_seen, status, loaded_model, model_loaded_at, worker_pid, worker_started_at, current_job_id)
VALUES (1, NOW(), $1, $2, CASE WHEN $2 IS NOT NULL THEN NOW() ELSE NULL END, $3, $4, $5)
ON CONFLICT (id) DO UPDATE
SET last_seen = NOW(),
    status = EXCLUDED.status,
    loaded_model = EXCLUDED.loaded_model,
    model_loaded_at = CASE
        WHEN worker_heartbeat.loaded_model IS DISTINCT FROM EXCLUDED.loaded_model
        THEN NOW()
        ELSE worker_heartbeat.model_loaded_at
    END,
    worker_pid = EXCLUDED.worker_pid,
    worker_started_at = EXCLUDED.worker_started_at,
    current_job_id = EXCLUDED.current_job_id
RETURNING last_seen, status, loaded_model, model_loaded_at, worker_pid, worker_started_at, current_job_id
            "#,
        )
        .bind(status)
        .bind(loaded_model)
        .bind(worker_pid)
        .bind(worker_started_at)
        .bind(current_job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err("UPSERT heartbeat"))
    }

    /// `None` means the heartbeat row has never been written (fresh install); callers must
    /// treat that the same as "worker offline".
    pub async fn read_heartbeat(&self) -> StoreResult<Option<Heartbeat>> {
        sqlx::query_as::<_, Heartbeat>(
            "SELECT last_seen, status, loaded_model, model_loaded_at, worker_pid, worker_started_at, current_job_id FROM worker_heartbeat WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("SELECT heartbeat"))
    }

    // ---- Webhooks -----------------------------------------------------------

    pub async fn enqueue_webhook(&self, delivery: NewWebhookDelivery) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO webhook_deliveries (id, job_id, event, url, payload)
VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&delivery.id)
        .bind(&delivery.job_id)
        .bind(delivery.event)
        .bind(&delivery.url)
        .bind(&delivery.payload)
        .execute(&self.pool)
        .await
        .map_err(query_err("INSERT webhook_deliveries"))?;
        Ok(())
    }

    /// Claims up to `limit` due, pending deliveries via `FOR UPDATE SKIP LOCKED`, same idiom as
    /// `claim_next_job`, so several dispatcher workers in the same pool never race for a row.
    pub async fn claim_due_webhooks(&self, limit: i64) -> StoreResult<Vec<WebhookDelivery>> {
        sqlx::query_as::<_, WebhookDelivery>(
            r#"
WITH due AS (
    SELECT id
    FROM webhook_deliveries
    WHERE state = 'pending' AND next_attempt_at <= NOW()
    ORDER BY created_at ASC
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE webhook_deliveries
SET attempt_count = attempt_count + 1, last_attempt_at = NOW()
FROM due
WHERE webhook_deliveries.id = due.id
RETURNING webhook_deliveries.*
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("UPDATE claim_due_webhooks"))
    }

    /// Releases a just-claimed delivery back to `pending` without counting it as an attempt,
    /// used when the dispatcher defers a delivery to preserve per-job ordering rather than
    /// because sending it actually failed.
    pub async fn release_webhook(&self, id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE webhook_deliveries
SET attempt_count = GREATEST(attempt_count - 1, 0), next_attempt_at = NOW()
WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err("UPDATE release_webhook"))?;
        Ok(())
    }

    pub async fn mark_webhook_result(
        &self,
        id: &str,
        state: DeliveryState,
        next_attempt_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE webhook_deliveries
SET state = $2,
    next_attempt_at = COALESCE($3, next_attempt_at),
    last_error = $4
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(query_err("UPDATE mark_webhook_result"))?;
        Ok(())
    }

    pub async fn list_dead_letters(&self, page: Page) -> StoreResult<Vec<WebhookDelivery>> {
        sqlx::query_as::<_, WebhookDelivery>(
            r#"
SELECT * FROM webhook_deliveries
WHERE state = 'dead_letter'
ORDER BY created_at DESC
LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page.limit.max(1))
        .bind(page.offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("SELECT list_dead_letters"))
    }

    pub async fn requeue_dead_letter(&self, id: &str) -> StoreResult<WebhookDelivery> {
        sqlx::query_as::<_, WebhookDelivery>(
            r#"
UPDATE webhook_deliveries
SET state = 'pending', attempt_count = 0, next_attempt_at = NOW(), last_error = NULL
WHERE id = $1 AND state = 'dead_letter'
RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("UPDATE requeue_dead_letter"))?
        .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))
    }

    pub async fn delete_dead_letter(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM webhook_deliveries WHERE id = $1 AND state = 'dead_letter'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err("DELETE dead_letter"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("dead letter {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "./migrations")]
    async fn create_and_get_job_round_trips(pool: PgPool) {
        let store = Store::new(pool);
        store
            .create_file("file-1", FilePurpose::Batch, "input.jsonl", 100, "deadbeef")
            .await
            .unwrap();

        let job = store
            .create_job(
                NewJobSpec {
                    id: "job-1".to_string(),
                    input_file_id: "file-1".to_string(),
                    model: "llama-3-8b-instruct".to_string(),
                    priority: 0,
                    total_requests: 3,
                    webhook_url: None,
                    webhook_events: vec![],
                    metadata: serde_json::json!({}),
                },
                100,
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Validating);

        let fetched = store.get_job("job-1").await.unwrap();
        assert_eq!(fetched.id, job.id);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn queue_full_rejects_beyond_max_depth(pool: PgPool) {
        let store = Store::new(pool);
        store
            .create_file("file-1", FilePurpose::Batch, "input.jsonl", 100, "deadbeef")
            .await
            .unwrap();

        let spec = |id: &str| NewJobSpec {
            id: id.to_string(),
            input_file_id: "file-1".to_string(),
            model: "llama-3-8b-instruct".to_string(),
            priority: 0,
            total_requests: 1,
            webhook_url: None,
            webhook_events: vec![],
            metadata: serde_json::json!({}),
        };

        store.create_job(spec("job-1"), 1).await.unwrap();
        let err = store.create_job(spec("job-2"), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::QueueFull));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn claim_next_job_respects_priority_and_skip_locked(pool: PgPool) {
        let store = Store::new(pool);
        store
            .create_file("file-1", FilePurpose::Batch, "input.jsonl", 100, "deadbeef")
            .await
            .unwrap();

        let spec = |id: &str, priority: i16| NewJobSpec {
            id: id.to_string(),
            input_file_id: "file-1".to_string(),
            model: "llama-3-8b-instruct".to_string(),
            priority,
            total_requests: 1,
            webhook_url: None,
            webhook_events: vec![],
            metadata: serde_json::json!({}),
        };

        store.create_job(spec("low", 0), 10).await.unwrap();
        store.create_job(spec("high", 1), 10).await.unwrap();

        let claimed = store.claim_next_job(1234).await.unwrap().unwrap();
        assert_eq!(claimed.id, "high");
        assert_eq!(claimed.status, JobStatus::InProgress);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn transition_job_rejects_wrong_source_status(pool: PgPool) {
        let store = Store::new(pool);
        store
            .create_file("file-1", FilePurpose::Batch, "input.jsonl", 100, "deadbeef")
            .await
            .unwrap();
        store
            .create_job(
                NewJobSpec {
                    id: "job-1".to_string(),
                    input_file_id: "file-1".to_string(),
                    model: "llama-3-8b-instruct".to_string(),
                    priority: 0,
                    total_requests: 1,
                    webhook_url: None,
                    webhook_events: vec![],
                    metadata: serde_json::json!({}),
                },
                10,
            )
            .await
            .unwrap();

        let err = store
            .transition_job(
                "job-1",
                JobStatus::InProgress,
                JobStatus::Completed,
                TransitionPatch::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn heartbeat_fresh_install_is_none(pool: PgPool) {
        let store = Store::new(pool);
        assert!(store.read_heartbeat().await.unwrap().is_none());
    }
}
