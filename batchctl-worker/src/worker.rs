//! The GPU-bound main loop: claim a job, validate it, load its model, run it to completion in
//! checkpointed chunks, and hand off lifecycle webhook events. Structured like the teacher's
//! `WebhookWorker`: a long-lived struct wrapping the store and its dependencies, with `run()`
//! as the entry point, generalized from "dequeue and POST a webhook job" to "dequeue and run a
//! multi-chunk inference job to completion."

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use batchctl_common::blob::BlobStore;
use batchctl_common::health::HealthHandle;
use batchctl_common::model::{self, ModelInfo};
use batchctl_common::retry::RetryPolicy;
use batchctl_common::store::{
    HeartbeatState, Job, JobStatus, NewWebhookDelivery, Store, TransitionPatch, WebhookEvent,
};

use crate::config::Config;
use crate::engine::{ChatRequest, ChatResult, InferenceEngine};
use crate::error::WorkerError;
use crate::input;

/// Mutable state shared between the main loop and the dedicated heartbeat timer task, so
/// heartbeats are never starved by a long-running chunk.
struct SharedState {
    status: HeartbeatState,
    current_job_id: Option<String>,
    loaded_model: Option<String>,
}

pub struct Worker<E: InferenceEngine> {
    store: Store,
    blobs: BlobStore,
    engine: Arc<E>,
    config: Config,
    health: HealthHandle,
    shared: Arc<Mutex<SharedState>>,
    worker_pid: i32,
    worker_started_at: chrono::DateTime<Utc>,
}

impl<E: InferenceEngine + 'static> Worker<E> {
    pub fn new(store: Store, blobs: BlobStore, engine: E, config: Config, health: HealthHandle) -> Self {
        Self {
            store,
            blobs,
            engine: Arc::new(engine),
            config,
            health,
            shared: Arc::new(Mutex::new(SharedState {
                status: HeartbeatState::Idle,
                current_job_id: None,
                loaded_model: None,
            })),
            worker_pid: std::process::id() as i32,
            worker_started_at: Utc::now(),
        }
    }

    /// Runs the worker forever. Returns only on an unrecoverable store/blob error; job-level
    /// failures never cause this to return.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        self.blobs.ensure_root().await?;
        self.spawn_heartbeat_task();

        let reconciled = self.store.reconcile_stray_in_progress().await?;
        if reconciled > 0 {
            warn!(count = reconciled, "reconciled stray in_progress jobs on startup");
        }

        if let Some(job) = self.store.resumable_job().await? {
            info!(
                job_id = %job.id,
                chunk_index = job.current_chunk_index,
                "resuming in_progress job left by a prior worker process"
            );
            self.set_current_job(Some(job.id.clone())).await;
            if let Err(e) = self.resume_job(job).await {
                error!(error = %e, "resumed job processing aborted with a worker error");
            }
            self.set_current_job(None).await;
        }

        loop {
            match self.store.claim_next_job(self.worker_pid).await? {
                Some(job) => {
                    self.set_current_job(Some(job.id.clone())).await;
                    if let Err(e) = self.process_job(job).await {
                        error!(error = %e, "job processing aborted with a worker error");
                    }
                    self.set_current_job(None).await;
                }
                None => {
                    tokio::time::sleep(self.config.poll_interval.value).await;
                }
            }
        }
    }

    async fn set_current_job(&self, job_id: Option<String>) {
        let mut shared = self.shared.lock().await;
        shared.current_job_id = job_id.clone();
        shared.status = if job_id.is_some() {
            HeartbeatState::Processing
        } else {
            HeartbeatState::Idle
        };
    }

    fn spawn_heartbeat_task(&self) {
        let store = self.store.clone();
        let shared = self.shared.clone();
        let health = self.health.clone();
        let interval = self.config.heartbeat_interval.value;
        let worker_pid = self.worker_pid;
        let worker_started_at = self.worker_started_at;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = shared.lock().await;
                let result = store
                    .upsert_heartbeat(
                        snapshot.status,
                        snapshot.loaded_model.as_deref(),
                        worker_pid,
                        worker_started_at,
                        snapshot.current_job_id.as_deref(),
                    )
                    .await;
                drop(snapshot);

                match result {
                    Ok(_) => health.report_healthy().await,
                    Err(e) => warn!(error = %e, "failed to write heartbeat"),
                }
            }
        });
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, model = %job.model))]
    async fn process_job(&mut self, job: Job) -> Result<(), WorkerError> {
        let model_info = match model::lookup(&job.model) {
            Some(info) => info.clone(),
            None => {
                self.fail_job(&job, "model is not registered").await?;
                return Ok(());
            }
        };

        let summary = match input::summarize(&self.blobs, &job.input_file_id).await {
            Ok(summary) => summary,
            Err(e) => {
                self.fail_job(&job, &format!("invalid input: {e}")).await?;
                return Ok(());
            }
        };

        if let Err(e) = self.ensure_model_loaded(&job.model).await {
            warn!(error = %e, "model load failed after retry budget");
            self.fail_job(&job, &format!("model load failed: {e}")).await?;
            return Ok(());
        }

        self.run_chunks(&job, &model_info, summary.total_requests)
            .await
    }

    /// Re-enters a job left `in_progress` by a prior, crashed worker process. The input file was
    /// already validated when the job was first claimed, and `run_chunks` already seeds its
    /// counters and chunk index from the row, so this only needs to (re)load the model before
    /// falling into the same chunk loop `process_job` uses.
    #[instrument(skip(self, job), fields(job_id = %job.id, model = %job.model))]
    async fn resume_job(&mut self, job: Job) -> Result<(), WorkerError> {
        let model_info = match model::lookup(&job.model) {
            Some(info) => info.clone(),
            None => {
                self.fail_job(&job, "model is not registered").await?;
                return Ok(());
            }
        };

        if let Err(e) = self.ensure_model_loaded(&job.model).await {
            warn!(error = %e, "model load failed after retry budget");
            self.fail_job(&job, &format!("model load failed: {e}")).await?;
            return Ok(());
        }

        let total_requests = job.total_requests;
        self.run_chunks(&job, &model_info, total_requests).await
    }

    async fn ensure_model_loaded(&mut self, model: &str) -> Result<(), crate::error::EngineError> {
        let currently_loaded = self.shared.lock().await.loaded_model.clone();
        if currently_loaded.as_deref() == Some(model) {
            return Ok(());
        }

        {
            let mut shared = self.shared.lock().await;
            shared.status = HeartbeatState::Loading;
        }

        if currently_loaded.is_some() {
            if let Err(e) = self.engine.unload_model().await {
                warn!(error = %e, "failed to unload previous model, continuing anyway");
            }
        }

        let policy = RetryPolicy::new(
            2.0,
            self.config.model_load_backoff.value,
            Some(self.config.model_load_backoff.value * 4u32),
        );

        let mut attempt = 0u32;
        loop {
            match self.engine.load_model(model).await {
                Ok(()) => {
                    self.shared.lock().await.loaded_model = Some(model.to_string());
                    return Ok(());
                }
                Err(e) if attempt + 1 >= self.config.model_load_max_attempts => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "model load attempt failed, retrying");
                    let _ = self.engine.unload_model().await;
                    tokio::time::sleep(policy.time_until_next_retry(attempt, None)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_chunks(
        &mut self,
        job: &Job,
        model_info: &ModelInfo,
        total_requests: i64,
    ) -> Result<(), WorkerError> {
        let chunk_size = model_info.chunk_size();
        let num_chunks = ((total_requests + chunk_size as i64 - 1) / chunk_size as i64).max(1);

        let output_file_id = format!("{}-output", job.id);
        let error_file_id = format!("{}-error", job.id);
        let mut output_writer = self.blobs.open_writer(&output_file_id).await?;
        let mut error_writer = self.blobs.open_writer(&error_file_id).await?;

        let mut completed_requests = job.completed_requests;
        let mut failed_requests = job.failed_requests;
        let mut tokens_processed = job.tokens_processed;
        let mut chunk_index = job.current_chunk_index;

        while chunk_index < num_chunks {
            if self.cancellation_requested(&job.id).await? {
                self.cancel_job(job, &mut output_writer, &mut error_writer)
                    .await?;
                return Ok(());
            }

            let skip = (chunk_index * chunk_size as i64) as usize;
            let records = input::read_from(&self.blobs, &job.input_file_id, skip).await?;
            let take = chunk_size.min(records.len());
            let records: Vec<_> = records.into_iter().take(take).collect();

            let (requests, malformed): (Vec<_>, Vec<_>) =
                records.into_iter().partition(Result::is_ok);
            let requests: Vec<ChatRequest> = requests.into_iter().map(Result::unwrap).collect();
            let malformed: Vec<(String, String)> =
                malformed.into_iter().map(Result::unwrap_err).collect();

            let chunk_started_at = std::time::Instant::now();
            let results = self
                .run_chunk_with_retry(&job.model, requests)
                .await
                .unwrap_or_else(|records| records);
            let chunk_elapsed = chunk_started_at.elapsed();

            let mut chunk_tokens = 0u64;
            for (result, tokens) in &results {
                write_result(&mut output_writer, &mut error_writer, result).await?;
                if result.is_success() {
                    completed_requests += 1;
                    chunk_tokens += *tokens;
                } else {
                    failed_requests += 1;
                }
            }

            for (custom_id, reason) in malformed {
                let failed = ChatResult::failed(custom_id, reason, "invalid_record");
                write_result(&mut output_writer, &mut error_writer, &failed).await?;
                failed_requests += 1;
            }

            tokens_processed += chunk_tokens as i64;
            chunk_index += 1;
            output_writer.checkpoint().await?;
            error_writer.checkpoint().await?;

            let throughput = chunk_tokens as f64 / chunk_elapsed.as_secs_f64().max(0.001);

            self.store
                .update_progress(
                    &job.id,
                    chunk_index,
                    completed_requests,
                    failed_requests,
                    tokens_processed,
                    throughput,
                )
                .await?;

            let mut progress_snapshot = job.clone();
            progress_snapshot.completed_requests = completed_requests;
            progress_snapshot.failed_requests = failed_requests;
            self.enqueue_event(&progress_snapshot, WebhookEvent::Progress).await?;
        }

        let (out_len, out_sha) = output_writer.finalize().await?;
        let (err_len, err_sha) = error_writer.finalize().await?;

        self.store
            .create_file(
                &output_file_id,
                batchctl_common::store::FilePurpose::BatchOutput,
                "output.jsonl",
                out_len as i64,
                &out_sha,
            )
            .await?;
        self.store
            .create_file(
                &error_file_id,
                batchctl_common::store::FilePurpose::BatchError,
                "error.jsonl",
                err_len as i64,
                &err_sha,
            )
            .await?;

        let updated = self
            .store
            .transition_job(
                &job.id,
                JobStatus::InProgress,
                JobStatus::Completed,
                TransitionPatch {
                    output_file_id: Some(output_file_id),
                    error_file_id: Some(error_file_id),
                    errors: None,
                },
            )
            .await?;

        info!(
            completed_requests,
            failed_requests, "job completed"
        );
        self.enqueue_event(&updated, WebhookEvent::Completed).await?;
        Ok(())
    }

    /// Runs one chunk, retrying at the chunk level up to `ChunkRetryLimit` on engine errors or
    /// timeouts. On exhaustion, every record in the chunk becomes a per-record failure (the
    /// `Err` branch) rather than aborting the job. Each result is paired with the tokens it
    /// produced (zero for a failure) so the caller can accumulate `tokens_processed`.
    async fn run_chunk_with_retry(
        &self,
        model: &str,
        requests: Vec<ChatRequest>,
    ) -> Result<Vec<(ChatResult, u64)>, Vec<(ChatResult, u64)>> {
        let custom_ids: Vec<String> = requests.iter().map(|r| r.custom_id.clone()).collect();
        let mut attempt = 0u32;

        loop {
            let result = tokio::time::timeout(
                StdDuration::from_secs(120),
                self.engine.infer(model, requests.clone()),
            )
            .await;

            match result {
                Ok(Ok(results)) => return Ok(results),
                Ok(Err(e)) if attempt + 1 >= self.config.chunk_retry_limit => {
                    warn!(error = %e, "chunk exhausted retry budget, marking records failed");
                    return Err(custom_ids
                        .into_iter()
                        .map(|id| (ChatResult::failed(id, e.to_string(), "inference_engine_error"), 0))
                        .collect());
                }
                Err(_) if attempt + 1 >= self.config.chunk_retry_limit => {
                    return Err(custom_ids
                        .into_iter()
                        .map(|id| {
                            (
                                ChatResult::failed(
                                    id,
                                    "inference request timed out".to_string(),
                                    "inference_timeout",
                                ),
                                0,
                            )
                        })
                        .collect());
                }
                _ => {
                    attempt += 1;
                }
            }
        }
    }

    async fn cancellation_requested(&self, job_id: &str) -> Result<bool, WorkerError> {
        let job = self.store.get_job(job_id).await?;
        Ok(job.cancel_requested)
    }

    async fn cancel_job(
        &self,
        job: &Job,
        output_writer: &mut batchctl_common::blob::BlobWriter,
        error_writer: &mut batchctl_common::blob::BlobWriter,
    ) -> Result<(), WorkerError> {
        output_writer.checkpoint().await?;
        error_writer.checkpoint().await?;
        self.store
            .transition_job(
                &job.id,
                JobStatus::InProgress,
                JobStatus::Cancelled,
                TransitionPatch::default(),
            )
            .await?;
        info!("job cancelled at chunk boundary");
        Ok(())
    }

    async fn fail_job(&self, job: &Job, reason: &str) -> Result<(), WorkerError> {
        let updated = self
            .store
            .transition_job(
                &job.id,
                job.status,
                JobStatus::Failed,
                TransitionPatch {
                    output_file_id: None,
                    error_file_id: None,
                    errors: Some(serde_json::json!({"message": reason})),
                },
            )
            .await?;
        self.enqueue_event(&updated, WebhookEvent::Failed).await?;
        Ok(())
    }

    async fn enqueue_event(&self, job: &Job, event: WebhookEvent) -> Result<(), WorkerError> {
        if !job.wants_webhook(event) {
            return Ok(());
        }
        let url = job.webhook_url.clone().expect("checked by wants_webhook");
        let payload = serde_json::json!({
            "event": match event {
                WebhookEvent::Completed => "completed",
                WebhookEvent::Failed => "failed",
                WebhookEvent::Progress => "progress",
            },
            "batch_id": job.id,
            "status": job.status,
            "request_counts": {
                "completed": job.completed_requests,
                "failed": job.failed_requests,
                "total": job.total_requests,
            },
            "created_at": job.created_at,
            "completed_at": job.completed_at,
            "output_file_id": job.output_file_id,
            "error_file_id": job.error_file_id,
            "metadata": job.metadata,
        });

        self.store
            .enqueue_webhook(NewWebhookDelivery {
                id: uuid::Uuid::now_v7().to_string(),
                job_id: job.id.clone(),
                event,
                url,
                payload: serde_json::to_vec(&payload).unwrap_or_default(),
            })
            .await?;
        Ok(())
    }
}

async fn write_result(
    output_writer: &mut batchctl_common::blob::BlobWriter,
    error_writer: &mut batchctl_common::blob::BlobWriter,
    result: &ChatResult,
) -> Result<(), WorkerError> {
    let line = serde_json::to_vec(result).unwrap_or_default();
    if result.is_success() {
        output_writer.append_line(&line).await?;
    } else {
        error_writer.append_line(&line).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use batchctl_common::health::HealthRegistry;
    use batchctl_common::store::{FilePurpose, JobStatus, NewJobSpec};

    use super::*;
    use crate::engine::StubInferenceEngine;

    fn test_config() -> Config {
        Config {
            host: "0.0.0.0".to_string(),
            port: 0,
            database_url: "postgres://localhost/test".parse().unwrap(),
            max_pg_connections: 5,
            blob_root: std::env::temp_dir().to_string_lossy().to_string(),
            heartbeat_interval: "5000".parse().unwrap(),
            poll_interval: "1000".parse().unwrap(),
            model_load_max_attempts: 3,
            model_load_backoff: "10000".parse().unwrap(),
            chunk_retry_limit: 3,
            lock_file_path: "./worker.lock".to_string(),
        }
    }

    /// Reproduces the scenario a maintainer flagged: a job whose `in_progress` row survived a
    /// crash and whose heartbeat still points at it (the legitimate resume case, as opposed to
    /// `reconcile_stray_in_progress`'s stray-row case) must pick back up from its persisted
    /// `current_chunk_index` rather than sit there forever or get silently reclaimed.
    #[sqlx::test(migrations = "../batchctl-common/migrations")]
    async fn resumes_an_in_progress_job_from_its_persisted_chunk_index(pool: PgPool) {
        let store = Store::new(pool);
        let blobs = BlobStore::new(std::env::temp_dir().join(format!(
            "batchctl-worker-resume-test-{}",
            std::process::id()
        )));
        blobs.ensure_root().await.unwrap();

        // chunk_size for llama-3-8b-instruct is 50, so 120 requests need 3 chunks (50/50/20).
        let lines: String = (0..120)
            .map(|i| format!("{{\"custom_id\":\"r{i}\",\"body\":{{}}}}\n"))
            .collect();
        blobs.write_all("resume-input", lines.as_bytes()).await.unwrap();
        store
            .create_file("resume-input", FilePurpose::Batch, "input.jsonl", lines.len() as i64, "deadbeef")
            .await
            .unwrap();

        store
            .create_job(
                NewJobSpec {
                    id: "resume-job".to_string(),
                    input_file_id: "resume-input".to_string(),
                    model: "llama-3-8b-instruct".to_string(),
                    priority: 0,
                    total_requests: 120,
                    webhook_url: None,
                    webhook_events: vec![],
                    metadata: serde_json::json!({}),
                },
                10,
            )
            .await
            .unwrap();

        // Simulate a worker that claimed the job, completed chunk 0, checkpointed progress, and
        // then crashed before claiming chunk 1 — the heartbeat still names this job.
        let claimed = store.claim_next_job(4242).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::InProgress);
        store
            .update_progress("resume-job", 1, 50, 0, 600, 10.0)
            .await
            .unwrap();

        let resumable = store
            .resumable_job()
            .await
            .unwrap()
            .expect("heartbeat still names the crashed job as in_progress");
        assert_eq!(resumable.id, "resume-job");
        assert_eq!(resumable.current_chunk_index, 1);
        assert_eq!(resumable.completed_requests, 50);

        let liveness = HealthRegistry::new("batchctl-worker-test");
        let health = liveness
            .register("worker".to_string(), time::Duration::seconds(30))
            .await;
        let mut worker = Worker::new(store.clone(), blobs, StubInferenceEngine, test_config(), health);

        worker.resume_job(resumable).await.unwrap();

        let finished = store.get_job("resume-job").await.unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.completed_requests, 120);
        assert_eq!(finished.failed_requests, 0);
        assert_eq!(finished.current_chunk_index, 3);
    }
}
