use thiserror::Error;

use batchctl_common::blob::BlobError;
use batchctl_common::store::StoreError;

/// Enumeration of errors that can abort the worker's main loop. Most job-level failures (a
/// model that refuses to load, a chunk that errors out) are not worker errors: they transition
/// the job to `failed` and the worker keeps running. These variants are reserved for failures
/// that mean the worker process itself must stop and let the watchdog restart it.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a store error occurred: {0}")]
    Store(#[from] StoreError),
    #[error("a blob storage error occurred: {0}")]
    Blob(#[from] BlobError),
    #[error("another worker already holds the GPU lock at {0}")]
    LockHeld(String),
    #[error("checkpoint write failed: {0}")]
    CheckpointIo(String),
}

/// Errors surfaced by the `InferenceEngine` trait boundary.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("model {0} failed to load: {1}")]
    LoadFailed(String, String),
    #[error("inference request timed out")]
    Timeout,
    #[error("inference engine error: {0}")]
    Other(String),
}
