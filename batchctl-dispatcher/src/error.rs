use thiserror::Error;

use batchctl_common::store::StoreError;

/// Errors surfaced while sending a single webhook delivery. Mirrors the teacher's
/// `WebhookError`: distinct terminal-vs-retryable request variants so `process_delivery` can
/// decide whether to retry without re-inspecting the underlying `reqwest::Error`.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to sign payload: {0}")]
    Signing(#[from] batchctl_common::signing::SigningError),
    #[error("a webhook could not be delivered but it could be retried later: {0}")]
    Retryable(reqwest::Error, Option<std::time::Duration>),
    #[error("a webhook could not be delivered and it cannot be retried further: {0}")]
    Terminal(reqwest::Error),
}

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
