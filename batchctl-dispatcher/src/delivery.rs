//! The delivery pool: a semaphore-bounded set of tasks draining due `webhook_deliveries` rows.
//!
//! Structured directly on the teacher's `hook_worker::worker::WebhookWorker`: a polling loop
//! that reports liveness on every tick, a `tokio::sync::Semaphore` limiting concurrent sends,
//! and a per-job in-flight set (a `DashMap` standing in for the teacher's single-queue-name
//! design, since this dispatcher interleaves events for many independent jobs).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::StatusCode;
use tracing::{error, warn};

use batchctl_common::health::HealthHandle;
use batchctl_common::retry::RetryPolicy;
use batchctl_common::signing;
use batchctl_common::store::{DeliveryState, Store, WebhookDelivery};

use crate::config::Config;
use crate::error::DeliveryError;

pub struct Dispatcher {
    store: Store,
    client: reqwest::Client,
    config: Config,
    retry_policy: RetryPolicy,
    health: HealthHandle,
    in_flight_jobs: Arc<DashMap<String, ()>>,
}

impl Dispatcher {
    pub fn new(store: Store, config: Config, health: HealthHandle) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout.value)
            .user_agent("batchctl-dispatcher")
            .build()
            .expect("failed to construct reqwest client for webhook dispatcher");

        Self {
            store,
            client,
            retry_policy: RetryPolicy::new(2.0, Duration::from_secs(2), Some(Duration::from_secs(300))),
            config,
            health,
            in_flight_jobs: Arc::new(DashMap::new()),
        }
    }

    pub async fn run(&self) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_concurrent_deliveries));
        let mut interval = tokio::time::interval(self.config.poll_interval.value);

        loop {
            interval.tick().await;
            self.health.report_healthy().await;

            let claimed = match self.store.claim_due_webhooks(self.config.claim_batch_size).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "failed to claim due webhook deliveries");
                    continue;
                }
            };

            for delivery in claimed {
                if self.in_flight_jobs.contains_key(&delivery.job_id) {
                    if let Err(e) = self.store.release_webhook(&delivery.id).await {
                        error!(error = %e, delivery_id = %delivery.id, "failed to release deferred delivery");
                    }
                    continue;
                }

                self.in_flight_jobs.insert(delivery.job_id.clone(), ());

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
                let client = self.client.clone();
                let store = self.store.clone();
                let secret = self.config.signing_secret.value.clone();
                let retry_policy = self.retry_policy;
                let max_attempts = self.config.max_attempts;
                let in_flight_jobs = self.in_flight_jobs.clone();

                tokio::spawn(async move {
                    let job_id = delivery.job_id.clone();
                    process_delivery(&store, &client, &secret, &retry_policy, max_attempts, delivery).await;
                    in_flight_jobs.remove(&job_id);
                    drop(permit);
                });
            }
        }
    }
}

async fn process_delivery(
    store: &Store,
    client: &reqwest::Client,
    secret: &str,
    retry_policy: &RetryPolicy,
    max_attempts: u32,
    delivery: WebhookDelivery,
) {
    let labels = [("event", delivery.event.to_string())];
    let timestamp = chrono::Utc::now().timestamp();

    match send(client, secret, timestamp, &delivery).await {
        Ok(()) => {
            if let Err(e) = store.mark_webhook_result(&delivery.id, DeliveryState::Succeeded, None, None).await {
                error!(error = %e, delivery_id = %delivery.id, "failed to mark webhook delivery succeeded");
            }
            metrics::counter!(batchctl_common::metrics::names::WEBHOOK_DELIVERIES_TOTAL, &labels).increment(1);
        }
        Err(DeliveryError::Retryable(err, retry_after)) if (delivery.attempt_count as u32) < max_attempts => {
            let delay = retry_policy.time_until_next_retry_jittered(delivery.attempt_count as u32, retry_after);
            let next_attempt_at = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            warn!(delivery_id = %delivery.id, error = %err, attempt = delivery.attempt_count, "webhook delivery failed, will retry");
            if let Err(e) = store
                .mark_webhook_result(&delivery.id, DeliveryState::Pending, Some(next_attempt_at), Some(&err.to_string()))
                .await
            {
                error!(error = %e, delivery_id = %delivery.id, "failed to schedule webhook retry");
            }
        }
        Err(err) => {
            error!(delivery_id = %delivery.id, error = %err, attempt = delivery.attempt_count, "webhook delivery exhausted retries, moving to dead letter");
            if let Err(e) = store
                .mark_webhook_result(&delivery.id, DeliveryState::DeadLetter, None, Some(&err.to_string()))
                .await
            {
                error!(error = %e, delivery_id = %delivery.id, "failed to move webhook delivery to dead letter");
            }
        }
    }
}

async fn send(
    client: &reqwest::Client,
    secret: &str,
    timestamp: i64,
    delivery: &WebhookDelivery,
) -> Result<(), DeliveryError> {
    let signature = signing::sign_payload(secret, timestamp, &delivery.payload)?;

    let response = client
        .post(&delivery.url)
        .header("Content-Type", "application/json")
        .header("X-Signature", signature)
        .header("X-Timestamp", timestamp.to_string())
        .header("X-Event", delivery.event.to_string())
        .header("X-Batch-Id", delivery.job_id.clone())
        .body(delivery.payload.clone())
        .send()
        .await
        .map_err(|e| DeliveryError::Retryable(e, None))?;

    let retry_after = parse_retry_after_header(response.headers());

    match response.error_for_status() {
        Ok(_) => Ok(()),
        Err(err) => {
            let status = err.status().expect("status is set on a response error");
            if is_retryable_status(status) {
                Err(DeliveryError::Retryable(err, retry_after))
            } else {
                Err(DeliveryError::Terminal(err))
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 425
        || status.is_server_error()
}

/// Parses a `Retry-After` response header, which may be either a number of seconds or an
/// RFC 2822 date, returning `None` if the header is absent or malformed.
fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let target = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (chrono::DateTime::<chrono::Utc>::from(target) - chrono::Utc::now())
        .to_std()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_include_429_and_5xx() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
    }

    #[test]
    fn non_retryable_statuses_are_terminal() {
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn parses_retry_after_in_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn parses_retry_after_as_rfc2822_date() {
        let target = chrono::Utc::now() + chrono::Duration::seconds(60);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, target.to_rfc2822().parse().unwrap());
        let duration = parse_retry_after_header(&headers).expect("rfc2822 date should parse");
        assert!(duration.as_secs() > 0 && duration.as_secs() <= 61);
    }

    #[test]
    fn missing_or_malformed_retry_after_is_none() {
        assert_eq!(parse_retry_after_header(&reqwest::header::HeaderMap::new()), None);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "not-a-duration".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), None);
    }
}
