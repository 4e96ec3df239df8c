//! Streaming line-by-line parser for a job's input file.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use batchctl_common::blob::BlobStore;

use crate::engine::ChatRequest;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read input file: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob storage error: {0}")]
    Blob(#[from] batchctl_common::blob::BlobError),
    #[error("first record is not valid JSON: {0}")]
    FirstRecordInvalid(String),
}

/// Result of counting an input file's total record count and validating its first line.
pub struct InputSummary {
    pub total_requests: i64,
}

/// Validates the input file by reading its first record and counting total lines. Fails the
/// job with `InvalidInput` at the caller if parsing fails on the first record or the file is
/// empty; malformed records elsewhere in the stream become per-record errors during execution,
/// not a validation failure.
pub async fn summarize(blobs: &BlobStore, file_id: &str) -> Result<InputSummary, InputError> {
    let file = blobs.open_reader(file_id).await?;
    let mut reader = BufReader::new(file).lines();

    let mut total_requests: i64 = 0;
    let mut first_line: Option<String> = None;

    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if first_line.is_none() {
            first_line = Some(line.clone());
        }
        total_requests += 1;
    }

    match first_line {
        None => Err(InputError::FirstRecordInvalid("input file is empty".to_string())),
        Some(line) => {
            serde_json::from_str::<ChatRequest>(&line)
                .map_err(|e| InputError::FirstRecordInvalid(e.to_string()))?;
            Ok(InputSummary { total_requests })
        }
    }
}

/// Reads all requests starting at `skip` records (used when resuming mid-job, to avoid
/// re-parsing chunks already checkpointed past). Malformed lines become a parse-error result
/// embedded as a failed `ChatRequest` placeholder rather than aborting the read.
pub async fn read_from(
    blobs: &BlobStore,
    file_id: &str,
    skip: usize,
) -> Result<Vec<Result<ChatRequest, (String, String)>>, InputError> {
    let file = blobs.open_reader(file_id).await?;
    let mut reader = BufReader::new(file).lines();

    let mut records = Vec::new();
    let mut index = 0usize;

    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if index < skip {
            index += 1;
            continue;
        }
        match serde_json::from_str::<ChatRequest>(&line) {
            Ok(req) => records.push(Ok(req)),
            Err(e) => records.push(Err((format!("line-{index}"), e.to_string()))),
        }
        index += 1;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summarize_counts_lines_and_validates_first_record() {
        let dir = std::env::temp_dir().join(format!("batchctl-input-test-{}", std::process::id()));
        let store = BlobStore::new(&dir);
        store.ensure_root().await.unwrap();
        store
            .write_all(
                "in",
                b"{\"custom_id\":\"a\",\"body\":{}}\n{\"custom_id\":\"b\",\"body\":{}}\n",
            )
            .await
            .unwrap();

        let summary = summarize(&store, "in").await.unwrap();
        assert_eq!(summary.total_requests, 2);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn summarize_rejects_empty_file() {
        let dir =
            std::env::temp_dir().join(format!("batchctl-input-empty-test-{}", std::process::id()));
        let store = BlobStore::new(&dir);
        store.ensure_root().await.unwrap();
        store.write_all("in", b"").await.unwrap();

        let result = summarize(&store, "in").await;
        assert!(result.is_err());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
