//! Content-addressed local-disk storage for file bytes.
//!
//! The Store holds file metadata (id, purpose, byte length, sha256); the bytes themselves live
//! here, one file per blob, named by the file's id so lookups never require a directory scan.
//! `BlobWriter` is the append-only handle the worker holds open for the lifetime of a job's
//! output and error streams, flushed and fsynced at each checkpoint.

use std::io;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob io error: {0}")]
    Io(#[from] io::Error),
}

/// Root of the blob area on local disk. One `BlobStore` per process; the path is expected to be
/// a dedicated directory (not shared with anything else) so a full scan (never performed in
/// normal operation) would be safe.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, file_id: &str) -> PathBuf {
        self.root.join(file_id)
    }

    /// Ensures the blob root directory exists. Call once at startup.
    pub async fn ensure_root(&self) -> Result<(), BlobError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Reads an entire blob into memory. Used for small inputs and for re-reading checkpointed
    /// output during tests; the worker's main read path is `open_reader`, which streams.
    pub async fn read(&self, file_id: &str) -> Result<Vec<u8>, BlobError> {
        let mut file = File::open(self.path_for(file_id)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Opens a file for streaming, line-by-line reads (the worker's JSONL input parser).
    pub async fn open_reader(&self, file_id: &str) -> Result<File, BlobError> {
        Ok(File::open(self.path_for(file_id)).await?)
    }

    /// Writes an entire blob in one call and returns its sha256 digest, for inputs small enough
    /// to buffer (uploaded batch input files).
    pub async fn write_all(&self, file_id: &str, bytes: &[u8]) -> Result<String, BlobError> {
        let mut file = File::create(self.path_for(file_id)).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Opens (creating if necessary) an append-only writer for a job's output or error stream.
    /// Opens for append, seeding the running digest and byte count from any content already on
    /// disk so a worker resuming a job after a crash produces a correct final digest covering
    /// the whole file, not just the bytes appended in this process lifetime.
    pub async fn open_writer(&self, file_id: &str) -> Result<BlobWriter, BlobError> {
        let path = self.path_for(file_id);
        let mut hasher = Sha256::new();
        let mut bytes_written = 0u64;

        if let Ok(existing) = fs::read(&path).await {
            hasher.update(&existing);
            bytes_written = existing.len() as u64;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(BlobWriter {
            file,
            hasher,
            bytes_written,
        })
    }

    pub fn path(&self, file_id: &str) -> PathBuf {
        self.path_for(file_id)
    }
}

/// Append-only handle a worker keeps open for the lifetime of a job's output or error stream.
/// `checkpoint` both flushes and fsyncs, which is what makes a completed checkpoint durable
/// against a crash of the worker process or the machine under it.
pub struct BlobWriter {
    file: File,
    hasher: Sha256,
    bytes_written: u64,
}

impl BlobWriter {
    pub async fn append_line(&mut self, line: &[u8]) -> Result<(), BlobError> {
        self.file.write_all(line).await?;
        self.file.write_all(b"\n").await?;
        self.hasher.update(line);
        self.hasher.update(b"\n");
        self.bytes_written += line.len() as u64 + 1;
        Ok(())
    }

    /// Flushes and fsyncs the underlying file. This is the durability boundary a checkpoint
    /// relies on: once this returns, the bytes survive a worker crash.
    pub async fn checkpoint(&mut self) -> Result<(), BlobError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Finalizes the blob, returning its total length and sha256 digest for registration in
    /// the Store as a completed `File` row.
    pub async fn finalize(mut self) -> Result<(u64, String), BlobError> {
        self.checkpoint().await?;
        let digest = hex::encode(self.hasher.clone().finalize());
        Ok((self.bytes_written, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_all_then_read_roundtrips() {
        let dir = std::env::temp_dir().join(format!("batchctl-blob-test-{}", std::process::id()));
        let store = BlobStore::new(&dir);
        store.ensure_root().await.unwrap();

        let digest = store.write_all("file-a", b"hello world").await.unwrap();
        let bytes = store.read("file-a").await.unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(digest.len(), 64);

        fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn writer_accumulates_lines_and_digest() {
        let dir =
            std::env::temp_dir().join(format!("batchctl-blob-writer-test-{}", std::process::id()));
        let store = BlobStore::new(&dir);
        store.ensure_root().await.unwrap();

        let mut writer = store.open_writer("out").await.unwrap();
        writer.append_line(b"{\"custom_id\":\"1\"}").await.unwrap();
        writer.append_line(b"{\"custom_id\":\"2\"}").await.unwrap();
        let (len, digest) = writer.finalize().await.unwrap();

        assert!(len > 0);
        assert_eq!(digest.len(), 64);

        let bytes = store.read("out").await.unwrap();
        assert_eq!(bytes, b"{\"custom_id\":\"1\"}\n{\"custom_id\":\"2\"}\n");

        fs::remove_dir_all(&dir).await.ok();
    }
}
