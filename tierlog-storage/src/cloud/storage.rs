use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use std::ops::Range;
use tierlog_core::storage::{ObjectWriter, S3Operator};
use tierlog_core::{Result, StorageError};
use tracing::debug;

use crate::cloud::storage_config::BackendConfig;

// Parts in flight per multipart upload
const WRITER_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct CloudStore {
    provider: &'static str,
    /// Optional extra prefix for key joining (used by Local backends)
    pub(crate) root_prefix: String,
    /// Opendal operator
    pub(crate) op: Operator,
}

impl CloudStore {
    pub fn new(cfg: BackendConfig) -> Result<Self> {
        let (op, root_prefix) = cfg.build_operator()?;
        Ok(Self {
            provider: cfg.provider(),
            root_prefix,
            op,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Read a whole object.
    pub async fn get_object(&self, path: &str) -> Result<Bytes> {
        let key = self.join(path);
        let data = self
            .op
            .read(&key)
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("cloud get_object {}: {}", key, e)))?;
        Ok(data.to_bytes())
    }

    /// Whether an object exists under `path`.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.join(path);
        self.op
            .exists(&key)
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("cloud exists {}: {}", key, e)))
    }

    #[inline]
    fn join(&self, path: &str) -> String {
        let p = path.trim_matches('/');
        if self.root_prefix.is_empty() {
            p.to_string()
        } else {
            format!("{}/{}", self.root_prefix.trim_matches('/'), p)
        }
    }
}

#[async_trait]
impl S3Operator for CloudStore {
    /// Open a multipart-capable writer; parts are flushed every `part_size` bytes.
    async fn writer(&self, path: &str, part_size: usize) -> Result<Box<dyn ObjectWriter>> {
        let key = self.join(path);
        let writer = self
            .op
            .writer_with(&key)
            .chunk(part_size)
            .concurrent(WRITER_CONCURRENCY)
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("cloud writer_with {}: {}", key, e)))?;
        Ok(Box::new(CloudWriter {
            key,
            inner: writer,
            bytes_written: 0,
        }))
    }

    async fn range_read(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let key = self.join(path);
        let expected = range.end.saturating_sub(range.start);
        let buf = self
            .op
            .read_with(&key)
            .range(range.clone())
            .await
            .map_err(|e| {
                StorageError::ObjectStorage(format!(
                    "cloud read {} [{}, {}): {}",
                    key, range.start, range.end, e
                ))
            })?;
        if buf.len() as u64 != expected {
            return Err(StorageError::ObjectStorage(format!(
                "cloud read {}: short read, wanted {} bytes got {}",
                key,
                expected,
                buf.len()
            )));
        }
        Ok(buf.to_bytes())
    }

    /// Delete an object by key. No-op if object doesn't exist.
    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.join(path);
        self.op
            .delete(&key)
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("cloud delete {}: {}", key, e)))
    }
}

/// Streaming cloud writer wrapper.
pub struct CloudWriter {
    key: String,
    inner: opendal::Writer,
    bytes_written: u64,
}

#[async_trait]
impl ObjectWriter for CloudWriter {
    async fn write(&mut self, part: Bytes) -> Result<()> {
        let len = part.len() as u64;
        self.inner
            .write(part)
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("cloud write {}: {}", self.key, e)))?;
        self.bytes_written += len;
        Ok(())
    }

    async fn close(&mut self) -> Result<u64> {
        self.inner
            .close()
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("cloud close {}: {}", self.key, e)))?;
        debug!(target = "cloud", key = %self.key, bytes = self.bytes_written, "object written");
        Ok(self.bytes_written)
    }

    async fn abort(&mut self) -> Result<()> {
        self.inner
            .abort()
            .await
            .map_err(|e| StorageError::ObjectStorage(format!("cloud abort {}: {}", self.key, e)))
    }
}
