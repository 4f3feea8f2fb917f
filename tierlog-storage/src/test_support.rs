// Shared fixtures for the unit tests of this crate

use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tierlog_core::storage::{ObjectWriter, S3Operator};
use tierlog_core::{EncodedRecordBatch, Result, StorageError, StreamRecordBatch};

use crate::cloud::{BackendConfig, CloudStore, LocalBackend};

pub(crate) fn batch(stream_id: u64, base_offset: u64, count: u32, payload_len: usize) -> StreamRecordBatch {
    let payload: Vec<u8> = (0..payload_len).map(|i| (base_offset as usize + i) as u8).collect();
    StreamRecordBatch::new(stream_id, 1, base_offset, count, Bytes::from(payload))
}

pub(crate) fn encoded(stream_id: u64, base_offset: u64, count: u32, payload_len: usize) -> EncodedRecordBatch {
    EncodedRecordBatch::from_batch(&batch(stream_id, base_offset, count, payload_len)).expect("encode")
}

pub(crate) fn memory_store() -> CloudStore {
    CloudStore::new(BackendConfig::Local {
        backend: LocalBackend::Memory,
        root: "tierlog-test".to_string(),
    })
    .expect("create memory store")
}

/// Operator over an in-memory store that can be told to fail the next writer opens and
/// records ranged reads and deletes.
#[derive(Debug)]
pub(crate) struct FlakyOperator {
    inner: CloudStore,
    failing_writers: AtomicUsize,
    range_reads: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl FlakyOperator {
    pub(crate) fn new() -> Self {
        Self {
            inner: memory_store(),
            failing_writers: AtomicUsize::new(0),
            range_reads: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_next_writers(&self, n: usize) {
        self.failing_writers.store(n, Ordering::SeqCst);
    }

    pub(crate) fn range_reads(&self) -> usize {
        self.range_reads.load(Ordering::SeqCst)
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deleted.lock().expect("deleted lock").clone()
    }

    pub(crate) fn store(&self) -> &CloudStore {
        &self.inner
    }
}

#[async_trait]
impl S3Operator for FlakyOperator {
    async fn writer(&self, path: &str, part_size: usize) -> Result<Box<dyn ObjectWriter>> {
        let failing = self
            .failing_writers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::ObjectStorage(format!("injected failure for {}", path)));
        }
        self.inner.writer(path, part_size).await
    }

    async fn range_read(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.range_read(path, range).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.deleted.lock().expect("deleted lock").push(path.to_string());
        self.inner.delete(path).await
    }
}

pub(crate) fn flaky_operator() -> Arc<FlakyOperator> {
    Arc::new(FlakyOperator::new())
}
