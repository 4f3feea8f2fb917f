use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tierlog_core::storage::{ObjectWriter, S3Operator};
use tierlog_core::{Result, StorageError, StreamRecordBatch};
use tierlog_storage::{
    AckMode, BackendConfig, CloudStore, LocalBackend, MemoryObjectManager, MemoryWriteAheadLog,
    S3Storage, StorageConfig,
};

/// Install a tracing subscriber honoring RUST_LOG; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Batch whose payload encodes the stream and base offset, so reads can be checked byte-wise.
pub fn make_batch(stream_id: u64, base_offset: u64, count: u32, payload_len: usize) -> StreamRecordBatch {
    let mut payload = format!("s{}-o{}:", stream_id, base_offset).into_bytes();
    payload.resize(payload_len.max(payload.len()), b'.');
    StreamRecordBatch::new(stream_id, 1, base_offset, count, Bytes::from(payload))
}

/// Encoded size in the log cache of a batch built by [`make_batch`].
#[allow(dead_code)]
pub fn encoded_len(stream_id: u64, base_offset: u64, count: u32, payload_len: usize) -> usize {
    tierlog_core::StreamRecordBatchCodec::encode(&make_batch(stream_id, base_offset, count, payload_len))
        .expect("encode")
        .len()
}

pub fn memory_store() -> CloudStore {
    CloudStore::new(BackendConfig::Local {
        backend: LocalBackend::Memory,
        root: "integration-test".to_string(),
    })
    .expect("create memory store")
}

/// Engine wired to in-memory collaborators.
pub struct Fixture {
    pub storage: S3Storage,
    pub wal: Arc<MemoryWriteAheadLog>,
    pub object_manager: Arc<MemoryObjectManager>,
}

#[allow(dead_code)]
pub fn fixture(config: StorageConfig, ack_mode: AckMode) -> Fixture {
    fixture_with_operator(config, ack_mode, Arc::new(memory_store()))
}

pub fn fixture_with_operator(
    config: StorageConfig,
    ack_mode: AckMode,
    operator: Arc<dyn S3Operator>,
) -> Fixture {
    init_tracing();
    let wal = Arc::new(MemoryWriteAheadLog::new(ack_mode));
    let object_manager = Arc::new(MemoryObjectManager::new());
    let storage =
        S3Storage::with_object_store(config, wal.clone(), object_manager.clone(), operator)
            .expect("create storage");
    Fixture {
        storage,
        wal,
        object_manager,
    }
}

/// Waits for a condition to be true with timeout
pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

/// Object store whose writers fail while `failing` is set.
#[derive(Debug)]
pub struct SwitchableOperator {
    inner: CloudStore,
    failing: AtomicBool,
}

#[allow(dead_code)]
impl SwitchableOperator {
    pub fn new(failing: bool) -> Self {
        Self {
            inner: memory_store(),
            failing: AtomicBool::new(failing),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn object_exists(&self, path: &str) -> bool {
        self.inner.exists(path).await.unwrap_or(false)
    }
}

#[async_trait]
impl S3Operator for SwitchableOperator {
    async fn writer(&self, path: &str, part_size: usize) -> Result<Box<dyn ObjectWriter>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::ObjectStorage(format!("object store unavailable: {}", path)));
        }
        self.inner.writer(path, part_size).await
    }

    async fn range_read(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        self.inner.range_read(path, range).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }
}
