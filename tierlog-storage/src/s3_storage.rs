use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tierlog_core::storage::{BlockCache, ObjectManager, S3Operator, Storage, WriteAheadLog};
use tierlog_core::{EncodedRecordBatch, ReadDataBlock, Result, StorageError, StreamRecordBatch};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::block_cache::ObjectBlockCache;
use crate::config::{BackpressureMode, StorageConfig};
use crate::log_cache::LogCacheStats;
use crate::ordering::{MainCommand, OrderingContext};
use crate::upload_task::UploadTaskConfig;
use crate::uploader::{BackgroundUploader, UploadCommand};

// Bound of the ordering context's command queue
const MAIN_CHANNEL_CAPACITY: usize = 1024;

/// Completion handle of a submitted append.
///
/// The WAL offset is already assigned; awaiting the handle yields once the batch is durable
/// and every earlier batch of the same stream has been released.
#[derive(Debug)]
pub struct AppendHandle {
    offset: u64,
    rx: oneshot::Receiver<Result<()>>,
}

impl AppendHandle {
    /// WAL offset assigned to the batch.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Future for AppendHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(StorageError::Closed)))
    }
}

/// Tiered storage engine: WAL for durability, log cache for fresh reads, object store for
/// everything older.
///
/// Owns two tasks: the ordering context (sequencer + log cache) and the background
/// uploader. Must be created inside a tokio runtime and should be shut down with
/// [`S3Storage::close`].
#[derive(Debug)]
pub struct S3Storage {
    backpressure: BackpressureMode,
    main_tx: mpsc::Sender<MainCommand>,
    upload_tx: mpsc::UnboundedSender<UploadCommand>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl S3Storage {
    pub fn new(
        config: StorageConfig,
        wal: Arc<dyn WriteAheadLog>,
        object_manager: Arc<dyn ObjectManager>,
        block_cache: Arc<dyn BlockCache>,
        operator: Arc<dyn S3Operator>,
    ) -> Result<Self> {
        config.validate()?;
        let (main_tx, main_rx) = mpsc::channel(MAIN_CHANNEL_CAPACITY);
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();

        let uploader = BackgroundUploader::new(
            UploadTaskConfig {
                object_block_size: config.object_block_size,
                part_size: config.object_part_size,
                prepare_ttl: config.object_prepare_ttl(),
                retry: config.upload_retry.clone(),
            },
            wal.clone(),
            object_manager,
            operator,
            main_tx.clone(),
        );
        let ordering = OrderingContext::new(
            wal,
            block_cache,
            config.sequencer_capacity,
            config.log_cache_capacity,
            main_tx.clone(),
            upload_tx.clone(),
        );
        let tasks = vec![ordering.start(main_rx), uploader.start(upload_rx)];
        info!(
            target = "s3_storage",
            log_cache_capacity = config.log_cache_capacity,
            sequencer_capacity = config.sequencer_capacity,
            backpressure = ?config.backpressure,
            "tiered storage started"
        );

        Ok(Self {
            backpressure: config.backpressure,
            main_tx,
            upload_tx,
            permits: Arc::new(Semaphore::new(config.sequencer_capacity)),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    /// Build the engine with an [`ObjectBlockCache`] reading back from `operator`.
    pub fn with_object_store(
        config: StorageConfig,
        wal: Arc<dyn WriteAheadLog>,
        object_manager: Arc<dyn ObjectManager>,
        operator: Arc<dyn S3Operator>,
    ) -> Result<Self> {
        let block_cache = Arc::new(ObjectBlockCache::new(
            object_manager.clone(),
            operator.clone(),
            config.block_cache_capacity,
        ));
        Self::new(config, wal, object_manager, block_cache, operator)
    }

    /// Submit a batch to the WAL.
    ///
    /// Returns once the WAL assigned an offset and the batch is tracked for ordered release;
    /// the handle resolves at release. Batches submitted one after the other on a stream are
    /// released in that order.
    pub async fn submit(&self, batch: StreamRecordBatch) -> Result<AppendHandle> {
        self.ensure_open()?;
        let record = EncodedRecordBatch::from_batch(&batch)?;
        let permit = match self.backpressure {
            BackpressureMode::Wait => self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| StorageError::Closed)?,
            BackpressureMode::Fail => {
                self.permits
                    .clone()
                    .try_acquire_owned()
                    .map_err(|e| match e {
                        TryAcquireError::Closed => StorageError::Closed,
                        TryAcquireError::NoPermits => StorageError::Backpressure(
                            "too many appends in flight".to_string(),
                        ),
                    })?
            }
        };
        let (done, rx) = oneshot::channel();
        let (reply, offset_rx) = oneshot::channel();
        self.send(MainCommand::Append {
            record,
            permit: Some(permit),
            done,
            reply,
        })
        .await?;
        let offset = offset_rx.await.map_err(|_| StorageError::Closed)??;
        Ok(AppendHandle { offset, rx })
    }

    pub async fn append(&self, batch: StreamRecordBatch) -> Result<()> {
        self.submit(batch).await?.await
    }

    pub async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.send(MainCommand::Read {
            stream_id,
            start_offset,
            end_offset,
            max_bytes,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StorageError::Closed)?
    }

    /// Seal the open log cache block if it holds data of `stream_id` and wait for its upload.
    pub async fn force_upload(&self, stream_id: u64) -> Result<()> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.send(MainCommand::ForceUpload { stream_id, reply }).await?;
        rx.await.map_err(|_| StorageError::Closed)?
    }

    /// Re-run failed uploads in block order. Resolves with the first failure, if any.
    pub async fn retry_failed_uploads(&self) -> Result<()> {
        self.ensure_open()?;
        let (done, rx) = oneshot::channel();
        self.upload_tx
            .send(UploadCommand::RetryFailed { done })
            .map_err(|_| StorageError::Closed)?;
        rx.await.map_err(|_| StorageError::Closed)?
    }

    pub async fn wal_confirm_offset(&self) -> Result<Option<u64>> {
        let (reply, rx) = oneshot::channel();
        self.send(MainCommand::ConfirmOffset { reply }).await?;
        rx.await.map_err(|_| StorageError::Closed)
    }

    pub async fn cache_stats(&self) -> Result<LogCacheStats> {
        let (reply, rx) = oneshot::channel();
        self.send(MainCommand::CacheStats { reply }).await?;
        rx.await.map_err(|_| StorageError::Closed)
    }

    /// Stop accepting work, drain in-flight appends, reads and uploads, then stop both tasks.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(target = "s3_storage", "closing tiered storage");
        }
        self.permits.close();
        let (done, rx) = oneshot::channel();
        if self.main_tx.send(MainCommand::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(target = "s3_storage", error = %e, "storage task ended abnormally");
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    async fn send(&self, cmd: MainCommand) -> Result<()> {
        self.main_tx.send(cmd).await.map_err(|_| StorageError::Closed)
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn append(&self, batch: StreamRecordBatch) -> Result<()> {
        S3Storage::append(self, batch).await
    }

    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock> {
        S3Storage::read(self, stream_id, start_offset, end_offset, max_bytes).await
    }

    async fn force_upload(&self, stream_id: u64) -> Result<()> {
        S3Storage::force_upload(self, stream_id).await
    }

    async fn close(&self) {
        S3Storage::close(self).await
    }
}
