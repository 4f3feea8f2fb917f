use std::collections::BTreeMap;
use std::sync::Arc;
use tierlog_core::storage::{ObjectManager, S3Operator, WriteAheadLog};
use tierlog_core::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::log_cache::LogCacheBlock;
use crate::ordering::MainCommand;
use crate::upload_task::{UploadTaskConfig, WalObjectUploadTask};

/// Work accepted by the background upload context.
#[derive(Debug)]
pub(crate) enum UploadCommand {
    /// Upload an archived block; `done` resolves once the upload settled.
    Upload {
        block: Arc<LogCacheBlock>,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// Re-run every failed upload in block order.
    RetryFailed { done: oneshot::Sender<Result<()>> },
    /// Stop after the commands already queued.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockUploadState {
    Committed,
    Failed,
}

#[derive(Debug)]
struct OutstandingBlock {
    block: Arc<LogCacheBlock>,
    state: BlockUploadState,
}

/// Single worker moving archived log cache blocks into the object store.
///
/// Uploads run one at a time in archive order. Blocks stay outstanding until they belong
/// to the committed prefix; only then is the WAL trimmed to the prefix's highest confirm
/// offset and are the blocks freed from the log cache. A failed block therefore pins the
/// trim point until it is retried successfully.
pub(crate) struct BackgroundUploader {
    config: UploadTaskConfig,
    wal: Arc<dyn WriteAheadLog>,
    object_manager: Arc<dyn ObjectManager>,
    operator: Arc<dyn S3Operator>,
    main_tx: mpsc::Sender<MainCommand>,
    outstanding: BTreeMap<u64, OutstandingBlock>,
    trimmed_offset: Option<u64>,
}

impl BackgroundUploader {
    pub(crate) fn new(
        config: UploadTaskConfig,
        wal: Arc<dyn WriteAheadLog>,
        object_manager: Arc<dyn ObjectManager>,
        operator: Arc<dyn S3Operator>,
        main_tx: mpsc::Sender<MainCommand>,
    ) -> Self {
        Self {
            config,
            wal,
            object_manager,
            operator,
            main_tx,
            outstanding: BTreeMap::new(),
            trimmed_offset: None,
        }
    }

    pub(crate) fn start(self, rx: mpsc::UnboundedReceiver<UploadCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<UploadCommand>) {
        info!(target = "uploader", "background uploader started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                UploadCommand::Upload { block, done } => {
                    let result = self.upload(block).await;
                    self.advance().await;
                    if let Some(done) = done {
                        let _ = done.send(result);
                    }
                }
                UploadCommand::RetryFailed { done } => {
                    let result = self.retry_failed().await;
                    self.advance().await;
                    let _ = done.send(result);
                }
                UploadCommand::Shutdown => break,
            }
        }
        let failed = self
            .outstanding
            .values()
            .filter(|b| b.state == BlockUploadState::Failed)
            .count();
        if failed > 0 {
            warn!(target = "uploader", failed, "stopping with failed uploads, blocks stay in the wal");
        }
        let _ = self.main_tx.send(MainCommand::UploaderStopped).await;
        info!(target = "uploader", "background uploader stopped");
    }

    async fn upload(&mut self, block: Arc<LogCacheBlock>) -> Result<()> {
        let block_id = block.block_id();
        let mut task = WalObjectUploadTask::new(
            block.clone(),
            self.config.clone(),
            self.object_manager.clone(),
            self.operator.clone(),
        );
        let result = task.run().await;
        let state = match &result {
            Ok(outcome) => {
                debug!(
                    target = "uploader",
                    block_id,
                    object_id = ?outcome.object_id,
                    object_size = outcome.object_size,
                    "block uploaded"
                );
                BlockUploadState::Committed
            }
            Err(_) => BlockUploadState::Failed,
        };
        self.outstanding
            .insert(block_id, OutstandingBlock { block, state });
        result.map(|_| ())
    }

    async fn retry_failed(&mut self) -> Result<()> {
        let failed: Vec<Arc<LogCacheBlock>> = self
            .outstanding
            .values()
            .filter(|b| b.state == BlockUploadState::Failed)
            .map(|b| b.block.clone())
            .collect();
        info!(target = "uploader", blocks = failed.len(), "retrying failed uploads");
        let mut first_error = None;
        for block in failed {
            if let Err(e) = self.upload(block).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Trim the WAL and free cache blocks over the contiguous committed prefix.
    async fn advance(&mut self) {
        let ready: Vec<u64> = self
            .outstanding
            .iter()
            .take_while(|(_, b)| b.state == BlockUploadState::Committed)
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            return;
        }
        let trim_to = ready
            .iter()
            .filter_map(|id| self.outstanding.get(id))
            .filter_map(|b| b.block.confirm_offset())
            .max();
        if let Some(offset) = trim_to {
            if self.trimmed_offset.map_or(true, |t| offset > t) {
                if let Err(e) = self.wal.trim(offset).await {
                    error!(target = "uploader", offset, error = %e, "wal trim failed, keeping blocks");
                    return;
                }
                self.trimmed_offset = Some(offset);
                debug!(target = "uploader", offset, "trimmed wal");
            }
        }
        for id in &ready {
            self.outstanding.remove(id);
        }
        let (tx, rx) = oneshot::channel();
        let free = MainCommand::Free {
            block_ids: ready,
            done: tx,
        };
        if self.main_tx.send(free).await.is_err() {
            warn!(target = "uploader", "ordering context gone, cannot free blocks");
            return;
        }
        let _ = rx.await;
    }
}
