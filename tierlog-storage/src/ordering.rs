use metrics::counter;
use std::sync::Arc;
use tierlog_core::storage::{AppendResult, BlockCache, WriteAheadLog};
use tierlog_core::{
    EncodedRecordBatch, ReadDataBlock, Result, StorageError, StreamRecordBatchCodec,
};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::log_cache::{LogCache, LogCacheBlock, LogCacheStats};
use crate::sequencer::{WalCallbackSequencer, WalWriteRequest};
use crate::storage_metrics::{APPEND_BYTES_TOTAL, APPEND_TOTAL, CACHE_ARCHIVE_TOTAL, READ_TOTAL};
use crate::uploader::UploadCommand;

/// Commands processed by the ordering context, in arrival order.
#[derive(Debug)]
pub(crate) enum MainCommand {
    /// Submit an encoded batch to the WAL; `reply` carries the assigned offset and `done`
    /// resolves when the batch is released in stream order.
    Append {
        record: EncodedRecordBatch,
        permit: Option<OwnedSemaphorePermit>,
        done: oneshot::Sender<Result<()>>,
        reply: oneshot::Sender<Result<u64>>,
    },
    /// Durability outcome of a WAL append.
    WalAck {
        stream_id: u64,
        offset: u64,
        outcome: Result<()>,
    },
    Read {
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
        reply: oneshot::Sender<Result<ReadDataBlock>>,
    },
    /// Object store part of a cache miss; the tail is completed from the log cache.
    ReadTail {
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
        head: Result<ReadDataBlock>,
        reply: oneshot::Sender<Result<ReadDataBlock>>,
    },
    ForceUpload {
        stream_id: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Release archived blocks whose objects are committed and WAL trimmed.
    Free {
        block_ids: Vec<u64>,
        done: oneshot::Sender<()>,
    },
    ConfirmOffset {
        reply: oneshot::Sender<Option<u64>>,
    },
    CacheStats {
        reply: oneshot::Sender<LogCacheStats>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
    UploaderStopped,
}

/// Single task owning the sequencer and the log cache.
///
/// Every state change of the write path happens here, so no locks guard either structure.
/// Handlers never await: WAL durability futures and object store reads run on spawned tasks
/// that post their results back as commands.
pub(crate) struct OrderingContext {
    wal: Arc<dyn WriteAheadLog>,
    block_cache: Arc<dyn BlockCache>,
    sequencer: WalCallbackSequencer,
    cache: LogCache,
    main_tx: mpsc::Sender<MainCommand>,
    upload_tx: mpsc::UnboundedSender<UploadCommand>,
    pending_reads: usize,
    shutting_down: bool,
    uploader_stopping: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl OrderingContext {
    pub(crate) fn new(
        wal: Arc<dyn WriteAheadLog>,
        block_cache: Arc<dyn BlockCache>,
        sequencer_capacity: usize,
        cache_capacity: usize,
        main_tx: mpsc::Sender<MainCommand>,
        upload_tx: mpsc::UnboundedSender<UploadCommand>,
    ) -> Self {
        Self {
            wal,
            block_cache,
            sequencer: WalCallbackSequencer::new(sequencer_capacity),
            cache: LogCache::new(cache_capacity),
            main_tx,
            upload_tx,
            pending_reads: 0,
            shutting_down: false,
            uploader_stopping: false,
            shutdown_waiters: Vec::new(),
        }
    }

    pub(crate) fn start(self, rx: mpsc::Receiver<MainCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<MainCommand>) {
        info!(target = "s3_storage", "ordering context started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                MainCommand::Append {
                    record,
                    permit,
                    done,
                    reply,
                } => self.handle_append(record, permit, done, reply),
                MainCommand::WalAck {
                    stream_id,
                    offset,
                    outcome,
                } => self.handle_wal_ack(stream_id, offset, outcome),
                MainCommand::Read {
                    stream_id,
                    start_offset,
                    end_offset,
                    max_bytes,
                    reply,
                } => self.handle_read(stream_id, start_offset, end_offset, max_bytes, reply),
                MainCommand::ReadTail {
                    stream_id,
                    start_offset,
                    end_offset,
                    max_bytes,
                    head,
                    reply,
                } => {
                    self.pending_reads = self.pending_reads.saturating_sub(1);
                    let result =
                        self.complete_read(stream_id, start_offset, end_offset, max_bytes, head);
                    let _ = reply.send(result);
                }
                MainCommand::ForceUpload { stream_id, reply } => {
                    self.handle_force_upload(stream_id, reply)
                }
                MainCommand::Free { block_ids, done } => {
                    for block_id in block_ids {
                        self.cache.free(block_id);
                    }
                    let _ = done.send(());
                }
                MainCommand::ConfirmOffset { reply } => {
                    let _ = reply.send(self.sequencer.wal_confirm_offset());
                }
                MainCommand::CacheStats { reply } => {
                    let _ = reply.send(self.cache.stats());
                }
                MainCommand::Shutdown { done } => {
                    if !self.shutting_down {
                        info!(
                            target = "s3_storage",
                            outstanding = self.sequencer.outstanding(),
                            pending_reads = self.pending_reads,
                            "shutdown requested, draining"
                        );
                    }
                    self.shutting_down = true;
                    self.shutdown_waiters.push(done);
                }
                MainCommand::UploaderStopped => break,
            }
            if self.shutting_down && !self.stop_uploader_when_idle() {
                break;
            }
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!(target = "s3_storage", "ordering context stopped");
    }

    fn handle_append(
        &mut self,
        record: EncodedRecordBatch,
        permit: Option<OwnedSemaphorePermit>,
        done: oneshot::Sender<Result<()>>,
        reply: oneshot::Sender<Result<u64>>,
    ) {
        if self.shutting_down {
            let _ = reply.send(Err(StorageError::Closed));
            return;
        }
        let AppendResult { offset, future } = match self.wal.append(record.encoded.clone()) {
            Ok(result) => result,
            Err(e) => {
                warn!(target = "s3_storage", stream_id = record.stream_id, error = %e, "wal append failed");
                counter!(APPEND_TOTAL.name, "result" => "error").increment(1);
                let _ = reply.send(Err(e));
                return;
            }
        };
        let stream_id = record.stream_id;
        let request = WalWriteRequest::new(record, offset, done);
        let registered = self.sequencer.before(request, permit);
        let _ = reply.send(Ok(offset));
        if !registered {
            counter!(APPEND_TOTAL.name, "result" => "error").increment(1);
            return;
        }
        let tx = self.main_tx.clone();
        tokio::spawn(async move {
            let outcome = future.await;
            let _ = tx
                .send(MainCommand::WalAck {
                    stream_id,
                    offset,
                    outcome,
                })
                .await;
        });
    }

    fn handle_wal_ack(&mut self, stream_id: u64, offset: u64, outcome: Result<()>) {
        let released = self.sequencer.after(stream_id, offset, outcome);
        let mut full = false;
        for mut request in released {
            if let Some(e) = request.take_failure() {
                counter!(APPEND_TOTAL.name, "result" => "error").increment(1);
                request.complete(Err(e));
                continue;
            }
            let size = request.record.size;
            full |= self.cache.put(request.record.clone());
            counter!(APPEND_TOTAL.name, "result" => "ok").increment(1);
            counter!(APPEND_BYTES_TOTAL.name).increment(size as u64);
            request.complete(Ok(()));
        }
        // The watermark covers the cache only once the whole released run is in.
        self.cache
            .set_confirm_offset(self.sequencer.wal_confirm_offset());
        if full {
            self.archive_and_upload("full", None);
        }
    }

    fn handle_read(
        &mut self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
        reply: oneshot::Sender<Result<ReadDataBlock>>,
    ) {
        if self.shutting_down {
            let _ = reply.send(Err(StorageError::Closed));
            return;
        }
        if start_offset >= end_offset {
            let _ = reply.send(Ok(ReadDataBlock::empty()));
            return;
        }
        let hit = self.cache.get(stream_id, start_offset, end_offset, max_bytes);
        if !hit.is_empty() {
            counter!(READ_TOTAL.name, "source" => "cache").increment(1);
            let result = StreamRecordBatchCodec::decode_all(&hit).map(ReadDataBlock::new);
            let _ = reply.send(result);
            return;
        }
        self.pending_reads += 1;
        let block_cache = self.block_cache.clone();
        let tx = self.main_tx.clone();
        tokio::spawn(async move {
            let head = block_cache
                .read(stream_id, start_offset, end_offset, max_bytes)
                .await;
            let _ = tx
                .send(MainCommand::ReadTail {
                    stream_id,
                    start_offset,
                    end_offset,
                    max_bytes,
                    head,
                    reply,
                })
                .await;
        });
    }

    // Append to the object store part whatever the log cache holds right after it.
    fn complete_read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
        head: Result<ReadDataBlock>,
    ) -> Result<ReadDataBlock> {
        let head = head?;
        let next = head.end_offset().unwrap_or(start_offset);
        let used = head.size_in_bytes();
        if next >= end_offset || (!head.is_empty() && used >= max_bytes) {
            counter!(READ_TOTAL.name, "source" => "block_cache").increment(1);
            return Ok(head);
        }
        let remaining = max_bytes.saturating_sub(used);
        let mut tail = self.cache.get(stream_id, next, end_offset, remaining);
        // the at-least-one rule only applies to the first batch of the whole read
        if !head.is_empty() && tail.first().is_some_and(|r| r.size > remaining) {
            tail.clear();
        }
        let source = match (head.is_empty(), tail.is_empty()) {
            (_, true) => "block_cache",
            (true, false) => "cache",
            (false, false) => "merged",
        };
        counter!(READ_TOTAL.name, "source" => source).increment(1);
        if tail.is_empty() {
            return Ok(head);
        }
        debug!(
            target = "s3_storage",
            stream_id,
            head_end = next,
            tail_batches = tail.len(),
            "merged object store and log cache reads"
        );
        let mut records = head.into_records();
        records.extend(StreamRecordBatchCodec::decode_all(&tail)?);
        Ok(ReadDataBlock::new(records))
    }

    fn handle_force_upload(&mut self, stream_id: u64, reply: oneshot::Sender<Result<()>>) {
        if self.shutting_down {
            let _ = reply.send(Err(StorageError::Closed));
            return;
        }
        match self.cache.archive_current_block_if_contains(stream_id) {
            Some(block) => self.send_upload(block, "force", Some(reply)),
            None => {
                debug!(target = "s3_storage", stream_id, "force upload: open block holds no data of stream");
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn archive_and_upload(&mut self, reason: &'static str, done: Option<oneshot::Sender<Result<()>>>) {
        let block = self.cache.archive_current_block();
        self.send_upload(block, reason, done);
    }

    fn send_upload(
        &mut self,
        block: Arc<LogCacheBlock>,
        reason: &'static str,
        done: Option<oneshot::Sender<Result<()>>>,
    ) {
        counter!(CACHE_ARCHIVE_TOTAL.name, "reason" => reason).increment(1);
        let block_id = block.block_id();
        if let Err(mpsc::error::SendError(cmd)) =
            self.upload_tx.send(UploadCommand::Upload { block, done })
        {
            warn!(target = "s3_storage", block_id, "uploader stopped, block stays in cache");
            if let UploadCommand::Upload { done: Some(done), .. } = cmd {
                let _ = done.send(Err(StorageError::Closed));
            }
        }
    }

    // Returns false when the loop should exit right away.
    fn stop_uploader_when_idle(&mut self) -> bool {
        if self.uploader_stopping || !self.sequencer.is_idle() || self.pending_reads > 0 {
            return true;
        }
        self.uploader_stopping = true;
        self.upload_tx.send(UploadCommand::Shutdown).is_ok()
    }
}
