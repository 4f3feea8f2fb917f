use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierlog_core::errors::UploadPhase;
use tierlog_core::storage::{
    object_key, CommitWalObjectRequest, ObjectManager, ObjectStreamRange, ObjectWriter,
    S3Operator,
};
use tierlog_core::{Result, StorageError};
use tracing::{error, info, warn};

use crate::config::UploadRetryPolicy;
use crate::log_cache::LogCacheBlock;
use crate::object_format::WalObjectBuilder;
use crate::storage_metrics::{UPLOAD_BYTES_TOTAL, UPLOAD_LATENCY_MS, UPLOAD_OBJECTS_TOTAL};

/// Settings shared by every upload task.
#[derive(Debug, Clone)]
pub(crate) struct UploadTaskConfig {
    pub(crate) object_block_size: usize,
    pub(crate) part_size: usize,
    pub(crate) prepare_ttl: Duration,
    pub(crate) retry: UploadRetryPolicy,
}

#[derive(Debug)]
pub(crate) enum UploadState {
    Created,
    Prepared { object_id: u64 },
    Uploaded { request: CommitWalObjectRequest },
    Committed { object_id: u64, object_size: u64 },
    Failed,
}

/// Result of a successful upload. Empty blocks complete without producing an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UploadOutcome {
    pub(crate) object_id: Option<u64>,
    pub(crate) object_size: u64,
}

/// Moves one archived log cache block into the object store.
///
/// Notes
/// - Phases run strictly in order: prepare reserves an object id, upload streams the object
///   through the chunked writer, commit registers it with the object manager.
/// - Each phase may be re-run after a failure: re-upload overwrites the same key and commit
///   is keyed by the object id.
/// - On final failure the written object is deleted best-effort; the block itself is never
///   touched, so the caller keeps it in the cache and the WAL untrimmed.
pub(crate) struct WalObjectUploadTask {
    block: Arc<LogCacheBlock>,
    config: UploadTaskConfig,
    object_manager: Arc<dyn ObjectManager>,
    operator: Arc<dyn S3Operator>,
    state: UploadState,
}

impl WalObjectUploadTask {
    pub(crate) fn new(
        block: Arc<LogCacheBlock>,
        config: UploadTaskConfig,
        object_manager: Arc<dyn ObjectManager>,
        operator: Arc<dyn S3Operator>,
    ) -> Self {
        Self {
            block,
            config,
            object_manager,
            operator,
            state: UploadState::Created,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &UploadState {
        &self.state
    }

    pub(crate) async fn prepare(&mut self) -> Result<u64> {
        if !matches!(self.state, UploadState::Created) {
            return Err(self.out_of_order("prepare"));
        }
        let object_id = self
            .object_manager
            .prepare_object(1, self.config.prepare_ttl)
            .await?;
        self.state = UploadState::Prepared { object_id };
        Ok(object_id)
    }

    /// Stream the block into a WAL object: data blocks in stream order, then index and footer.
    pub(crate) async fn upload(&mut self) -> Result<&CommitWalObjectRequest> {
        let object_id = match &self.state {
            UploadState::Prepared { object_id } => *object_id,
            UploadState::Uploaded { request } => request.object_id,
            _ => return Err(self.out_of_order("upload")),
        };
        let key = object_key(object_id);
        let mut writer = self.operator.writer(&key, self.config.part_size).await?;
        let stream_ranges = match self.write_object(writer.as_mut()).await {
            Ok(ranges) => ranges,
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(target = "uploader", key = %key, error = %abort_err, "failed to abort object writer");
                }
                return Err(e);
            }
        };
        let object_size = writer.close().await?;
        self.state = UploadState::Uploaded {
            request: CommitWalObjectRequest {
                object_id,
                object_size,
                stream_ranges,
            },
        };
        match &self.state {
            UploadState::Uploaded { request } => Ok(request),
            _ => Err(self.out_of_order("upload")),
        }
    }

    async fn write_object(&self, writer: &mut dyn ObjectWriter) -> Result<Vec<ObjectStreamRange>> {
        let mut builder = WalObjectBuilder::new(self.config.object_block_size);
        let mut ranges = Vec::new();
        for (stream_id, records) in self.block.streams() {
            let (Some(first), Some(last)) = (records.first(), records.last()) else {
                continue;
            };
            ranges.push(ObjectStreamRange {
                stream_id,
                epoch: records.iter().map(|r| r.epoch).max().unwrap_or(last.epoch),
                start_offset: first.base_offset,
                end_offset: last.last_offset,
            });
            for record in records {
                builder.append(record);
                for part in builder.take_ready() {
                    writer.write(part).await?;
                }
            }
        }
        let (tail, _) = builder.finish();
        writer.write(tail).await?;
        Ok(ranges)
    }

    pub(crate) async fn commit(&mut self) -> Result<()> {
        let UploadState::Uploaded { request } = &self.state else {
            return Err(self.out_of_order("commit"));
        };
        let (object_id, object_size) = (request.object_id, request.object_size);
        self.object_manager.commit_wal_object(request.clone()).await?;
        self.state = UploadState::Committed {
            object_id,
            object_size,
        };
        Ok(())
    }

    /// Drive every phase to completion, retrying each per the policy.
    pub(crate) async fn run(&mut self) -> Result<UploadOutcome> {
        let block_id = self.block.block_id();
        if self.block.is_empty() {
            self.state = UploadState::Committed {
                object_id: 0,
                object_size: 0,
            };
            return Ok(UploadOutcome {
                object_id: None,
                object_size: 0,
            });
        }
        let started = Instant::now();
        for phase in [UploadPhase::Prepare, UploadPhase::Upload, UploadPhase::Commit] {
            if let Err(e) = self.run_phase(phase).await {
                self.compensate().await;
                self.state = UploadState::Failed;
                counter!(UPLOAD_OBJECTS_TOTAL.name, "result" => "error").increment(1);
                error!(
                    target = "uploader",
                    block_id,
                    phase = %phase,
                    error = %e,
                    "wal object upload failed; block retained in cache"
                );
                return Err(StorageError::Upload {
                    block_id,
                    phase,
                    reason: e.to_string(),
                });
            }
        }
        let UploadState::Committed {
            object_id,
            object_size,
        } = self.state
        else {
            return Err(self.out_of_order("run"));
        };
        let elapsed_ms = started.elapsed().as_millis() as f64;
        histogram!(UPLOAD_LATENCY_MS.name).record(elapsed_ms);
        counter!(UPLOAD_OBJECTS_TOTAL.name, "result" => "ok").increment(1);
        counter!(UPLOAD_BYTES_TOTAL.name).increment(object_size);
        info!(
            target = "uploader",
            block_id,
            object_id,
            object_size,
            confirm_offset = ?self.block.confirm_offset(),
            elapsed_ms,
            "wal object committed"
        );
        Ok(UploadOutcome {
            object_id: Some(object_id),
            object_size,
        })
    }

    async fn run_phase(&mut self, phase: UploadPhase) -> Result<()> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match phase {
                UploadPhase::Prepare => self.prepare().await.map(|_| ()),
                UploadPhase::Upload => self.upload().await.map(|_| ()),
                UploadPhase::Commit => self.commit().await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        target = "uploader",
                        block_id = self.block.block_id(),
                        phase = %phase,
                        attempt,
                        error = %e,
                        "upload phase failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.backoff()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Remove whatever may have been written under the reserved key.
    async fn compensate(&self) {
        let object_id = match &self.state {
            UploadState::Prepared { object_id } => *object_id,
            UploadState::Uploaded { request } => request.object_id,
            _ => return,
        };
        let key = object_key(object_id);
        if let Err(e) = self.operator.delete(&key).await {
            warn!(target = "uploader", key = %key, error = %e, "failed to delete orphan object");
        }
    }

    fn out_of_order(&self, op: &str) -> StorageError {
        StorageError::InvalidState(format!(
            "{} not allowed for block {} in state {:?}",
            op,
            self.block.block_id(),
            self.state
        ))
    }
}
