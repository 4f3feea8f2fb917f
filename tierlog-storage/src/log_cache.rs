use metrics::gauge;
use std::collections::BTreeMap;
use std::iter;
use std::sync::Arc;
use tierlog_core::EncodedRecordBatch;
use tracing::{debug, warn};

use crate::storage_metrics::CACHE_SIZE_BYTES;

/// Accumulation unit of the log cache.
///
/// Notes
/// - Batches are grouped per stream, each group kept in insertion (= release) order, so a
///   stream's group is sorted by offset.
/// - Once archived the block is shared read-only between reads and the uploader.
#[derive(Debug)]
pub struct LogCacheBlock {
    block_id: u64,
    size: usize,
    confirm_offset: Option<u64>,
    streams: BTreeMap<u64, Vec<EncodedRecordBatch>>,
}

impl LogCacheBlock {
    fn new(block_id: u64) -> Self {
        Self {
            block_id,
            size: 0,
            confirm_offset: None,
            streams: BTreeMap::new(),
        }
    }

    fn put(&mut self, record: EncodedRecordBatch) {
        self.size += record.encoded_len();
        self.streams.entry(record.stream_id).or_default().push(record);
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    /// WAL offset up to which every record of the block is known durable.
    pub fn confirm_offset(&self) -> Option<u64> {
        self.confirm_offset
    }

    /// Encoded bytes held by the block.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, stream_id: u64) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Records of one stream in offset order.
    pub fn stream_records(&self, stream_id: u64) -> &[EncodedRecordBatch] {
        self.streams
            .get(&stream_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// `(stream_id, records)` groups ordered by stream id.
    pub fn streams(&self) -> impl Iterator<Item = (u64, &[EncodedRecordBatch])> + '_ {
        self.streams.iter().map(|(id, v)| (*id, v.as_slice()))
    }

    pub fn record_count(&self) -> usize {
        self.streams.values().map(|v| v.len()).sum()
    }
}

/// Snapshot of the log cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogCacheStats {
    pub open_block_id: u64,
    pub open_block_size: usize,
    pub archived_blocks: usize,
    pub total_size: usize,
}

/// In-memory holding area for durable records that are not yet in the object store.
///
/// Exactly one block is open; archived blocks are kept, keyed by id (creation order), until
/// their upload is committed and the WAL trimmed past them.
#[derive(Debug)]
pub(crate) struct LogCache {
    capacity: usize,
    confirm_offset: Option<u64>,
    active: LogCacheBlock,
    archived: BTreeMap<u64, Arc<LogCacheBlock>>,
    archived_size: usize,
}

impl LogCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            confirm_offset: None,
            active: LogCacheBlock::new(0),
            archived: BTreeMap::new(),
            archived_size: 0,
        }
    }

    /// Insert into the open block. Returns `true` once the block reached the capacity.
    pub(crate) fn put(&mut self, record: EncodedRecordBatch) -> bool {
        self.active.put(record);
        self.report_size();
        self.active.size >= self.capacity
    }

    /// Contiguous run of a stream's records starting at `start_offset`.
    ///
    /// Blocks are scanned oldest first. The first record must cover `start_offset`, otherwise
    /// the range is not resident and the result is empty. The scan stops at a gap, at
    /// `end_offset`, or before the record that would exceed `max_bytes`; a single record larger
    /// than `max_bytes` is still returned.
    pub(crate) fn get(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Vec<EncodedRecordBatch> {
        let mut out: Vec<EncodedRecordBatch> = Vec::new();
        if start_offset >= end_offset {
            return out;
        }
        let mut next = start_offset;
        let mut bytes = 0usize;
        let blocks = self
            .archived
            .values()
            .map(|b| b.as_ref())
            .chain(iter::once(&self.active));
        'scan: for block in blocks {
            let records = block.stream_records(stream_id);
            let first = records.partition_point(|r| r.last_offset <= next);
            for record in &records[first..] {
                if record.base_offset >= end_offset || record.base_offset > next {
                    break 'scan;
                }
                if !out.is_empty() && bytes + record.size > max_bytes {
                    break 'scan;
                }
                bytes += record.size;
                next = record.last_offset;
                out.push(record.clone());
                if next >= end_offset || bytes >= max_bytes {
                    break 'scan;
                }
            }
        }
        out
    }

    /// Seal the open block, stamp it with the latest confirm offset and open a fresh one.
    pub(crate) fn archive_current_block(&mut self) -> Arc<LogCacheBlock> {
        let next_id = self.active.block_id + 1;
        let mut block = std::mem::replace(&mut self.active, LogCacheBlock::new(next_id));
        block.confirm_offset = self.confirm_offset;
        let block = Arc::new(block);
        self.archived_size += block.size;
        self.archived.insert(block.block_id, block.clone());
        debug!(
            target = "log_cache",
            block_id = block.block_id,
            size = block.size,
            records = block.record_count(),
            confirm_offset = ?block.confirm_offset,
            "archived log cache block"
        );
        block
    }

    /// Archive the open block only if it holds data of `stream_id`.
    pub(crate) fn archive_current_block_if_contains(
        &mut self,
        stream_id: u64,
    ) -> Option<Arc<LogCacheBlock>> {
        if self.active.contains(stream_id) {
            Some(self.archive_current_block())
        } else {
            None
        }
    }

    pub(crate) fn set_confirm_offset(&mut self, offset: Option<u64>) {
        if offset > self.confirm_offset {
            self.confirm_offset = offset;
        }
    }

    /// Release an archived block. Returns `false` if the block is unknown or still open.
    pub(crate) fn free(&mut self, block_id: u64) -> bool {
        match self.archived.remove(&block_id) {
            Some(block) => {
                self.archived_size -= block.size;
                self.report_size();
                debug!(target = "log_cache", block_id, size = block.size, "freed log cache block");
                true
            }
            None => {
                warn!(target = "log_cache", block_id, "free requested for unknown block");
                false
            }
        }
    }

    pub(crate) fn stats(&self) -> LogCacheStats {
        LogCacheStats {
            open_block_id: self.active.block_id,
            open_block_size: self.active.size,
            archived_blocks: self.archived.len(),
            total_size: self.archived_size + self.active.size,
        }
    }

    fn report_size(&self) {
        gauge!(CACHE_SIZE_BYTES.name).set((self.archived_size + self.active.size) as f64);
    }
}
