use async_trait::async_trait;
use metrics::counter;
use moka::future::Cache as MokaCache;
use std::sync::Arc;
use tierlog_core::storage::{BlockCache, ObjectManager, S3ObjectMetadata, S3Operator};
use tierlog_core::{ReadDataBlock, Result, StorageError, StreamRecordBatch};
use tracing::{debug, trace};

use crate::object_format::{
    decode_data_block, parse_footer, parse_index, DataBlockIndex, FOOTER_SIZE,
};
use crate::storage_metrics::BLOCK_CACHE_MISS_TOTAL;

// Objects requested from the object manager per lookup round
const OBJECT_LOOKUP_LIMIT: usize = 16;

/// Read-through cache of decoded WAL object data blocks.
///
/// Object indexes and data blocks are fetched with ranged reads and memoized by
/// `object_id` and `(object_id, block_index)` respectively.
#[derive(Debug, Clone)]
pub struct ObjectBlockCache {
    object_manager: Arc<dyn ObjectManager>,
    operator: Arc<dyn S3Operator>,
    indexes: MokaCache<u64, Arc<Vec<DataBlockIndex>>>,
    blocks: MokaCache<(u64, usize), Arc<Vec<StreamRecordBatch>>>,
}

impl ObjectBlockCache {
    pub fn new(
        object_manager: Arc<dyn ObjectManager>,
        operator: Arc<dyn S3Operator>,
        capacity: u64,
    ) -> Self {
        let indexes = MokaCache::builder().max_capacity(capacity).build();
        let blocks = MokaCache::builder().max_capacity(capacity).build();
        Self {
            object_manager,
            operator,
            indexes,
            blocks,
        }
    }

    async fn index_of(&self, object: &S3ObjectMetadata) -> Result<Arc<Vec<DataBlockIndex>>> {
        if let Some(index) = self.indexes.get(&object.object_id).await {
            return Ok(index);
        }
        let key = object.key();
        let size = object.object_size;
        if size < FOOTER_SIZE as u64 {
            return Err(StorageError::Codec(format!(
                "object {} of {} bytes is smaller than its footer",
                key, size
            )));
        }
        let footer = parse_footer(
            self.operator
                .range_read(&key, size - FOOTER_SIZE as u64..size)
                .await?,
        )?;
        let index_end = footer
            .index_position
            .checked_add(footer.index_len as u64)
            .ok_or_else(|| {
                StorageError::Codec(format!(
                    "object {} index position {} overflows",
                    key, footer.index_position
                ))
            })?;
        if index_end.checked_add(FOOTER_SIZE as u64) != Some(size) {
            return Err(StorageError::Codec(format!(
                "object {} index [{}, {}) does not end at the footer",
                key, footer.index_position, index_end
            )));
        }
        let index = Arc::new(parse_index(
            self.operator
                .range_read(&key, footer.index_position..index_end)
                .await?,
            footer.entry_count,
        )?);
        self.indexes.insert(object.object_id, index.clone()).await;
        Ok(index)
    }

    async fn data_block(
        &self,
        object: &S3ObjectMetadata,
        block_index: usize,
        entry: &DataBlockIndex,
    ) -> Result<Arc<Vec<StreamRecordBatch>>> {
        let cache_key = (object.object_id, block_index);
        if let Some(records) = self.blocks.get(&cache_key).await {
            return Ok(records);
        }
        counter!(BLOCK_CACHE_MISS_TOTAL.name).increment(1);
        let end = entry.position.checked_add(entry.size as u64).ok_or_else(|| {
            StorageError::Codec(format!(
                "data block {} of object {} at position {} overflows",
                block_index, object.object_id, entry.position
            ))
        })?;
        let range = entry.position..end;
        let data = self.operator.range_read(&object.key(), range).await?;
        let records = Arc::new(decode_data_block(data)?);
        if records.len() != entry.record_count as usize {
            return Err(StorageError::Codec(format!(
                "data block {} of object {} holds {} records, index says {}",
                block_index,
                object.object_id,
                records.len(),
                entry.record_count
            )));
        }
        trace!(
            target = "block_cache",
            object_id = object.object_id,
            block_index,
            records = records.len(),
            "loaded data block"
        );
        self.blocks.insert(cache_key, records.clone()).await;
        Ok(records)
    }
}

#[async_trait]
impl BlockCache for ObjectBlockCache {
    /// Contiguous run of committed batches from `start_offset`, with the same bounds as the
    /// log cache: stop at a gap, at `end_offset` or at `max_bytes`, but return at least one
    /// batch when one covers `start_offset`.
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock> {
        let mut out: Vec<StreamRecordBatch> = Vec::new();
        let mut next = start_offset;
        let mut bytes = 0usize;
        while next < end_offset {
            let objects = self
                .object_manager
                .get_objects(stream_id, next, end_offset, OBJECT_LOOKUP_LIMIT)
                .await?;
            let round_start = next;
            let mut stopped = false;
            'objects: for object in &objects {
                let index = self.index_of(object).await?;
                for (i, entry) in index.iter().enumerate() {
                    if entry.stream_id != stream_id || !entry.intersects(next, end_offset) {
                        continue;
                    }
                    let records = self.data_block(object, i, entry).await?;
                    for record in records.iter().filter(|r| r.stream_id == stream_id) {
                        if record.last_offset() <= next {
                            continue;
                        }
                        if record.base_offset > next || record.base_offset >= end_offset {
                            stopped = true;
                            break 'objects;
                        }
                        if !out.is_empty() && bytes + record.size() > max_bytes {
                            stopped = true;
                            break 'objects;
                        }
                        bytes += record.size();
                        next = record.last_offset();
                        out.push(record.clone());
                        if next >= end_offset || bytes >= max_bytes {
                            stopped = true;
                            break 'objects;
                        }
                    }
                }
            }
            if stopped || objects.len() < OBJECT_LOOKUP_LIMIT || next == round_start {
                break;
            }
        }
        debug!(
            target = "block_cache",
            stream_id,
            start_offset,
            end_offset,
            batches = out.len(),
            bytes,
            "object store read"
        );
        Ok(ReadDataBlock::new(out))
    }
}
