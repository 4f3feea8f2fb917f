use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use crate::codec::StreamRecordBatchCodec;

/// One producer-supplied batch of records for a stream.
///
/// The batch covers the logical offsets `[base_offset, base_offset + count)`.
/// Batches are ordered by `(stream_id, epoch, base_offset)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecordBatch {
    // Identifies the stream the batch belongs to
    pub stream_id: u64,
    // Generation / fencing token of the stream owner
    pub epoch: u64,
    // First logical offset covered by the batch
    pub base_offset: u64,
    // Number of records in the batch
    pub count: u32,
    // Opaque record payload
    pub payload: Bytes,
}

impl StreamRecordBatch {
    pub fn new(stream_id: u64, epoch: u64, base_offset: u64, count: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            epoch,
            base_offset,
            count,
            payload,
        }
    }

    /// Exclusive end offset of the batch, saturating at `u64::MAX`.
    pub fn last_offset(&self) -> u64 {
        self.base_offset.saturating_add(self.count as u64)
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl Ord for StreamRecordBatch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stream_id
            .cmp(&other.stream_id)
            .then(self.epoch.cmp(&other.epoch))
            .then(self.base_offset.cmp(&other.base_offset))
    }
}

impl PartialOrd for StreamRecordBatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for StreamRecordBatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream:_{}_epoch:_{}_range:_[{}, {})",
            self.stream_id,
            self.epoch,
            self.base_offset,
            self.last_offset()
        )
    }
}

/// Flat, encoded form of a [`StreamRecordBatch`] as written to the WAL and held by the log cache.
///
/// The encoded buffer is freshly allocated by the codec, so the producer is free to reuse
/// its payload buffer once `append` returns. Header fields are kept alongside the buffer
/// so range scans never need to decode.
#[derive(Debug, Clone)]
pub struct EncodedRecordBatch {
    pub stream_id: u64,
    pub epoch: u64,
    pub base_offset: u64,
    pub last_offset: u64,
    // payload size of the original batch, used for read budgets
    pub size: usize,
    pub encoded: Bytes,
}

impl EncodedRecordBatch {
    pub fn from_batch(batch: &StreamRecordBatch) -> crate::Result<Self> {
        Ok(Self {
            stream_id: batch.stream_id,
            epoch: batch.epoch,
            base_offset: batch.base_offset,
            last_offset: batch.last_offset(),
            size: batch.size(),
            encoded: StreamRecordBatchCodec::encode(batch)?,
        })
    }

    /// Bytes held in memory by the encoded form.
    pub fn encoded_len(&self) -> usize {
        self.encoded.len()
    }

    /// Whether the batch covers any offset of `[start, end)`.
    pub fn intersects(&self, start: u64, end: u64) -> bool {
        self.last_offset > start && self.base_offset < end
    }

    pub fn decode(&self) -> crate::Result<StreamRecordBatch> {
        StreamRecordBatchCodec::decode(self.encoded.clone())
    }
}

/// Result of a stream read: batches in ascending offset order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadDataBlock {
    records: Vec<StreamRecordBatch>,
}

impl ReadDataBlock {
    pub fn new(records: Vec<StreamRecordBatch>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[StreamRecordBatch] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StreamRecordBatch> {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Exclusive end offset of the last batch, if any.
    pub fn end_offset(&self) -> Option<u64> {
        self.records.last().map(|r| r.last_offset())
    }

    pub fn size_in_bytes(&self) -> usize {
        self.records.iter().map(|r| r.size()).sum()
    }
}
