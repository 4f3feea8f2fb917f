use bytes::{Buf, BufMut, Bytes, BytesMut};
use tierlog_core::{EncodedRecordBatch, Result, StorageError, StreamRecordBatch, StreamRecordBatchCodec};

/// Record frame header inside a data block: [u32 len][u32 crc32]
pub(crate) const FRAME_HEADER_SIZE: usize = 8;

/// Index entry: [u64 stream_id][u64 start][u64 end][u32 records][u64 position][u32 size]
pub(crate) const INDEX_ENTRY_SIZE: usize = 40;

/// Footer: [u64 index_position][u32 index_len][u32 entry_count][u64 magic]
pub(crate) const FOOTER_SIZE: usize = 24;

pub(crate) const OBJECT_MAGIC: u64 = 0x5449_4552_4c4f_4701;

/// Location and offset range of one data block inside a WAL object.
///
/// A data block only ever holds records of a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataBlockIndex {
    pub(crate) stream_id: u64,
    pub(crate) start_offset: u64,
    pub(crate) end_offset: u64,
    pub(crate) record_count: u32,
    pub(crate) position: u64,
    pub(crate) size: u32,
}

impl DataBlockIndex {
    pub(crate) fn intersects(&self, start: u64, end: u64) -> bool {
        self.end_offset > start && self.start_offset < end
    }
}

/// Incremental WAL object encoder.
///
/// Records are fed stream by stream in offset order; sealed data blocks are drained by the
/// caller as they complete, so the object is streamed to the store without being
/// materialized in memory.
#[derive(Debug)]
pub(crate) struct WalObjectBuilder {
    block_size: usize,
    position: u64,
    current: BytesMut,
    current_index: Option<DataBlockIndex>,
    entries: Vec<DataBlockIndex>,
    ready: Vec<Bytes>,
}

impl WalObjectBuilder {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            block_size,
            position: 0,
            current: BytesMut::new(),
            current_index: None,
            entries: Vec::new(),
            ready: Vec::new(),
        }
    }

    /// Append one record. A change of stream or crossing `block_size` seals the data block,
    /// which then becomes available through [`Self::take_ready`].
    pub(crate) fn append(&mut self, record: &EncodedRecordBatch) {
        if let Some(idx) = &self.current_index {
            if idx.stream_id != record.stream_id {
                self.seal_block();
            }
        }
        let idx = self.current_index.get_or_insert(DataBlockIndex {
            stream_id: record.stream_id,
            start_offset: record.base_offset,
            end_offset: record.base_offset,
            record_count: 0,
            position: self.position,
            size: 0,
        });
        idx.end_offset = record.last_offset;
        idx.record_count += 1;
        self.current.put_u32(record.encoded.len() as u32);
        self.current.put_u32(crc32fast::hash(&record.encoded));
        self.current.put_slice(&record.encoded);

        if self.current.len() >= self.block_size {
            self.seal_block();
        }
    }

    /// Close the data block being built, if any.
    pub(crate) fn seal_block(&mut self) {
        let Some(mut idx) = self.current_index.take() else {
            return;
        };
        let data = self.current.split().freeze();
        idx.size = data.len() as u32;
        self.position += data.len() as u64;
        self.entries.push(idx);
        self.ready.push(data);
    }

    /// Sealed data blocks not yet handed to the writer, in object order.
    pub(crate) fn take_ready(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.ready)
    }

    /// Seal the last data block and produce the trailing bytes: every data block not yet
    /// taken, the index and the footer.
    pub(crate) fn finish(mut self) -> (Bytes, Vec<DataBlockIndex>) {
        self.seal_block();
        let mut tail = BytesMut::new();
        for data in self.ready.drain(..) {
            tail.put_slice(&data);
        }
        let index_position = self.position;
        for e in &self.entries {
            tail.put_u64(e.stream_id);
            tail.put_u64(e.start_offset);
            tail.put_u64(e.end_offset);
            tail.put_u32(e.record_count);
            tail.put_u64(e.position);
            tail.put_u32(e.size);
        }
        tail.put_u64(index_position);
        tail.put_u32((self.entries.len() * INDEX_ENTRY_SIZE) as u32);
        tail.put_u32(self.entries.len() as u32);
        tail.put_u64(OBJECT_MAGIC);
        (tail.freeze(), self.entries)
    }
}

/// Decoded object footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObjectFooter {
    pub(crate) index_position: u64,
    pub(crate) index_len: u32,
    pub(crate) entry_count: u32,
}

pub(crate) fn parse_footer(mut buf: Bytes) -> Result<ObjectFooter> {
    if buf.len() != FOOTER_SIZE {
        return Err(StorageError::Codec(format!(
            "object footer must be {} bytes, got {}",
            FOOTER_SIZE,
            buf.len()
        )));
    }
    let index_position = buf.get_u64();
    let index_len = buf.get_u32();
    let entry_count = buf.get_u32();
    let magic = buf.get_u64();
    if magic != OBJECT_MAGIC {
        return Err(StorageError::Codec(format!("bad object magic {:#x}", magic)));
    }
    if index_len as usize != entry_count as usize * INDEX_ENTRY_SIZE {
        return Err(StorageError::Codec(format!(
            "index length {} does not match {} entries",
            index_len, entry_count
        )));
    }
    Ok(ObjectFooter {
        index_position,
        index_len,
        entry_count,
    })
}

pub(crate) fn parse_index(mut buf: Bytes, entry_count: u32) -> Result<Vec<DataBlockIndex>> {
    if buf.len() != entry_count as usize * INDEX_ENTRY_SIZE {
        return Err(StorageError::Codec(format!(
            "index buffer of {} bytes cannot hold {} entries",
            buf.len(),
            entry_count
        )));
    }
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        entries.push(DataBlockIndex {
            stream_id: buf.get_u64(),
            start_offset: buf.get_u64(),
            end_offset: buf.get_u64(),
            record_count: buf.get_u32(),
            position: buf.get_u64(),
            size: buf.get_u32(),
        });
    }
    Ok(entries)
}

/// Decode every record frame of a data block, validating CRCs.
pub(crate) fn decode_data_block(mut buf: Bytes) -> Result<Vec<StreamRecordBatch>> {
    let mut records = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Err(StorageError::Codec("truncated record frame header".to_string()));
        }
        let len = buf.get_u32() as usize;
        let crc = buf.get_u32();
        if buf.remaining() < len {
            return Err(StorageError::Codec(format!(
                "truncated record frame: need {} bytes, have {}",
                len,
                buf.remaining()
            )));
        }
        let payload = buf.split_to(len);
        let computed = crc32fast::hash(&payload);
        if computed != crc {
            return Err(StorageError::Codec(format!(
                "record frame crc mismatch: expected {:#x}, computed {:#x}",
                crc, computed
            )));
        }
        records.push(StreamRecordBatchCodec::decode(payload)?);
    }
    Ok(records)
}
