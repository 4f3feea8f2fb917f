use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{Result, StorageError};
use crate::message::{EncodedRecordBatch, StreamRecordBatch};

/// Magic byte leading every encoded batch.
pub const MAGIC_V0: u8 = 0x22;

/// Fixed header: [u8 magic][u64 stream_id][u64 epoch][u64 base_offset][u32 count][u32 payload_len]
pub const HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 4 + 4;

/// Stateless encoder/decoder for [`StreamRecordBatch`]. All integers are big-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamRecordBatchCodec;

impl StreamRecordBatchCodec {
    /// Encode a batch. Fails if the payload does not fit the `u32` length field or the
    /// batch's offset range overflows.
    pub fn encode(batch: &StreamRecordBatch) -> Result<Bytes> {
        let payload_len = u32::try_from(batch.payload.len()).map_err(|_| {
            StorageError::Codec(format!(
                "payload of {} bytes exceeds the u32 length field",
                batch.payload.len()
            ))
        })?;
        if batch.base_offset.checked_add(batch.count as u64).is_none() {
            return Err(StorageError::Codec(format!(
                "offset range overflows: base {} count {}",
                batch.base_offset, batch.count
            )));
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + batch.payload.len());
        buf.put_u8(MAGIC_V0);
        buf.put_u64(batch.stream_id);
        buf.put_u64(batch.epoch);
        buf.put_u64(batch.base_offset);
        buf.put_u32(batch.count);
        buf.put_u32(payload_len);
        buf.put_slice(&batch.payload);
        Ok(buf.freeze())
    }

    /// Decode one batch. The returned payload shares memory with `buf`.
    pub fn decode(mut buf: Bytes) -> Result<StreamRecordBatch> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::Codec(format!(
                "buffer too short for batch header: {} < {}",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let magic = buf.get_u8();
        if magic != MAGIC_V0 {
            return Err(StorageError::Codec(format!("unknown magic byte {:#04x}", magic)));
        }
        let stream_id = buf.get_u64();
        let epoch = buf.get_u64();
        let base_offset = buf.get_u64();
        let count = buf.get_u32();
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() != payload_len {
            return Err(StorageError::Codec(format!(
                "payload length mismatch: header says {}, found {}",
                payload_len,
                buf.remaining()
            )));
        }
        Ok(StreamRecordBatch {
            stream_id,
            epoch,
            base_offset,
            count,
            payload: buf,
        })
    }

    pub fn decode_all(batches: &[EncodedRecordBatch]) -> Result<Vec<StreamRecordBatch>> {
        batches.iter().map(|b| b.decode()).collect()
    }
}
