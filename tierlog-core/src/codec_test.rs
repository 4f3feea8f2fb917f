#[cfg(test)]
mod tests {
    use crate::codec::{StreamRecordBatchCodec, HEADER_SIZE};
    use crate::message::{EncodedRecordBatch, ReadDataBlock, StreamRecordBatch};
    use crate::StorageError;
    use bytes::{Bytes, BytesMut};

    fn make_batch(stream_id: u64, base_offset: u64, count: u32) -> StreamRecordBatch {
        StreamRecordBatch::new(
            stream_id,
            3,
            base_offset,
            count,
            Bytes::from(format!("payload-{}-{}", stream_id, base_offset)),
        )
    }

    /// Test: Codec round trip
    ///
    /// Purpose
    /// - Validate decode(encode(b)) keeps stream id, epoch, base offset, count and payload
    ///
    /// Expected
    /// - Decoded batch equals the original; encoded length is header + payload
    #[test]
    fn test_codec_round_trip() {
        let batch = make_batch(7, 100, 50);
        let encoded = StreamRecordBatchCodec::encode(&batch).expect("encode");
        assert_eq!(encoded.len(), HEADER_SIZE + batch.payload.len());

        let decoded = StreamRecordBatchCodec::decode(encoded).expect("decode");
        assert_eq!(decoded, batch);
        assert_eq!(decoded.last_offset(), 150);
    }

    /// Test: Encoded form owns its buffer
    ///
    /// Purpose
    /// - The encoded write unit must not alias the producer payload
    ///
    /// Flow
    /// - Encode from a payload backed by a mutable buffer, then overwrite that buffer
    ///
    /// Expected
    /// - Decoding the encoded unit still yields the original content
    #[test]
    fn test_encoded_batch_is_detached_from_payload() {
        let mut producer_buf = BytesMut::from(&b"original"[..]);
        let batch = StreamRecordBatch::new(1, 0, 0, 1, producer_buf.clone().freeze());
        let flat = EncodedRecordBatch::from_batch(&batch).expect("encode");

        producer_buf.clear();
        producer_buf.extend_from_slice(b"reused!!");

        let decoded = flat.decode().expect("decode");
        assert_eq!(&decoded.payload[..], b"original");
        assert_eq!(flat.last_offset, 1);
        assert_eq!(flat.size, 8);
    }

    /// Test: Corrupt input is rejected
    ///
    /// Expected
    /// - Short buffers, wrong magic and inconsistent lengths all return Codec errors
    #[test]
    fn test_decode_rejects_corrupt_input() {
        let short = Bytes::from_static(&[0x22, 0, 1]);
        assert!(matches!(
            StreamRecordBatchCodec::decode(short),
            Err(StorageError::Codec(_))
        ));

        let mut bad_magic = StreamRecordBatchCodec::encode(&make_batch(1, 0, 1))
            .expect("encode")
            .to_vec();
        bad_magic[0] = 0x01;
        assert!(matches!(
            StreamRecordBatchCodec::decode(Bytes::from(bad_magic)),
            Err(StorageError::Codec(_))
        ));

        let mut truncated = StreamRecordBatchCodec::encode(&make_batch(1, 0, 1))
            .expect("encode")
            .to_vec();
        truncated.pop();
        assert!(matches!(
            StreamRecordBatchCodec::decode(Bytes::from(truncated)),
            Err(StorageError::Codec(_))
        ));
    }

    /// Test: Offset range overflow
    ///
    /// Expected
    /// - Encoding a batch whose range passes u64::MAX fails with a Codec error
    /// - last_offset saturates instead of wrapping
    #[test]
    fn test_encode_rejects_offset_overflow() {
        let batch = make_batch(1, u64::MAX - 2, 5);
        assert_eq!(batch.last_offset(), u64::MAX);
        assert!(matches!(
            StreamRecordBatchCodec::encode(&batch),
            Err(StorageError::Codec(_))
        ));
        assert!(matches!(
            EncodedRecordBatch::from_batch(&batch),
            Err(StorageError::Codec(_))
        ));

        let edge = make_batch(1, u64::MAX - 5, 5);
        assert_eq!(edge.last_offset(), u64::MAX);
        StreamRecordBatchCodec::encode(&edge).expect("range ending at u64::MAX fits");
    }

    #[test]
    fn test_batch_ordering_and_read_block() {
        let mut batches = vec![
            make_batch(2, 0, 1),
            make_batch(1, 10, 5),
            make_batch(1, 0, 10),
        ];
        batches.sort();
        assert_eq!(
            batches
                .iter()
                .map(|b| (b.stream_id, b.base_offset))
                .collect::<Vec<_>>(),
            vec![(1, 0), (1, 10), (2, 0)]
        );

        let block = ReadDataBlock::new(batches[..2].to_vec());
        assert_eq!(block.end_offset(), Some(15));
        assert_eq!(
            block.size_in_bytes(),
            batches[0].size() + batches[1].size()
        );
        assert_eq!(ReadDataBlock::empty().end_offset(), None);
    }
}
