pub mod codec;
pub mod errors;
pub mod message;
pub mod storage;

pub use codec::StreamRecordBatchCodec;
pub use errors::{Result, StorageError};
pub use message::{EncodedRecordBatch, ReadDataBlock, StreamRecordBatch};

#[cfg(test)]
mod codec_test;
