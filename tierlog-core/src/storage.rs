use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Range;
use std::time::Duration;

use crate::errors::Result;
use crate::message::{ReadDataBlock, StreamRecordBatch};

/// Producer/consumer facing storage operations of the tiered engine.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append a batch; resolves once the batch is durable and released in stream order.
    async fn append(&self, batch: StreamRecordBatch) -> Result<()>;

    /// Read `[start_offset, end_offset)` of a stream, bounded by `max_bytes`.
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock>;

    /// Seal the open cache block if it holds data of the stream and upload it.
    async fn force_upload(&self, stream_id: u64) -> Result<()>;

    async fn close(&self);
}

/// Future resolving once the WAL has made an appended record durable.
pub type DurabilityFuture = BoxFuture<'static, Result<()>>;

/// Outcome of a WAL append: the offset assigned at submission and its durability future.
pub struct AppendResult {
    pub offset: u64,
    pub future: DurabilityFuture,
}

impl Debug for AppendResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendResult")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Write-ahead log contract.
///
/// Offsets are strictly increasing in submission order. Durability futures may resolve
/// out of submission order.
#[async_trait]
pub trait WriteAheadLog: Send + Sync + Debug {
    fn append(&self, data: Bytes) -> Result<AppendResult>;

    /// Release every record with an offset `<= offset`.
    async fn trim(&self, offset: u64) -> Result<()>;
}

/// Offset range of one stream inside a WAL object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStreamRange {
    pub stream_id: u64,
    pub epoch: u64,
    pub start_offset: u64,
    pub end_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitWalObjectRequest {
    pub object_id: u64,
    pub object_size: u64,
    pub stream_ranges: Vec<ObjectStreamRange>,
}

/// A committed object as known by the object manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3ObjectMetadata {
    pub object_id: u64,
    pub object_size: u64,
    pub stream_ranges: Vec<ObjectStreamRange>,
    pub committed_at: u64,
}

impl S3ObjectMetadata {
    pub fn key(&self) -> String {
        object_key(self.object_id)
    }

    pub fn range_of(&self, stream_id: u64) -> Option<&ObjectStreamRange> {
        self.stream_ranges.iter().find(|r| r.stream_id == stream_id)
    }
}

/// Object store key of a WAL object.
pub fn object_key(object_id: u64) -> String {
    format!("wal/objects/{:020}", object_id)
}

/// Object id allocation and commit.
#[async_trait]
pub trait ObjectManager: Send + Sync + Debug {
    /// Reserve `count` consecutive object ids; the reservation expires after `ttl`.
    async fn prepare_object(&self, count: u32, ttl: Duration) -> Result<u64>;

    async fn commit_wal_object(&self, request: CommitWalObjectRequest) -> Result<()>;

    /// Committed objects holding data of the stream in `[start_offset, end_offset)`,
    /// ordered by their start offset for that stream.
    async fn get_objects(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        limit: usize,
    ) -> Result<Vec<S3ObjectMetadata>>;
}

/// Chunked writer for one object.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, part: Bytes) -> Result<()>;

    /// Finish the object and return its size in bytes.
    async fn close(&mut self) -> Result<u64>;

    async fn abort(&mut self) -> Result<()>;
}

/// Object storage primitives used by uploads and cold reads.
#[async_trait]
pub trait S3Operator: Send + Sync + Debug {
    async fn writer(&self, path: &str, part_size: usize) -> Result<Box<dyn ObjectWriter>>;

    async fn range_read(&self, path: &str, range: Range<u64>) -> Result<Bytes>;

    async fn delete(&self, path: &str) -> Result<()>;
}

/// Read-through cache in front of the object store.
#[async_trait]
pub trait BlockCache: Send + Sync + Debug {
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock>;
}
