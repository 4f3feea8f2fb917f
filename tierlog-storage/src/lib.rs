mod config;
pub use config::{BackpressureMode, StorageConfig, UploadRetryPolicy};

// Ordering context: WAL callback sequencer and log cache
mod log_cache;
mod ordering;
mod sequencer;
pub use log_cache::{LogCacheBlock, LogCacheStats};

// Background context: WAL object uploads
mod object_format;
mod upload_task;
mod uploader;

mod s3_storage;
pub use s3_storage::{AppendHandle, S3Storage};

mod block_cache;
pub use block_cache::ObjectBlockCache;

// opendal-backed object store
pub mod cloud;
pub use cloud::{BackendConfig, CloudBackend, CloudStore, CloudWriter, LocalBackend};

// In-memory WAL and object manager
pub mod memory;
pub use memory::{AckMode, MemoryObjectManager, MemoryWriteAheadLog};

mod storage_metrics;

#[cfg(test)]
mod s3_storage_test;
#[cfg(test)]
mod test_support;
