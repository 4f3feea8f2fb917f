// In-process collaborators: a memory-only WAL and object manager for embedding and tests

mod object_manager;
mod wal;

pub use object_manager::MemoryObjectManager;
pub use wal::{AckMode, MemoryWriteAheadLog};
