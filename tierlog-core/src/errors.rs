use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Phase of a WAL object upload, carried by upload failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Prepare,
    Upload,
    Commit,
}

impl std::fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadPhase::Prepare => "prepare",
            UploadPhase::Upload => "upload",
            UploadPhase::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Object manager error: {0}")]
    ObjectManager(String),

    #[error("Object storage error: {0}")]
    ObjectStorage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Backpressure: {0}")]
    Backpressure(String),

    #[error("Storage is closed")]
    Closed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Upload of cache block {block_id} failed in {phase} phase: {reason}")]
    Upload {
        block_id: u64,
        phase: UploadPhase,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}
