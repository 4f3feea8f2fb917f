use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tierlog_core::storage::{AppendResult, WriteAheadLog};
use tierlog_core::{Result, StorageError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// When durability futures of the memory WAL resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Every append is durable as soon as it is accepted.
    #[default]
    Immediate,
    /// Appends stay pending until `ack` / `fail` is called, in any order.
    Manual,
}

#[derive(Debug, Default)]
struct WalState {
    records: BTreeMap<u64, Bytes>,
    pending: HashMap<u64, oneshot::Sender<Result<()>>>,
    trimmed: Option<u64>,
}

/// Memory-only write-ahead log (no durability).
///
/// Offsets start at 0 and increase by one per append. In `AckMode::Manual` the caller drives
/// acknowledgments, which makes out-of-order WAL completion reproducible.
#[derive(Debug, Clone)]
pub struct MemoryWriteAheadLog {
    inner: Arc<MemoryWalInner>,
}

#[derive(Debug)]
struct MemoryWalInner {
    mode: AckMode,
    next_offset: AtomicU64,
    state: Mutex<WalState>,
}

impl Default for MemoryWriteAheadLog {
    fn default() -> Self {
        Self::new(AckMode::Immediate)
    }
}

impl MemoryWriteAheadLog {
    pub fn new(mode: AckMode) -> Self {
        Self {
            inner: Arc::new(MemoryWalInner {
                mode,
                next_offset: AtomicU64::new(0),
                state: Mutex::new(WalState::default()),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, WalState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| StorageError::Wal("memory wal state poisoned".to_string()))
    }

    /// Mark a pending append durable. Returns `false` if the offset is not pending.
    pub fn ack(&self, offset: u64) -> bool {
        self.resolve(offset, Ok(()))
    }

    /// Fail a pending append. Returns `false` if the offset is not pending.
    pub fn fail(&self, offset: u64, reason: &str) -> bool {
        self.resolve(offset, Err(StorageError::Wal(reason.to_string())))
    }

    fn resolve(&self, offset: u64, result: Result<()>) -> bool {
        let tx = match self.state() {
            Ok(mut state) => {
                if result.is_err() {
                    state.records.remove(&offset);
                }
                state.pending.remove(&offset)
            }
            Err(e) => {
                warn!(target = "memory_wal", offset, error = %e, "cannot resolve append");
                None
            }
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Offsets appended but not yet acknowledged, ascending.
    pub fn pending_offsets(&self) -> Vec<u64> {
        let mut offsets: Vec<u64> = self
            .state()
            .map(|s| s.pending.keys().copied().collect())
            .unwrap_or_default();
        offsets.sort_unstable();
        offsets
    }

    /// Highest offset passed to `trim`, if any.
    pub fn trimmed_offset(&self) -> Option<u64> {
        self.state().ok().and_then(|s| s.trimmed)
    }

    /// Number of records still retained.
    pub fn retained(&self) -> usize {
        self.state().map(|s| s.records.len()).unwrap_or(0)
    }

    /// Next offset that will be assigned.
    pub fn next_offset(&self) -> u64 {
        self.inner.next_offset.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WriteAheadLog for MemoryWriteAheadLog {
    fn append(&self, data: Bytes) -> Result<AppendResult> {
        let mut state = self.state()?;
        let offset = self.inner.next_offset.fetch_add(1, Ordering::AcqRel);
        state.records.insert(offset, data);
        let future = match self.inner.mode {
            AckMode::Immediate => futures::future::ready(Ok(())).boxed(),
            AckMode::Manual => {
                let (tx, rx) = oneshot::channel();
                state.pending.insert(offset, tx);
                rx.map(|res| {
                    res.unwrap_or_else(|_| {
                        Err(StorageError::Wal("append dropped before acknowledgment".to_string()))
                    })
                })
                .boxed()
            }
        };
        Ok(AppendResult { offset, future })
    }

    async fn trim(&self, offset: u64) -> Result<()> {
        let mut state = self.state()?;
        let kept = state.records.split_off(&offset.saturating_add(1));
        let dropped = std::mem::replace(&mut state.records, kept).len();
        if state.trimmed.map_or(true, |t| offset > t) {
            state.trimmed = Some(offset);
        }
        debug!(target = "memory_wal", offset, dropped, "trimmed wal");
        Ok(())
    }
}
