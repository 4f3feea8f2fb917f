use metrics::gauge;
use std::collections::{HashMap, VecDeque};
use tierlog_core::{EncodedRecordBatch, Result, StorageError};
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tracing::{debug, warn};

use crate::storage_metrics::WAL_CONFIRM_OFFSET;

/// Lifecycle of a WAL write request inside the sequencer.
#[derive(Debug)]
pub(crate) enum WriteState {
    Submitted,
    Persisted,
    Failed(StorageError),
}

impl WriteState {
    fn is_settled(&self) -> bool {
        !matches!(self, WriteState::Submitted)
    }
}

/// One encoded batch bound to its WAL offset and to the producer's completion handle.
#[derive(Debug)]
pub(crate) struct WalWriteRequest {
    pub(crate) record: EncodedRecordBatch,
    pub(crate) offset: u64,
    pub(crate) state: WriteState,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl WalWriteRequest {
    pub(crate) fn new(
        record: EncodedRecordBatch,
        offset: u64,
        done: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            record,
            offset,
            state: WriteState::Submitted,
            done: Some(done),
        }
    }

    pub(crate) fn stream_id(&self) -> u64 {
        self.record.stream_id
    }

    #[cfg(test)]
    pub(crate) fn is_persisted(&self) -> bool {
        matches!(self.state, WriteState::Persisted)
    }

    /// Take the failure recorded by the WAL, if any.
    pub(crate) fn take_failure(&mut self) -> Option<StorageError> {
        match std::mem::replace(&mut self.state, WriteState::Persisted) {
            WriteState::Failed(e) => Some(e),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Resolve the producer's completion handle. Later calls are no-ops.
    pub(crate) fn complete(&mut self, result: Result<()>) {
        if let Some(tx) = self.done.take() {
            // the producer may have given up on the append; nothing to notify then
            let _ = tx.send(result);
        }
    }
}

/// Entry of the global FIFO. Holds the backpressure permit until the watermark passes it.
#[derive(Debug)]
struct PendingOffset {
    offset: u64,
    settled: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Reorders out-of-order WAL acknowledgments into per-stream ordered release and a single
/// global confirm offset.
///
/// Notes
/// - The global FIFO holds every outstanding request in WAL offset order and is bounded by
///   `capacity`; the confirm offset only moves over its settled prefix.
/// - Each stream FIFO holds that stream's requests in submission order; requests leave it only
///   as a contiguous settled prefix, so producers observe completions in submission order.
/// - Owned by the ordering context: no interior locking.
#[derive(Debug)]
pub(crate) struct WalCallbackSequencer {
    capacity: usize,
    wal_requests: VecDeque<PendingOffset>,
    stream_requests: HashMap<u64, VecDeque<WalWriteRequest>>,
    wal_confirm_offset: Option<u64>,
}

impl WalCallbackSequencer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            wal_requests: VecDeque::with_capacity(capacity.min(4096)),
            stream_requests: HashMap::new(),
            wal_confirm_offset: None,
        }
    }

    /// Track a freshly submitted request.
    ///
    /// Returns `false` when the request could not be enqueued; its completion handle has then
    /// already been failed.
    pub(crate) fn before(
        &mut self,
        mut request: WalWriteRequest,
        permit: Option<OwnedSemaphorePermit>,
    ) -> bool {
        if self.wal_requests.len() >= self.capacity {
            warn!(
                target = "sequencer",
                offset = request.offset,
                capacity = self.capacity,
                "sequencer queue full, rejecting request"
            );
            request.complete(Err(StorageError::Backpressure(format!(
                "sequencer queue is full ({} outstanding requests)",
                self.capacity
            ))));
            return false;
        }
        if let Some(last) = self.wal_requests.back() {
            if request.offset <= last.offset {
                request.complete(Err(StorageError::InvalidState(format!(
                    "WAL offset {} is not greater than last submitted offset {}",
                    request.offset, last.offset
                ))));
                return false;
            }
        }
        self.wal_requests.push_back(PendingOffset {
            offset: request.offset,
            settled: false,
            _permit: permit,
        });
        self.stream_requests
            .entry(request.stream_id())
            .or_default()
            .push_back(request);
        true
    }

    /// Record the WAL outcome of `(stream_id, offset)` and return the requests of that stream
    /// that are now releasable, in submission order.
    ///
    /// An empty result means the request is still blocked behind an earlier unsettled request
    /// of the same stream.
    pub(crate) fn after(
        &mut self,
        stream_id: u64,
        offset: u64,
        outcome: Result<()>,
    ) -> Vec<WalWriteRequest> {
        let Some(stream_queue) = self.stream_requests.get_mut(&stream_id) else {
            warn!(target = "sequencer", stream_id, offset, "ack for unknown stream");
            return Vec::new();
        };
        let Ok(idx) = stream_queue.binary_search_by_key(&offset, |r| r.offset) else {
            warn!(target = "sequencer", stream_id, offset, "ack for unknown request");
            return Vec::new();
        };
        stream_queue[idx].state = match outcome {
            Ok(()) => WriteState::Persisted,
            Err(e) => WriteState::Failed(e),
        };
        if let Ok(gidx) = self.wal_requests.binary_search_by_key(&offset, |p| p.offset) {
            self.wal_requests[gidx].settled = true;
        }

        // move the WAL inclusive confirm offset
        let mut advanced = false;
        while let Some(head) = self.wal_requests.front() {
            if !head.settled {
                break;
            }
            self.wal_confirm_offset = Some(head.offset);
            self.wal_requests.pop_front();
            advanced = true;
        }
        if advanced {
            if let Some(confirm) = self.wal_confirm_offset {
                gauge!(WAL_CONFIRM_OFFSET.name).set(confirm as f64);
                debug!(target = "sequencer", confirm_offset = confirm, "wal confirm offset moved");
            }
        }

        // pop the settled prefix of the stream queue, starting at this request only
        let stream_queue = match self.stream_requests.get_mut(&stream_id) {
            Some(q) => q,
            None => return Vec::new(),
        };
        match stream_queue.front() {
            Some(head) if head.offset == offset => {}
            _ => return Vec::new(),
        }
        let mut released = Vec::new();
        while let Some(head) = stream_queue.front() {
            if !head.state.is_settled() {
                break;
            }
            if let Some(req) = stream_queue.pop_front() {
                released.push(req);
            }
        }
        if stream_queue.is_empty() {
            self.stream_requests.remove(&stream_id);
        }
        released
    }

    /// Inclusive WAL confirm offset; `None` until the first offset is confirmed.
    pub(crate) fn wal_confirm_offset(&self) -> Option<u64> {
        self.wal_confirm_offset
    }

    /// Number of requests not yet passed by the confirm offset.
    pub(crate) fn outstanding(&self) -> usize {
        self.wal_requests.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.wal_requests.is_empty() && self.stream_requests.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn tracked_streams(&self) -> usize {
        self.stream_requests.len()
    }
}
