use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tierlog_core::storage::{CommitWalObjectRequest, ObjectManager, S3ObjectMetadata};
use tierlog_core::{Result, StorageError};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// In-memory object manager: allocates object ids, tracks reservations and keeps committed
/// WAL objects indexed by id.
#[derive(Debug, Default)]
pub struct MemoryObjectManager {
    next_object_id: AtomicU64,
    // object_id -> reservation deadline
    prepared: DashMap<u64, Instant>,
    committed: RwLock<BTreeMap<u64, S3ObjectMetadata>>,
}

impl MemoryObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed objects in id order.
    pub async fn committed_objects(&self) -> Vec<S3ObjectMetadata> {
        self.committed.read().await.values().cloned().collect()
    }

    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }
}

#[async_trait]
impl ObjectManager for MemoryObjectManager {
    async fn prepare_object(&self, count: u32, ttl: Duration) -> Result<u64> {
        if count == 0 {
            return Err(StorageError::ObjectManager(
                "prepare_object requires count > 0".to_string(),
            ));
        }
        let first = self.next_object_id.fetch_add(count as u64, Ordering::AcqRel);
        let deadline = Instant::now() + ttl;
        for id in first..first + count as u64 {
            self.prepared.insert(id, deadline);
        }
        debug!(target = "object_manager", first_object_id = first, count, "prepared objects");
        Ok(first)
    }

    async fn commit_wal_object(&self, request: CommitWalObjectRequest) -> Result<()> {
        let mut committed = self.committed.write().await;
        if let Some(existing) = committed.get(&request.object_id) {
            // retried commit of the same object
            if existing.object_size == request.object_size
                && existing.stream_ranges == request.stream_ranges
            {
                return Ok(());
            }
            return Err(StorageError::ObjectManager(format!(
                "object {} already committed with different content",
                request.object_id
            )));
        }
        match self.prepared.remove(&request.object_id) {
            Some((_, deadline)) if deadline >= Instant::now() => {}
            Some(_) => {
                return Err(StorageError::ObjectManager(format!(
                    "object {} reservation expired",
                    request.object_id
                )))
            }
            None => {
                return Err(StorageError::ObjectManager(format!(
                    "object {} was never prepared",
                    request.object_id
                )))
            }
        }
        info!(
            target = "object_manager",
            object_id = request.object_id,
            object_size = request.object_size,
            streams = request.stream_ranges.len(),
            "committed wal object"
        );
        committed.insert(
            request.object_id,
            S3ObjectMetadata {
                object_id: request.object_id,
                object_size: request.object_size,
                stream_ranges: request.stream_ranges,
                committed_at: chrono::Utc::now().timestamp() as u64,
            },
        );
        Ok(())
    }

    async fn get_objects(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        limit: usize,
    ) -> Result<Vec<S3ObjectMetadata>> {
        let committed = self.committed.read().await;
        let mut objects: Vec<(u64, S3ObjectMetadata)> = committed
            .values()
            .filter_map(|obj| {
                let range = obj.range_of(stream_id)?;
                if range.end_offset > start_offset && range.start_offset < end_offset {
                    Some((range.start_offset, obj.clone()))
                } else {
                    None
                }
            })
            .collect();
        objects.sort_by_key(|(start, _)| *start);
        Ok(objects.into_iter().take(limit).map(|(_, o)| o).collect())
    }
}
