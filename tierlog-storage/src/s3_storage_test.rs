#[cfg(test)]
mod tests {
    use crate::config::{BackpressureMode, StorageConfig};
    use crate::memory::{AckMode, MemoryObjectManager, MemoryWriteAheadLog};
    use crate::s3_storage::S3Storage;
    use crate::test_support::{batch, flaky_operator, FlakyOperator};
    use async_trait::async_trait;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tierlog_core::storage::BlockCache;
    use tierlog_core::{ReadDataBlock, Result, StorageError};

    fn config(sequencer_capacity: usize, backpressure: BackpressureMode) -> StorageConfig {
        StorageConfig {
            sequencer_capacity,
            backpressure,
            ..StorageConfig::default()
        }
    }

    fn storage(
        cfg: StorageConfig,
        wal: &Arc<MemoryWriteAheadLog>,
    ) -> (Arc<S3Storage>, Arc<MemoryObjectManager>, Arc<FlakyOperator>) {
        let om = Arc::new(MemoryObjectManager::new());
        let op = flaky_operator();
        let storage = S3Storage::with_object_store(cfg, wal.clone(), om.clone(), op.clone())
            .expect("storage");
        (Arc::new(storage), om, op)
    }

    async fn eventually<F, Fut>(mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..500 {
            if condition().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Block cache that always serves stream 7 [250,300) and counts lookups.
    #[derive(Debug, Default)]
    struct FixedBlockCache {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl BlockCache for FixedBlockCache {
        async fn read(
            &self,
            _stream_id: u64,
            _start_offset: u64,
            _end_offset: u64,
            _max_bytes: usize,
        ) -> Result<ReadDataBlock> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(ReadDataBlock::new(vec![batch(7, 250, 50, 16)]))
        }
    }

    /// Test: Out-of-order WAL acks are released in stream order
    ///
    /// Purpose
    /// - Offsets 100/150/200 of one stream complete 200 first, then 100, then 150
    ///
    /// Flow
    /// - Submit three batches in manual ack mode
    /// - Ack WAL offsets 2, 0, 1
    ///
    /// Expected
    /// - The third append stays pending while earlier ones are not durable
    /// - All appends succeed; the cache holds the three batches in offset order
    /// - The confirm offset ends at 2
    #[tokio::test]
    async fn test_out_of_order_acks_release_in_stream_order() {
        let wal = Arc::new(MemoryWriteAheadLog::new(AckMode::Manual));
        let (storage, _, _) = storage(StorageConfig::default(), &wal);

        let h1 = storage.submit(batch(1, 100, 50, 16)).await.expect("submit");
        let h2 = storage.submit(batch(1, 150, 50, 16)).await.expect("submit");
        let mut h3 = storage.submit(batch(1, 200, 50, 16)).await.expect("submit");
        assert_eq!((h1.offset(), h2.offset(), h3.offset()), (0, 1, 2));

        assert!(wal.ack(2));
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut h3).await.is_err());
        assert!(wal.ack(0));
        h1.await.expect("first append");
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut h3).await.is_err());
        assert!(wal.ack(1));
        h2.await.expect("second append");
        h3.await.expect("third append");

        let got = storage.read(1, 100, 250, usize::MAX).await.expect("read");
        let bases: Vec<u64> = got.records().iter().map(|r| r.base_offset).collect();
        assert_eq!(bases, vec![100, 150, 200]);
        assert_eq!(storage.wal_confirm_offset().await.expect("offset"), Some(2));
        storage.close().await;
    }

    /// Test: Fail-fast backpressure
    ///
    /// Expected
    /// - With two slots in flight the third submit fails with Backpressure
    /// - Once the first append is released a slot frees up again
    #[tokio::test]
    async fn test_backpressure_fail_mode() {
        let wal = Arc::new(MemoryWriteAheadLog::new(AckMode::Manual));
        let (storage, _, _) = storage(config(2, BackpressureMode::Fail), &wal);

        let h0 = storage.submit(batch(1, 0, 1, 8)).await.expect("submit");
        let h1 = storage.submit(batch(2, 0, 1, 8)).await.expect("submit");
        assert!(matches!(
            storage.submit(batch(3, 0, 1, 8)).await,
            Err(StorageError::Backpressure(_))
        ));

        wal.ack(0);
        h0.await.expect("append 0");
        let h2 = storage.submit(batch(3, 0, 1, 8)).await.expect("slot freed");
        wal.ack(1);
        wal.ack(2);
        h1.await.expect("append 1");
        h2.await.expect("append 2");
        storage.close().await;
    }

    /// Test: Closing wakes producers waiting for a slot
    ///
    /// Flow
    /// - Capacity one, wait mode; first append pending in the WAL
    /// - Second producer blocks on the slot; close the storage concurrently
    ///
    /// Expected
    /// - The blocked producer fails with Closed
    /// - close() completes once the pending append is acknowledged, which still succeeds
    /// - Later calls fail with Closed
    #[tokio::test]
    async fn test_close_fails_waiting_producers_and_drains() {
        let wal = Arc::new(MemoryWriteAheadLog::new(AckMode::Manual));
        let (storage, _, _) = storage(config(1, BackpressureMode::Wait), &wal);

        let first = storage.submit(batch(1, 0, 1, 8)).await.expect("submit");
        let blocked = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.submit(batch(1, 1, 1, 8)).await.map(|_| ()) })
        };
        let closing = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.close().await })
        };
        let blocked = blocked.await.expect("producer task");
        assert!(matches!(blocked, Err(StorageError::Closed)));

        wal.ack(0);
        first.await.expect("pending append drains");
        closing.await.expect("close task");

        assert!(matches!(storage.append(batch(1, 1, 1, 8)).await, Err(StorageError::Closed)));
        assert!(matches!(storage.read(1, 0, 1, 64).await, Err(StorageError::Closed)));
        storage.close().await;
    }

    /// Test: WAL failure only fails its own append
    ///
    /// Expected
    /// - The failed append reports the WAL error and is not readable
    /// - Later appends of the same stream succeed and are readable
    #[tokio::test]
    async fn test_wal_failure_fails_single_append() {
        let wal = Arc::new(MemoryWriteAheadLog::new(AckMode::Manual));
        let (storage, _, _) = storage(StorageConfig::default(), &wal);

        let failed = storage.submit(batch(4, 0, 10, 8)).await.expect("submit");
        wal.fail(0, "replica lost");
        assert!(matches!(failed.await, Err(StorageError::Wal(_))));

        let ok = storage.submit(batch(4, 10, 10, 8)).await.expect("submit");
        wal.ack(1);
        ok.await.expect("append");
        assert!(storage.read(4, 0, 10, usize::MAX).await.expect("read").is_empty());
        let got = storage.read(4, 10, 20, usize::MAX).await.expect("read");
        assert_eq!(got.end_offset(), Some(20));
        assert_eq!(storage.wal_confirm_offset().await.expect("offset"), Some(1));
        storage.close().await;
    }

    /// Test: Force upload of a stream absent from the open block is a no-op
    ///
    /// Expected
    /// - No block archived and nothing committed for the absent stream
    /// - Forcing the present stream archives the block and commits one object
    #[tokio::test]
    async fn test_force_upload_only_for_present_stream() {
        let wal = Arc::new(MemoryWriteAheadLog::default());
        let (storage, om, _) = storage(StorageConfig::default(), &wal);
        storage.append(batch(5, 0, 10, 32)).await.expect("append");

        storage.force_upload(6).await.expect("no-op");
        let stats = storage.cache_stats().await.expect("stats");
        assert_eq!(stats.archived_blocks, 0);
        assert_eq!(stats.open_block_id, 0);
        assert!(om.committed_objects().await.is_empty());

        storage.force_upload(5).await.expect("force upload");
        assert_eq!(om.committed_objects().await.len(), 1);
        let stats = storage.cache_stats().await.expect("stats");
        assert_eq!(stats.archived_blocks, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(wal.trimmed_offset(), Some(0));
        storage.close().await;
    }

    /// Test: One ack releasing several batches across the capacity boundary
    ///
    /// Purpose
    /// - The WAL must never be trimmed past a batch that is not part of a committed object
    ///
    /// Flow
    /// - Capacity 80 bytes, manual acks; stream 7 submits a 97-byte batch (offset 0) then a
    ///   41-byte batch (offset 1)
    /// - Ack offset 1 first, then offset 0, so both are released by the same ack while the
    ///   first alone already fills the block
    ///
    /// Expected
    /// - A single object commits covering [100,200), both batches sealed in the same block
    /// - The WAL is trimmed to offset 1 only after that, and the cache ends up empty
    /// - The second batch is read back from the object store
    #[tokio::test]
    async fn test_release_across_capacity_keeps_trim_within_committed_data() {
        let wal = Arc::new(MemoryWriteAheadLog::new(AckMode::Manual));
        let cfg = StorageConfig {
            log_cache_capacity: 80,
            ..StorageConfig::default()
        };
        let (storage, om, _) = storage(cfg, &wal);

        let h0 = storage.submit(batch(7, 100, 50, 64)).await.expect("submit");
        let h1 = storage.submit(batch(7, 150, 50, 8)).await.expect("submit");
        assert!(wal.ack(1));
        assert!(wal.ack(0));
        h0.await.expect("first append");
        h1.await.expect("second append");

        let settled = eventually(|| {
            let om = om.clone();
            let storage = storage.clone();
            async move {
                let committed = om.committed_objects().await.len() == 1;
                let freed = storage
                    .cache_stats()
                    .await
                    .map(|s| s.archived_blocks == 0 && s.total_size == 0)
                    .unwrap_or(false);
                committed && freed
            }
        })
        .await;
        assert!(settled, "block was not uploaded and freed");

        let objects = om.committed_objects().await;
        assert_eq!(objects.len(), 1);
        let range = objects[0].range_of(7).expect("stream 7 range");
        assert_eq!((range.start_offset, range.end_offset), (100, 200));
        assert_eq!(wal.trimmed_offset(), Some(1));
        assert_eq!(wal.retained(), 0);

        let got = storage.read(7, 150, 200, usize::MAX).await.expect("read");
        assert_eq!(got.records(), &[batch(7, 150, 50, 8)][..]);
        storage.close().await;
    }

    /// Test: Cache hit is authoritative even when the object store holds the next range
    ///
    /// Flow
    /// - Log cache holds stream 7 [100,250); the block cache serves [250,300)
    /// - Read [100,300)
    ///
    /// Expected
    /// - Only the cached run [100,250) is returned and the block cache is never consulted
    /// - A read starting at 250 misses the cache and is served by the block cache
    #[tokio::test]
    async fn test_cache_hit_does_not_consult_block_cache() {
        let wal = Arc::new(MemoryWriteAheadLog::default());
        let om = Arc::new(MemoryObjectManager::new());
        let block_cache = Arc::new(FixedBlockCache::default());
        let storage = S3Storage::new(
            StorageConfig::default(),
            wal.clone(),
            om,
            block_cache.clone(),
            flaky_operator(),
        )
        .expect("storage");
        for base in [100u64, 150, 200] {
            storage.append(batch(7, base, 50, 16)).await.expect("append");
        }

        let got = storage.read(7, 100, 300, usize::MAX).await.expect("read");
        let bases: Vec<u64> = got.records().iter().map(|r| r.base_offset).collect();
        assert_eq!(bases, vec![100, 150, 200]);
        assert_eq!(got.end_offset(), Some(250));
        assert_eq!(block_cache.reads.load(Ordering::SeqCst), 0);

        let got = storage.read(7, 250, 300, usize::MAX).await.expect("read");
        assert_eq!(got.end_offset(), Some(300));
        assert_eq!(block_cache.reads.load(Ordering::SeqCst), 1);
        storage.close().await;
    }
}
