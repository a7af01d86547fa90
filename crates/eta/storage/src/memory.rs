//! In-memory reference implementation of the storage traits.
//!
//! Deterministic and test-friendly. A transaction holds the store's single
//! lock from `begin` until commit or rollback, which gives the same
//! one-writer-at-a-time discipline as the SQLite backend. Reads outside a
//! transaction wait for the lock and therefore see only committed state.

use crate::traits::{EtaStore, QueryWindow, ReferenceStore, StoreTransaction};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use eta_types::{
    IdempotencyRecord, RateLimitBucket, RejectionRecord, SegmentBinStats, SegmentKey,
    SegmentReference, TimeBin,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

type StatsKey = (SegmentKey, TimeBin);

#[derive(Debug, Default)]
struct MemoryState {
    stats: HashMap<StatsKey, SegmentBinStats>,
    rejections: Vec<RejectionRecord>,
    idempotency: HashMap<String, IdempotencyRecord>,
    buckets: HashMap<String, RateLimitBucket>,
}

/// In-memory learning-core storage.
#[derive(Debug, Default)]
pub struct InMemoryEtaStore {
    state: Arc<Mutex<MemoryState>>,
    commit_failures: Arc<AtomicU32>,
}

impl InMemoryEtaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with [`StorageError::Busy`] and
    /// discard their staged writes.
    pub fn inject_commit_failures(&self, count: u32) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    /// Committed rows, for assertions.
    pub async fn stats_row_count(&self) -> usize {
        self.state.lock().await.stats.len()
    }
}

#[async_trait]
impl EtaStore for InMemoryEtaStore {
    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            guard,
            commit_failures: Arc::clone(&self.commit_failures),
            stats: HashMap::new(),
            rejections: Vec::new(),
            idempotency: HashMap::new(),
            buckets: HashMap::new(),
        }))
    }

    async fn read_stats(
        &self,
        segment: &SegmentKey,
        bin: TimeBin,
    ) -> StorageResult<Option<SegmentBinStats>> {
        let state = self.state.lock().await;
        Ok(state.stats.get(&(segment.clone(), bin)).cloned())
    }

    async fn read_idempotency(&self, key: &str) -> StorageResult<Option<IdempotencyRecord>> {
        let state = self.state.lock().await;
        Ok(state.idempotency.get(key).cloned())
    }

    async fn read_bucket(&self, bucket_id: &str) -> StorageResult<Option<RateLimitBucket>> {
        let state = self.state.lock().await;
        Ok(state.buckets.get(bucket_id).cloned())
    }

    async fn list_rejections(&self, window: QueryWindow) -> StorageResult<Vec<RejectionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .rejections
            .iter()
            .rev()
            .skip(window.offset)
            .take(window.limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Staged writes layered over the locked committed state.
struct InMemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    commit_failures: Arc<AtomicU32>,
    stats: HashMap<StatsKey, SegmentBinStats>,
    rejections: Vec<RejectionRecord>,
    idempotency: HashMap<String, IdempotencyRecord>,
    buckets: HashMap<String, RateLimitBucket>,
}

impl InMemoryTransaction {
    fn take_injected_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn get_stats(
        &mut self,
        segment: &SegmentKey,
        bin: TimeBin,
    ) -> StorageResult<Option<SegmentBinStats>> {
        let key = (segment.clone(), bin);
        Ok(self
            .stats
            .get(&key)
            .or_else(|| self.guard.stats.get(&key))
            .cloned())
    }

    async fn put_stats(
        &mut self,
        segment: &SegmentKey,
        bin: TimeBin,
        stats: &SegmentBinStats,
    ) -> StorageResult<()> {
        if stats.m2 < 0.0 || !stats.mean.is_finite() {
            return Err(StorageError::InvalidInput(format!(
                "refusing malformed stats row for {segment} bin {bin}"
            )));
        }
        self.stats.insert((segment.clone(), bin), stats.clone());
        Ok(())
    }

    async fn append_rejection(&mut self, record: &RejectionRecord) -> StorageResult<()> {
        self.rejections.push(record.clone());
        Ok(())
    }

    async fn get_idempotency(&mut self, key: &str) -> StorageResult<Option<IdempotencyRecord>> {
        Ok(self
            .idempotency
            .get(key)
            .or_else(|| self.guard.idempotency.get(key))
            .cloned())
    }

    async fn put_idempotency(&mut self, record: &IdempotencyRecord) -> StorageResult<()> {
        self.idempotency.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn get_bucket(&mut self, bucket_id: &str) -> StorageResult<Option<RateLimitBucket>> {
        Ok(self
            .buckets
            .get(bucket_id)
            .or_else(|| self.guard.buckets.get(bucket_id))
            .cloned())
    }

    async fn put_bucket(&mut self, bucket: &RateLimitBucket) -> StorageResult<()> {
        self.buckets.insert(bucket.bucket_id.clone(), bucket.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        if self.take_injected_failure() {
            return Err(StorageError::Busy("injected commit failure".to_string()));
        }

        let InMemoryTransaction {
            mut guard,
            stats,
            rejections,
            idempotency,
            buckets,
            ..
        } = *self;
        guard.stats.extend(stats);
        guard.rejections.extend(rejections);
        guard.idempotency.extend(idempotency);
        guard.buckets.extend(buckets);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

/// In-memory segment reference data.
#[derive(Debug, Default)]
pub struct InMemoryReference {
    segments: RwLock<HashMap<SegmentKey, f64>>,
}

impl InMemoryReference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segments(references: impl IntoIterator<Item = SegmentReference>) -> Self {
        let segments = references
            .into_iter()
            .map(|r| (r.segment, r.scheduled_duration_sec))
            .collect();
        Self {
            segments: RwLock::new(segments),
        }
    }
}

#[async_trait]
impl ReferenceStore for InMemoryReference {
    async fn segment_exists(&self, segment: &SegmentKey) -> StorageResult<bool> {
        let guard = self
            .segments
            .read()
            .map_err(|_| StorageError::Backend("reference lock poisoned".to_string()))?;
        Ok(guard.contains_key(segment))
    }

    async fn scheduled_duration(&self, segment: &SegmentKey) -> StorageResult<Option<f64>> {
        let guard = self
            .segments
            .read()
            .map_err(|_| StorageError::Backend("reference lock poisoned".to_string()))?;
        Ok(guard.get(segment).copied())
    }

    async fn upsert_segment(&self, reference: SegmentReference) -> StorageResult<()> {
        validate_reference(&reference)?;
        let mut guard = self
            .segments
            .write()
            .map_err(|_| StorageError::Backend("reference lock poisoned".to_string()))?;
        guard.insert(reference.segment, reference.scheduled_duration_sec);
        Ok(())
    }

    async fn segment_count(&self) -> StorageResult<usize> {
        let guard = self
            .segments
            .read()
            .map_err(|_| StorageError::Backend("reference lock poisoned".to_string()))?;
        Ok(guard.len())
    }
}

pub(crate) fn validate_reference(reference: &SegmentReference) -> StorageResult<()> {
    let duration = reference.scheduled_duration_sec;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(StorageError::InvalidInput(format!(
            "scheduled duration for {} must be positive, got {duration}",
            reference.segment
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eta_types::RejectionReason;

    fn segment() -> SegmentKey {
        SegmentKey::new("500D", 0, "S1", "S2")
    }

    fn bin() -> TimeBin {
        TimeBin::new(40).unwrap()
    }

    fn stats(n: u64, mean: f64) -> SegmentBinStats {
        SegmentBinStats {
            n,
            mean,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn transaction_reads_its_own_writes() {
        let store = InMemoryEtaStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put_stats(&segment(), bin(), &stats(1, 100.0)).await.unwrap();
        assert_eq!(
            tx.get_stats(&segment(), bin()).await.unwrap(),
            Some(stats(1, 100.0))
        );
        tx.commit().await.unwrap();

        assert_eq!(
            store.read_stats(&segment(), bin()).await.unwrap(),
            Some(stats(1, 100.0))
        );
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let store = InMemoryEtaStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put_stats(&segment(), bin(), &stats(1, 100.0)).await.unwrap();
        tx.append_rejection(&RejectionRecord {
            segment: segment(),
            bin: bin(),
            value: 5000.0,
            mapmatch_confidence: 0.9,
            reason: RejectionReason::OutlierSigma,
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.read_stats(&segment(), bin()).await.unwrap(), None);
        assert!(store
            .list_rejections(QueryWindow::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn injected_commit_failure_is_busy_and_discards_writes() {
        let store = InMemoryEtaStore::new();
        store.inject_commit_failures(1);

        let mut tx = store.begin().await.unwrap();
        tx.put_stats(&segment(), bin(), &stats(1, 100.0)).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_busy());
        assert_eq!(store.stats_row_count().await, 0);

        let mut tx = store.begin().await.unwrap();
        tx.put_stats(&segment(), bin(), &stats(1, 100.0)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.stats_row_count().await, 1);
    }

    #[tokio::test]
    async fn rejects_negative_m2() {
        let store = InMemoryEtaStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut row = stats(3, 10.0);
        row.m2 = -1.0;
        assert!(matches!(
            tx.put_stats(&segment(), bin(), &row).await,
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn reference_lookup() {
        let reference = InMemoryReference::with_segments([SegmentReference {
            segment: segment(),
            scheduled_duration_sec: 120.0,
        }]);
        assert!(reference.segment_exists(&segment()).await.unwrap());
        assert_eq!(
            reference.scheduled_duration(&segment()).await.unwrap(),
            Some(120.0)
        );
        let other = SegmentKey::new("500D", 1, "S2", "S1");
        assert!(!reference.segment_exists(&other).await.unwrap());
        assert!(reference
            .upsert_segment(SegmentReference {
                segment: other,
                scheduled_duration_sec: 0.0,
            })
            .await
            .is_err());
    }
}
