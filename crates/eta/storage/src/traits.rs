use crate::StorageResult;
use async_trait::async_trait;
use eta_types::{
    IdempotencyRecord, RateLimitBucket, RejectionRecord, SegmentBinStats, SegmentKey,
    SegmentReference, TimeBin,
};

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl Default for QueryWindow {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// One open unit of work against the store.
///
/// Reads observe the transaction's own earlier writes. Nothing staged here is
/// visible to other readers until [`commit`](StoreTransaction::commit)
/// succeeds; dropping or rolling back discards everything.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn get_stats(
        &mut self,
        segment: &SegmentKey,
        bin: TimeBin,
    ) -> StorageResult<Option<SegmentBinStats>>;

    async fn put_stats(
        &mut self,
        segment: &SegmentKey,
        bin: TimeBin,
        stats: &SegmentBinStats,
    ) -> StorageResult<()>;

    /// Append to the rejection log. Records are never updated.
    async fn append_rejection(&mut self, record: &RejectionRecord) -> StorageResult<()>;

    async fn get_idempotency(&mut self, key: &str) -> StorageResult<Option<IdempotencyRecord>>;

    /// Insert or replace the record for `record.key`.
    async fn put_idempotency(&mut self, record: &IdempotencyRecord) -> StorageResult<()>;

    async fn get_bucket(&mut self, bucket_id: &str) -> StorageResult<Option<RateLimitBucket>>;

    async fn put_bucket(&mut self, bucket: &RateLimitBucket) -> StorageResult<()>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Storage owned by the learning core.
#[async_trait]
pub trait EtaStore: Send + Sync {
    /// Open a write transaction. Concurrent writers are serialized by the
    /// backend; contention surfaces as `StorageError::Busy`.
    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>>;

    /// Committed statistics row, read outside any transaction.
    async fn read_stats(
        &self,
        segment: &SegmentKey,
        bin: TimeBin,
    ) -> StorageResult<Option<SegmentBinStats>>;

    /// Committed idempotency record, read outside any transaction.
    async fn read_idempotency(&self, key: &str) -> StorageResult<Option<IdempotencyRecord>>;

    async fn read_bucket(&self, bucket_id: &str) -> StorageResult<Option<RateLimitBucket>>;

    /// Rejection log, newest first.
    async fn list_rejections(&self, window: QueryWindow) -> StorageResult<Vec<RejectionRecord>>;

    /// Cheap liveness probe.
    async fn ping(&self) -> StorageResult<()>;
}

/// Read-only segment reference data, owned by an external import process.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn segment_exists(&self, segment: &SegmentKey) -> StorageResult<bool>;

    /// Scheduled duration in seconds, `None` for unknown segments.
    async fn scheduled_duration(&self, segment: &SegmentKey) -> StorageResult<Option<f64>>;

    /// Seeding hook used at start-up and in tests.
    async fn upsert_segment(&self, reference: SegmentReference) -> StorageResult<()>;

    async fn segment_count(&self) -> StorageResult<usize>;
}
