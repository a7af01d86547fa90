//! SQLite adapter for the learning-core storage.
//!
//! Runs in WAL mode with a busy timeout. Write transactions open with
//! `BEGIN IMMEDIATE`, so concurrent writers queue on the database write lock
//! instead of failing late on a stale snapshot. Lock waits that outlast the
//! busy timeout come back as [`StorageError::Busy`].

use crate::memory::validate_reference;
use crate::traits::{EtaStore, QueryWindow, ReferenceStore, StoreTransaction};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eta_types::{
    IdempotencyRecord, RateLimitBucket, RejectionReason, RejectionRecord, SegmentBinStats,
    SegmentKey, SegmentReference, TimeBin,
};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// SQLite-backed storage adapter.
#[derive(Clone)]
pub struct SqliteEtaStore {
    pool: SqlitePool,
}

impl SqliteEtaStore {
    /// Open (creating if missing) the database at `database_url` and
    /// initialize the schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 8, Duration::from_secs(5)).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::InvalidInput(format!("bad sqlite url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(busy_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to open sqlite: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory database, mostly for tests.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to open sqlite: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS segments (
                route_id TEXT NOT NULL,
                direction_id INTEGER NOT NULL CHECK (direction_id IN (0, 1)),
                from_stop_id TEXT NOT NULL,
                to_stop_id TEXT NOT NULL,
                scheduled_duration_sec REAL NOT NULL CHECK (scheduled_duration_sec > 0),
                PRIMARY KEY (route_id, direction_id, from_stop_id, to_stop_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS segment_bin_stats (
                route_id TEXT NOT NULL,
                direction_id INTEGER NOT NULL,
                from_stop_id TEXT NOT NULL,
                to_stop_id TEXT NOT NULL,
                bin_id INTEGER NOT NULL CHECK (bin_id BETWEEN 0 AND 191),
                n INTEGER NOT NULL CHECK (n >= 0),
                mean REAL NOT NULL,
                m2 REAL NOT NULL CHECK (m2 >= 0),
                ema_mean REAL,
                ema_updated_at TEXT,
                last_updated TEXT,
                PRIMARY KEY (route_id, direction_id, from_stop_id, to_stop_id, bin_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rejection_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                route_id TEXT NOT NULL,
                direction_id INTEGER NOT NULL,
                from_stop_id TEXT NOT NULL,
                to_stop_id TEXT NOT NULL,
                bin_id INTEGER NOT NULL,
                value REAL NOT NULL,
                mapmatch_confidence REAL NOT NULL,
                reason TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_rejection_log_recorded_at ON rejection_log (recorded_at)",
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                body_hash TEXT NOT NULL,
                response TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_idempotency_created_at ON idempotency_keys (created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_buckets (
                bucket_id TEXT PRIMARY KEY,
                tokens REAL NOT NULL CHECK (tokens >= 0),
                last_refill TEXT NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EtaStore for SqliteEtaStore {
    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Box::new(SqliteTransaction { conn: Some(conn) }))
    }

    async fn read_stats(
        &self,
        segment: &SegmentKey,
        bin: TimeBin,
    ) -> StorageResult<Option<SegmentBinStats>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        fetch_stats(&mut conn, segment, bin).await
    }

    async fn read_idempotency(&self, key: &str) -> StorageResult<Option<IdempotencyRecord>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        fetch_idempotency(&mut conn, key).await
    }

    async fn read_bucket(&self, bucket_id: &str) -> StorageResult<Option<RateLimitBucket>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        fetch_bucket(&mut conn, bucket_id).await
    }

    async fn list_rejections(&self, window: QueryWindow) -> StorageResult<Vec<RejectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT route_id, direction_id, from_stop_id, to_stop_id, bin_id,
                   value, mapmatch_confidence, reason, recorded_at
              FROM rejection_log
             ORDER BY id DESC
             LIMIT ? OFFSET ?
            "#,
        )
        .bind(to_i64(window.limit)?)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(rejection_row_to_record).collect()
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for SqliteEtaStore {
    async fn segment_exists(&self, segment: &SegmentKey) -> StorageResult<bool> {
        Ok(self.scheduled_duration(segment).await?.is_some())
    }

    async fn scheduled_duration(&self, segment: &SegmentKey) -> StorageResult<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT scheduled_duration_sec FROM segments
             WHERE route_id = ? AND direction_id = ? AND from_stop_id = ? AND to_stop_id = ?
            "#,
        )
        .bind(&segment.route_id)
        .bind(i64::from(segment.direction_id))
        .bind(&segment.from_stop_id)
        .bind(&segment.to_stop_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| row.try_get::<f64, _>("scheduled_duration_sec"))
            .transpose()
            .map_err(map_sqlx_error)
    }

    async fn upsert_segment(&self, reference: SegmentReference) -> StorageResult<()> {
        validate_reference(&reference)?;
        let segment = &reference.segment;
        sqlx::query(
            r#"
            INSERT INTO segments
                (route_id, direction_id, from_stop_id, to_stop_id, scheduled_duration_sec)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (route_id, direction_id, from_stop_id, to_stop_id)
            DO UPDATE SET scheduled_duration_sec = excluded.scheduled_duration_sec
            "#,
        )
        .bind(&segment.route_id)
        .bind(i64::from(segment.direction_id))
        .bind(&segment.from_stop_id)
        .bind(&segment.to_stop_id)
        .bind(reference.scheduled_duration_sec)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn segment_count(&self) -> StorageResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM segments")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        usize::try_from(count).map_err(|_| StorageError::Backend("negative count".to_string()))
    }
}

/// An open `BEGIN IMMEDIATE` transaction on a pooled connection.
struct SqliteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteTransaction {
    fn conn(&mut self) -> StorageResult<&mut PoolConnection<Sqlite>> {
        self.conn
            .as_mut()
            .ok_or_else(|| StorageError::Backend("transaction already finished".to_string()))
    }

    async fn finish(mut self: Box<Self>, statement: &'static str) -> StorageResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Err(StorageError::Backend(
                "transaction already finished".to_string(),
            ));
        };
        if let Err(err) = sqlx::query(statement).execute(&mut *conn).await {
            // The connection may still hold the transaction open; never hand
            // it back to the pool in that state.
            conn.close_on_drop();
            return Err(map_sqlx_error(err));
        }
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            warn!("sqlite transaction dropped without commit or rollback; closing connection");
            conn.close_on_drop();
        }
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn get_stats(
        &mut self,
        segment: &SegmentKey,
        bin: TimeBin,
    ) -> StorageResult<Option<SegmentBinStats>> {
        fetch_stats(self.conn()?, segment, bin).await
    }

    async fn put_stats(
        &mut self,
        segment: &SegmentKey,
        bin: TimeBin,
        stats: &SegmentBinStats,
    ) -> StorageResult<()> {
        let n = i64::try_from(stats.n)
            .map_err(|_| StorageError::InvalidInput("sample count too large".to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO segment_bin_stats
                (route_id, direction_id, from_stop_id, to_stop_id, bin_id,
                 n, mean, m2, ema_mean, ema_updated_at, last_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (route_id, direction_id, from_stop_id, to_stop_id, bin_id)
            DO UPDATE SET n = excluded.n,
                          mean = excluded.mean,
                          m2 = excluded.m2,
                          ema_mean = excluded.ema_mean,
                          ema_updated_at = excluded.ema_updated_at,
                          last_updated = excluded.last_updated
            "#,
        )
        .bind(&segment.route_id)
        .bind(i64::from(segment.direction_id))
        .bind(&segment.from_stop_id)
        .bind(&segment.to_stop_id)
        .bind(i64::from(bin.id()))
        .bind(n)
        .bind(stats.mean)
        .bind(stats.m2)
        .bind(stats.ema_mean)
        .bind(stats.ema_updated_at)
        .bind(stats.last_updated)
        .execute(&mut **self.conn()?)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn append_rejection(&mut self, record: &RejectionRecord) -> StorageResult<()> {
        let segment = &record.segment;
        sqlx::query(
            r#"
            INSERT INTO rejection_log
                (route_id, direction_id, from_stop_id, to_stop_id, bin_id,
                 value, mapmatch_confidence, reason, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&segment.route_id)
        .bind(i64::from(segment.direction_id))
        .bind(&segment.from_stop_id)
        .bind(&segment.to_stop_id)
        .bind(i64::from(record.bin.id()))
        .bind(record.value)
        .bind(record.mapmatch_confidence)
        .bind(record.reason.as_str())
        .bind(record.recorded_at)
        .execute(&mut **self.conn()?)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_idempotency(&mut self, key: &str) -> StorageResult<Option<IdempotencyRecord>> {
        fetch_idempotency(self.conn()?, key).await
    }

    async fn put_idempotency(&mut self, record: &IdempotencyRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, body_hash, response, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (key)
            DO UPDATE SET body_hash = excluded.body_hash,
                          response = excluded.response,
                          created_at = excluded.created_at
            "#,
        )
        .bind(&record.key)
        .bind(&record.body_hash)
        .bind(&record.response)
        .bind(record.created_at)
        .execute(&mut **self.conn()?)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_bucket(&mut self, bucket_id: &str) -> StorageResult<Option<RateLimitBucket>> {
        fetch_bucket(self.conn()?, bucket_id).await
    }

    async fn put_bucket(&mut self, bucket: &RateLimitBucket) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_buckets (bucket_id, tokens, last_refill)
            VALUES (?, ?, ?)
            ON CONFLICT (bucket_id)
            DO UPDATE SET tokens = excluded.tokens, last_refill = excluded.last_refill
            "#,
        )
        .bind(&bucket.bucket_id)
        .bind(bucket.tokens)
        .bind(bucket.last_refill)
        .execute(&mut **self.conn()?)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        self.finish("ROLLBACK").await
    }
}

async fn fetch_stats(
    conn: &mut PoolConnection<Sqlite>,
    segment: &SegmentKey,
    bin: TimeBin,
) -> StorageResult<Option<SegmentBinStats>> {
    let row = sqlx::query(
        r#"
        SELECT n, mean, m2, ema_mean, ema_updated_at, last_updated
          FROM segment_bin_stats
         WHERE route_id = ? AND direction_id = ? AND from_stop_id = ? AND to_stop_id = ?
           AND bin_id = ?
        "#,
    )
    .bind(&segment.route_id)
    .bind(i64::from(segment.direction_id))
    .bind(&segment.from_stop_id)
    .bind(&segment.to_stop_id)
    .bind(i64::from(bin.id()))
    .fetch_optional(&mut **conn)
    .await
    .map_err(map_sqlx_error)?;

    row.as_ref().map(stats_row_to_record).transpose()
}

async fn fetch_idempotency(
    conn: &mut PoolConnection<Sqlite>,
    key: &str,
) -> StorageResult<Option<IdempotencyRecord>> {
    let row = sqlx::query(
        "SELECT key, body_hash, response, created_at FROM idempotency_keys WHERE key = ?",
    )
    .bind(key)
    .fetch_optional(&mut **conn)
    .await
    .map_err(map_sqlx_error)?;

    row.map(|row| {
        Ok(IdempotencyRecord {
            key: row.try_get("key").map_err(map_sqlx_error)?,
            body_hash: row.try_get("body_hash").map_err(map_sqlx_error)?,
            response: row.try_get("response").map_err(map_sqlx_error)?,
            created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        })
    })
    .transpose()
}

async fn fetch_bucket(
    conn: &mut PoolConnection<Sqlite>,
    bucket_id: &str,
) -> StorageResult<Option<RateLimitBucket>> {
    let row = sqlx::query(
        "SELECT bucket_id, tokens, last_refill FROM rate_limit_buckets WHERE bucket_id = ?",
    )
    .bind(bucket_id)
    .fetch_optional(&mut **conn)
    .await
    .map_err(map_sqlx_error)?;

    row.map(|row| {
        Ok(RateLimitBucket {
            bucket_id: row.try_get("bucket_id").map_err(map_sqlx_error)?,
            tokens: row.try_get("tokens").map_err(map_sqlx_error)?,
            last_refill: row.try_get("last_refill").map_err(map_sqlx_error)?,
        })
    })
    .transpose()
}

fn stats_row_to_record(row: &SqliteRow) -> StorageResult<SegmentBinStats> {
    let n: i64 = row.try_get("n").map_err(map_sqlx_error)?;
    Ok(SegmentBinStats {
        n: u64::try_from(n)
            .map_err(|_| StorageError::Backend(format!("negative sample count {n}")))?,
        mean: row.try_get("mean").map_err(map_sqlx_error)?,
        m2: row.try_get("m2").map_err(map_sqlx_error)?,
        ema_mean: row.try_get("ema_mean").map_err(map_sqlx_error)?,
        ema_updated_at: row
            .try_get::<Option<DateTime<Utc>>, _>("ema_updated_at")
            .map_err(map_sqlx_error)?,
        last_updated: row
            .try_get::<Option<DateTime<Utc>>, _>("last_updated")
            .map_err(map_sqlx_error)?,
    })
}

fn rejection_row_to_record(row: &SqliteRow) -> StorageResult<RejectionRecord> {
    let direction_id: i64 = row.try_get("direction_id").map_err(map_sqlx_error)?;
    let bin_id: i64 = row.try_get("bin_id").map_err(map_sqlx_error)?;
    let reason: String = row.try_get("reason").map_err(map_sqlx_error)?;

    Ok(RejectionRecord {
        segment: SegmentKey {
            route_id: row.try_get("route_id").map_err(map_sqlx_error)?,
            direction_id: u8::try_from(direction_id)
                .map_err(|_| StorageError::Backend(format!("bad direction {direction_id}")))?,
            from_stop_id: row.try_get("from_stop_id").map_err(map_sqlx_error)?,
            to_stop_id: row.try_get("to_stop_id").map_err(map_sqlx_error)?,
        },
        bin: u16::try_from(bin_id)
            .ok()
            .and_then(|id| TimeBin::new(id).ok())
            .ok_or_else(|| StorageError::Backend(format!("bad bin id {bin_id}")))?,
        value: row.try_get("value").map_err(map_sqlx_error)?,
        mapmatch_confidence: row.try_get("mapmatch_confidence").map_err(map_sqlx_error)?,
        reason: reason
            .parse::<RejectionReason>()
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        recorded_at: row.try_get("recorded_at").map_err(map_sqlx_error)?,
    })
}

/// `SQLITE_BUSY` and `SQLITE_LOCKED`, including their extended codes.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::PoolTimedOut => return StorageError::Busy(err.to_string()),
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                return StorageError::Conflict(db_err.message().to_string());
            }
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
                return StorageError::Busy(db_err.message().to_string());
            }
        }
        _ => {}
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}
