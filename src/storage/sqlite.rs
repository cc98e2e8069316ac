//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: The outbox scan and the read surface do not block drain commits
//! - **Connection pooling**: Shared by every task holding the backend
//! - **Migrations**: `records` and `raw_records` are created by sqlx migrations
//!
//! Batches are written row by row inside one transaction, which keeps every
//! statement far below SQLite's bound-parameter limit even for drain batches
//! of several thousand records.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{RawRecord, RecordFilter, RecordRow, StoredRecord, SyncStatus};
use crate::{EntityId, Sample};

const SAMPLE_COLUMNS: &str =
    "time, cpu, maxcpu, mem, maxmem, disk, maxdisk, netin, netout, diskread, diskwrite";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database file and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn bind_sample<'q>(
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        sample: &Sample,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(sample.time)
            .bind(sample.cpu)
            .bind(sample.max_cpu)
            .bind(sample.mem)
            .bind(sample.max_mem)
            .bind(sample.disk)
            .bind(sample.max_disk)
            .bind(sample.net_in)
            .bind(sample.net_out)
            .bind(sample.disk_read)
            .bind(sample.disk_write)
    }

    fn sample_from_row(row: &SqliteRow) -> Result<Sample, sqlx::Error> {
        Ok(Sample {
            time: row.try_get("time")?,
            cpu: row.try_get("cpu")?,
            max_cpu: row.try_get("maxcpu")?,
            mem: row.try_get("mem")?,
            max_mem: row.try_get("maxmem")?,
            disk: row.try_get("disk")?,
            max_disk: row.try_get("maxdisk")?,
            net_in: row.try_get("netin")?,
            net_out: row.try_get("netout")?,
            disk_read: row.try_get("diskread")?,
            disk_write: row.try_get("diskwrite")?,
        })
    }

    fn stored_from_row(row: &SqliteRow) -> StorageResult<StoredRecord> {
        let status: String = row.try_get("sync_status")?;
        let sync_status = SyncStatus::parse(&status)
            .ok_or_else(|| StorageError::InvalidRow(format!("unknown sync_status '{status}'")))?;

        Ok(StoredRecord {
            id: row.try_get("id")?,
            vmid: row.try_get("vmid")?,
            sample: Self::sample_from_row(row)?,
            sync_status,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?),
        })
    }

    fn raw_from_row(row: &SqliteRow) -> StorageResult<RawRecord> {
        Ok(RawRecord {
            id: row.try_get("id")?,
            vmid: row.try_get("vmid")?,
            sample: Self::sample_from_row(row)?,
            topic: row.try_get("topic")?,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?),
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn insert_batch(&self, records: Vec<RecordRow>) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO records (vmid, {SAMPLE_COLUMNS}, sync_status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)"
        );

        let mut tx = self.pool.begin().await?;

        for record in &records {
            let query = sqlx::query(&sql).bind(record.vmid);
            Self::bind_sample(query, &record.sample)
                .bind(Self::timestamp_to_millis(&record.created_at))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        debug!("batch insert complete");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_pending(&self) -> StorageResult<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT id, vmid, {SAMPLE_COLUMNS}, sync_status, created_at \
             FROM records WHERE sync_status = 'pending' ORDER BY id ASC"
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::stored_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn mark_delivered(&self, id: i64) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE records SET sync_status = 'delivered' \
             WHERE id = ? AND sync_status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn latest_per_entity(&self) -> StorageResult<Vec<(EntityId, Sample)>> {
        let sql = format!(
            "SELECT r.id, r.vmid, {cols} FROM records r \
             JOIN (SELECT vmid, MAX(time) AS max_time FROM records GROUP BY vmid) latest \
               ON r.vmid = latest.vmid AND r.time = latest.max_time \
             ORDER BY r.id ASC",
            cols = SAMPLE_COLUMNS
                .split(", ")
                .map(|c| format!("r.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        // Duplicate (vmid, time) rows are possible after a partially failed
        // drain; they carry the same sample, keep one.
        let mut latest: HashMap<EntityId, Sample> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let vmid: EntityId = row.try_get("vmid")?;
            latest.insert(vmid, Self::sample_from_row(row)?);
        }

        debug!("loaded latest sample for {} guests", latest.len());
        Ok(latest.into_iter().collect())
    }

    #[instrument(skip(self))]
    async fn query_records(&self, filter: RecordFilter) -> StorageResult<Vec<StoredRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT id, vmid, {SAMPLE_COLUMNS}, sync_status, created_at FROM records WHERE 1 = 1"
        ));

        if !filter.vmids.is_empty() {
            qb.push(" AND vmid IN (");
            let mut ids = qb.separated(", ");
            for vmid in &filter.vmids {
                ids.push_bind(*vmid);
            }
            ids.push_unseparated(")");
        }
        if let Some(from) = filter.from {
            qb.push(" AND time >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND time <= ").push_bind(to);
        }

        qb.push(" ORDER BY time DESC, id DESC");

        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let records: StorageResult<Vec<StoredRecord>> =
            rows.iter().map(Self::stored_from_row).collect();

        let records = records?;
        debug!("query returned {} records", records.len());
        Ok(records)
    }

    #[instrument(skip(self, record), fields(vmid = record.vmid, topic = %record.topic))]
    async fn insert_raw(&self, record: RawRecord) -> StorageResult<()> {
        let sql = format!(
            "INSERT INTO raw_records (vmid, {SAMPLE_COLUMNS}, topic, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );

        let query = sqlx::query(&sql).bind(record.vmid);
        Self::bind_sample(query, &record.sample)
            .bind(&record.topic)
            .bind(Self::timestamp_to_millis(&record.created_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_raw(&self, limit: usize) -> StorageResult<Vec<RawRecord>> {
        let sql = format!(
            "SELECT id, vmid, {SAMPLE_COLUMNS}, topic, created_at \
             FROM raw_records ORDER BY id DESC LIMIT ?"
        );

        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::raw_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
