use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::schemas::{DeliveryFilter, DeliveryRecord, DeliveryState, DeliveryStats};
use super::store::{DeliveryStore, StoreError};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS webhook_deliveries (\
        id TEXT PRIMARY KEY NOT NULL, \
        event_id TEXT NOT NULL, \
        event_type TEXT NOT NULL, \
        status TEXT NOT NULL, \
        created_at_ns INTEGER NOT NULL, \
        record TEXT NOT NULL\
    )";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_created \
    ON webhook_deliveries (created_at_ns DESC)";

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: String,
    record: String,
}

#[derive(sqlx::FromRow)]
struct StatusCountRow {
    status: String,
    count: i64,
}

/// Delivery records in SQLite. Each record is stored whole as JSON next to
/// the columns used for filtering.
#[derive(Debug, Clone)]
pub struct SqliteDeliveryStore {
    pool: SqlitePool,
}

impl SqliteDeliveryStore {
    /// Opens (creating if missing) the database at `url`, e.g.
    /// `sqlite://deliveries.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        Self::connect_with(options).await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // A single connection keeps `:memory:` databases shared across calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options.busy_timeout(Duration::from_millis(500)))
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;
        debug!("Delivery store schema ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DeliveryStore for SqliteDeliveryStore {
    async fn save(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(record)?;
        let created_at_ns = record.created_at.unix_timestamp_nanos() as i64;

        sqlx::query(
            "INSERT INTO webhook_deliveries \
                (id, event_id, event_type, status, created_at_ns, record) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                status = excluded.status, \
                record = excluded.record",
        )
        .bind(record.id.to_string())
        .bind(record.event_id.to_string())
        .bind(record.event_type.as_str())
        .bind(record.status.as_str())
        .bind(created_at_ns)
        .bind(encoded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryRecord>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT id, record FROM webhook_deliveries WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| serde_json::from_str(&row.record))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn list(&self, filter: &DeliveryFilter) -> Result<Vec<DeliveryRecord>, StoreError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, record FROM webhook_deliveries WHERE 1 = 1");

        if let Some(event_type) = filter.event_type {
            query.push(" AND event_type = ");
            query.push_bind(event_type.as_str());
        }

        if let Some(status) = filter.status {
            query.push(" AND status = ");
            query.push_bind(status.as_str());
        }

        query.push(" ORDER BY created_at_ns DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push(" LIMIT ");
            query.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<RecordRow> = query.build_query_as().fetch_all(&self.pool).await?;

        // One undecodable row must not hide the rest of the table.
        Ok(rows
            .iter()
            .filter_map(|row| match serde_json::from_str(&row.record) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        delivery_id = %row.id,
                        error = %e,
                        "Skipping undecodable delivery record"
                    );
                    None
                }
            })
            .collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM webhook_deliveries")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<DeliveryStats, StoreError> {
        let rows = sqlx::query_as::<_, StatusCountRow>(
            "SELECT status, COUNT(*) AS count FROM webhook_deliveries GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = DeliveryStats::default();
        for row in rows {
            match DeliveryState::from_str(&row.status) {
                Ok(state) => stats.count(state, row.count.max(0) as usize),
                Err(e) => warn!(error = %e, "Skipping unknown delivery status"),
            }
        }
        Ok(stats)
    }
}
