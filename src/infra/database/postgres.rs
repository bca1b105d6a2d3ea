//! PostgreSQL lease store and process registry.

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    AppError, ClaimCriteria, DatabaseError, ExecutionRecord, LeaseId, LockLeaseStore, NextAction,
    ProcessRegistry, Release, TransactionMeta,
};

/// Columns selected for every `transaction_meta` read
const META_COLUMNS: &str = "id, transaction_uuid, transaction_hash, client_id, chain_id, kind, \
     status, lock_millis, lock_process_id, next_action_at, retry_count, error_code, \
     created_at, updated_at";

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL database client with connection pooling
#[derive(Clone)]
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL client with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Wrap an existing pool
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Parse a database row into a TransactionMeta
    fn row_to_transaction_meta(row: &sqlx::postgres::PgRow) -> Result<TransactionMeta, AppError> {
        let status: String = row.try_get("status")?;
        let kind: String = row.try_get("kind")?;

        Ok(TransactionMeta {
            id: row.try_get("id")?,
            transaction_uuid: row.try_get("transaction_uuid")?,
            transaction_hash: row.try_get("transaction_hash")?,
            client_id: row.try_get("client_id")?,
            chain_id: row.try_get("chain_id")?,
            kind: kind
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Decode(e)))?,
            status: status
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Decode(e)))?,
            lock: LeaseId::from_columns(
                row.try_get("lock_millis")?,
                row.try_get("lock_process_id")?,
            ),
            next_action_at: row.try_get("next_action_at")?,
            retry_count: row.try_get("retry_count")?,
            error_code: row.try_get("error_code")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn status_names(criteria: &ClaimCriteria) -> Vec<String> {
        criteria
            .statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect()
    }
}

#[async_trait]
impl LockLeaseStore for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, criteria), fields(lease = %lease, limit = criteria.limit))]
    async fn claim(&self, lease: LeaseId, criteria: &ClaimCriteria) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_meta
            SET lock_millis = $1, lock_process_id = $2, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM transaction_meta
                WHERE lock_millis IS NULL
                  AND status = ANY($3)
                  AND next_action_at < $4
                  AND retry_count < $5
                ORDER BY next_action_at
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            AND lock_millis IS NULL
            "#,
        )
        .bind(lease.epoch_millis)
        .bind(lease.process_id)
        .bind(Self::status_names(criteria))
        .bind(criteria.now_secs)
        .bind(criteria.max_retries)
        .bind(criteria.limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(lease = %lease))]
    async fn fetch(&self, lease: LeaseId) -> Result<Vec<TransactionMeta>, AppError> {
        let sql = format!(
            "SELECT {META_COLUMNS} FROM transaction_meta \
             WHERE lock_millis = $1 AND lock_process_id = $2 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(lease.epoch_millis)
            .bind(lease.process_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_transaction_meta).collect()
    }

    #[instrument(skip(self, criteria), fields(lease = %lease, limit = criteria.limit))]
    async fn claim_and_fetch(
        &self,
        lease: LeaseId,
        criteria: &ClaimCriteria,
    ) -> Result<Vec<TransactionMeta>, AppError> {
        let sql = format!(
            r#"
            UPDATE transaction_meta
            SET lock_millis = $1, lock_process_id = $2, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM transaction_meta
                WHERE lock_millis IS NULL
                  AND status = ANY($3)
                  AND next_action_at < $4
                  AND retry_count < $5
                ORDER BY next_action_at
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            AND lock_millis IS NULL
            RETURNING {META_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(lease.epoch_millis)
            .bind(lease.process_id)
            .bind(Self::status_names(criteria))
            .bind(criteria.now_secs)
            .bind(criteria.max_retries)
            .bind(criteria.limit)
            .fetch_all(&self.pool)
            .await?;

        debug!(claimed = rows.len(), "Claimed rows");
        rows.iter().map(Self::row_to_transaction_meta).collect()
    }

    #[instrument(skip(self, release), fields(lease = %lease, rows = release.ids.len()))]
    async fn release(&self, lease: LeaseId, release: &Release) -> Result<u64, AppError> {
        if release.ids.is_empty() {
            return Ok(0);
        }
        let update = &release.update;
        let (next_action_mode, next_action_at) = match update.next_action {
            NextAction::Keep => ("keep", None),
            NextAction::Clear => ("clear", None),
            NextAction::At(at) => ("set", Some(at)),
        };

        let result = sqlx::query(
            r#"
            UPDATE transaction_meta
            SET lock_millis = NULL,
                lock_process_id = NULL,
                status = COALESCE($4::TEXT, status),
                next_action_at = CASE $5::TEXT
                    WHEN 'keep' THEN next_action_at
                    WHEN 'clear' THEN NULL
                    ELSE $6::BIGINT
                END,
                retry_count = retry_count + $7,
                transaction_hash = COALESCE($8::TEXT, transaction_hash),
                error_code = COALESCE($9::TEXT, error_code),
                updated_at = NOW()
            WHERE id = ANY($1)
              AND lock_millis = $2
              AND lock_process_id = $3
              AND ($10::TEXT IS NULL OR status = $10::TEXT)
            "#,
        )
        .bind(release.ids.as_slice())
        .bind(lease.epoch_millis)
        .bind(lease.process_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(next_action_mode)
        .bind(next_action_at)
        .bind(i32::from(update.increment_retry))
        .bind(update.transaction_hash.as_deref())
        .bind(update.error_code.as_deref())
        .bind(release.expected_status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(lease = %lease))]
    async fn release_all(&self, lease: LeaseId) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_meta
            SET lock_millis = NULL, lock_process_id = NULL, updated_at = NOW()
            WHERE lock_millis = $1 AND lock_process_id = $2
            "#,
        )
        .bind(lease.epoch_millis)
        .bind(lease.process_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn reclaim_expired_leases(&self, older_than_millis: i64) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_meta
            SET lock_millis = NULL, lock_process_id = NULL, updated_at = NOW()
            WHERE lock_millis IS NOT NULL AND lock_millis < $1
            "#,
        )
        .bind(older_than_millis)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(
        skip(self, record),
        fields(uuid = %record.transaction_uuid, status = %record.status)
    )]
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<bool, AppError> {
        // Leased or terminal rows are left alone
        let row = sqlx::query(
            r#"
            INSERT INTO transaction_meta (
                transaction_uuid, transaction_hash, client_id, chain_id, kind,
                status, next_action_at, retry_count, error_code
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8)
            ON CONFLICT (transaction_uuid) DO UPDATE
            SET transaction_hash = COALESCE(EXCLUDED.transaction_hash, transaction_meta.transaction_hash),
                status = EXCLUDED.status,
                next_action_at = EXCLUDED.next_action_at,
                error_code = EXCLUDED.error_code,
                updated_at = NOW()
            WHERE transaction_meta.lock_millis IS NULL
              AND transaction_meta.status NOT IN ('mined', 'failed')
            RETURNING id
            "#,
        )
        .bind(record.transaction_uuid)
        .bind(record.transaction_hash.as_deref())
        .bind(record.client_id)
        .bind(record.chain_id)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(record.next_action_at)
        .bind(record.error_code.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn get_by_uuid(
        &self,
        transaction_uuid: Uuid,
    ) -> Result<Option<TransactionMeta>, AppError> {
        let sql =
            format!("SELECT {META_COLUMNS} FROM transaction_meta WHERE transaction_uuid = $1");
        let row = sqlx::query(&sql)
            .bind(transaction_uuid)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction_meta(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProcessRegistry for PostgresClient {
    #[instrument(skip(self))]
    async fn register_process(
        &self,
        role: &str,
        process_id: i32,
        stale_after_secs: i64,
    ) -> Result<bool, AppError> {
        let row = sqlx::query(
            r#"
            INSERT INTO process_registry (role, process_id)
            VALUES ($1, $2)
            ON CONFLICT (role, process_id) DO UPDATE
            SET started_at = NOW(), heartbeat_at = NOW(), stopped_at = NULL
            WHERE process_registry.stopped_at IS NOT NULL
               OR process_registry.heartbeat_at < NOW() - make_interval(secs => $3::DOUBLE PRECISION)
            RETURNING role
            "#,
        )
        .bind(role)
        .bind(process_id)
        .bind(stale_after_secs as f64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn heartbeat(&self, role: &str, process_id: i32) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE process_registry SET heartbeat_at = NOW() WHERE role = $1 AND process_id = $2",
        )
        .bind(role)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_stopped(&self, role: &str, process_id: i32) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE process_registry SET stopped_at = NOW() WHERE role = $1 AND process_id = $2",
        )
        .bind(role)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
