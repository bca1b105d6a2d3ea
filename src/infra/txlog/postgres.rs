//! Transaction log records kept in `transaction_logs`, keyed by shard.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    AppError, DatabaseError, ShardKey, TransactionLogRecord, TransactionLogStore,
    TransactionLogUpdate,
};

pub struct PostgresTransactionLogStore {
    pool: PgPool,
}

impl PostgresTransactionLogStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TransactionLogRecord, AppError> {
        let status: String = row.try_get("status")?;
        Ok(TransactionLogRecord {
            transaction_uuid: row.try_get("transaction_uuid")?,
            shard: ShardKey::new(row.try_get("client_id")?, row.try_get("chain_id")?),
            status: status
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Decode(e)))?,
            transaction_hash: row.try_get("transaction_hash")?,
            from_address: row.try_get("from_address")?,
            to_address: row.try_get("to_address")?,
            amount: row.try_get("amount")?,
            error_code: row.try_get("error_code")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TransactionLogStore for PostgresTransactionLogStore {
    /// Creates the record when the shard has none yet
    #[instrument(skip(self, update), fields(shard = %shard, status = %update.status))]
    async fn update_item(
        &self,
        shard: ShardKey,
        transaction_uuid: Uuid,
        update: &TransactionLogUpdate,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO transaction_logs (client_id, chain_id, transaction_uuid, status, transaction_hash, error_code)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (client_id, chain_id, transaction_uuid) DO UPDATE
            SET status = EXCLUDED.status,
                transaction_hash = COALESCE(EXCLUDED.transaction_hash, transaction_logs.transaction_hash),
                error_code = COALESCE(EXCLUDED.error_code, transaction_logs.error_code),
                updated_at = NOW()
            "#,
        )
        .bind(shard.client_id)
        .bind(shard.chain_id)
        .bind(transaction_uuid)
        .bind(update.status.as_str())
        .bind(update.transaction_hash.as_deref())
        .bind(update.error_code.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(
        skip(self, record),
        fields(shard = %record.shard, uuid = %record.transaction_uuid)
    )]
    async fn upsert_record(&self, record: &TransactionLogRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO transaction_logs (
                client_id, chain_id, transaction_uuid, status, transaction_hash,
                from_address, to_address, amount, error_code, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (client_id, chain_id, transaction_uuid) DO UPDATE
            SET status = EXCLUDED.status,
                transaction_hash = EXCLUDED.transaction_hash,
                from_address = EXCLUDED.from_address,
                to_address = EXCLUDED.to_address,
                amount = EXCLUDED.amount,
                error_code = EXCLUDED.error_code,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.shard.client_id)
        .bind(record.shard.chain_id)
        .bind(record.transaction_uuid)
        .bind(record.status.as_str())
        .bind(record.transaction_hash.as_deref())
        .bind(record.from_address.as_deref())
        .bind(record.to_address.as_deref())
        .bind(record.amount.as_deref())
        .bind(record.error_code.as_deref())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(shard = %shard))]
    async fn get_record(
        &self,
        shard: ShardKey,
        transaction_uuid: Uuid,
    ) -> Result<Option<TransactionLogRecord>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT client_id, chain_id, transaction_uuid, status, transaction_hash,
                   from_address, to_address, amount, error_code, updated_at
            FROM transaction_logs
            WHERE client_id = $1 AND chain_id = $2 AND transaction_uuid = $3
            "#,
        )
        .bind(shard.client_id)
        .bind(shard.chain_id)
        .bind(transaction_uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }
}
