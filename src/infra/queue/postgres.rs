//! Postgres-backed message queue.
//!
//! Deliveries are claimed with `FOR UPDATE SKIP LOCKED` so several consumers
//! can share a queue. A delivery that is not acked within the visibility
//! timeout becomes available again and is redelivered.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{
    AppError, Delivery, ExecuteTransactionMessage, MessagePublisher, MessageSource, QueueError,
};

#[derive(Debug, Clone)]
pub struct PostgresQueueConfig {
    /// Queue this instance consumes from
    pub queue: String,
    pub visibility_timeout: Duration,
}

impl PostgresQueueConfig {
    #[must_use]
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            visibility_timeout: Duration::from_secs(900),
        }
    }

    /// Load the visibility timeout from `QUEUE_VISIBILITY_TIMEOUT_SECS`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = std::env::var("QUEUE_VISIBILITY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.visibility_timeout = Duration::from_secs(secs);
        }
        self
    }
}

pub struct PostgresQueue {
    pool: PgPool,
    config: PostgresQueueConfig,
}

impl PostgresQueue {
    #[must_use]
    pub fn new(pool: PgPool, config: PostgresQueueConfig) -> Self {
        Self { pool, config }
    }

    /// Unacked messages in the consumed queue
    pub async fn depth(&self) -> Result<i64, AppError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM queue_messages WHERE queue = $1 AND acked_at IS NULL",
        )
        .bind(&self.config.queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("depth")?)
    }
}

#[async_trait]
impl MessageSource for PostgresQueue {
    #[instrument(skip(self), fields(queue = %self.config.queue))]
    async fn next_delivery(&self) -> Result<Option<Delivery>, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET delivered_at = NOW(), delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = $1
                  AND acked_at IS NULL
                  AND (delivered_at IS NULL
                       OR delivered_at < NOW() - make_interval(secs => $2::DOUBLE PRECISION))
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, transaction_uuid, payload, delivery_count
            "#,
        )
        .bind(&self.config.queue)
        .bind(self.config.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Queue(QueueError::Unavailable(e.to_string())))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let delivery_count: i32 = row.try_get("delivery_count")?;
        let delivery = Delivery {
            tag: row.try_get("id")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            transaction_uuid: row.try_get("transaction_uuid")?,
            redelivered: delivery_count > 1,
        };
        debug!(tag = delivery.tag, redelivered = delivery.redelivered, "Delivery claimed");
        Ok(Some(delivery))
    }

    #[instrument(skip(self))]
    async fn ack(&self, tag: i64) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE queue_messages SET acked_at = NOW() WHERE id = $1 AND acked_at IS NULL",
        )
        .bind(tag)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Queue(QueueError::Unavailable(e.to_string())))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Queue(QueueError::AckFailed(tag)));
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for PostgresQueue {
    #[instrument(skip(self, message), fields(uuid = %message.transaction_uuid))]
    async fn publish(
        &self,
        queue: &str,
        message: &ExecuteTransactionMessage,
    ) -> Result<i64, AppError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| AppError::Serialization(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO queue_messages (queue, transaction_uuid, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(message.transaction_uuid)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    /// Copies the latest message for the transaction into a fresh delivery
    #[instrument(skip(self))]
    async fn requeue_transaction(&self, transaction_uuid: Uuid) -> Result<bool, AppError> {
        let row = sqlx::query(
            r#"
            INSERT INTO queue_messages (queue, transaction_uuid, payload)
            SELECT queue, transaction_uuid, payload
            FROM queue_messages
            WHERE transaction_uuid = $1
            ORDER BY id DESC
            LIMIT 1
            RETURNING id
            "#,
        )
        .bind(transaction_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
