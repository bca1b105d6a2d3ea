//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use uuid::Uuid;

use super::error::AppError;
use super::lease::LeaseId;
use super::types::{
    ChainTxState, ClaimCriteria, Delivery, ExecuteTransactionMessage, ExecutionRecord, Release,
    ShardKey, TransactionLogRecord, TransactionLogUpdate, TransactionMeta,
};

/// Relational store of `transaction_meta` rows with atomic claim semantics.
///
/// Correctness across scheduler processes rests entirely on `claim` and
/// `claim_and_fetch` being single conditional statements: a row is only
/// leased if it had no lease when the statement ran.
#[async_trait]
pub trait LockLeaseStore: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Write `lease` into up to `criteria.limit` unleased matching rows; returns the count
    async fn claim(&self, lease: LeaseId, criteria: &ClaimCriteria) -> Result<u64, AppError>;

    /// Rows currently held by `lease`
    async fn fetch(&self, lease: LeaseId) -> Result<Vec<TransactionMeta>, AppError>;

    /// Claim and return the claimed rows in one round trip
    async fn claim_and_fetch(
        &self,
        lease: LeaseId,
        criteria: &ClaimCriteria,
    ) -> Result<Vec<TransactionMeta>, AppError>;

    /// Drop `lease` from the given rows and apply the update in the same statement.
    /// Returns the number of rows that were still held and matched; fewer than
    /// `release.ids.len()` means some rows were lost.
    async fn release(&self, lease: LeaseId, release: &Release) -> Result<u64, AppError>;

    /// Drop `lease` from every row still holding it, changing nothing else
    async fn release_all(&self, lease: LeaseId) -> Result<u64, AppError>;

    /// Clear leases taken before `older_than_millis`, left behind by crashed processes
    async fn reclaim_expired_leases(&self, older_than_millis: i64) -> Result<u64, AppError>;

    /// Insert or update the row for an executed transaction.
    /// Leaves leased rows untouched and returns `false` for them.
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<bool, AppError>;

    /// Look up a row by its transaction uuid
    async fn get_by_uuid(&self, transaction_uuid: Uuid)
    -> Result<Option<TransactionMeta>, AppError>;
}

/// Bookkeeping of running observer and consumer processes
#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    /// Register `process_id` for `role`. Returns `false` when another live
    /// process already holds the id (heartbeat newer than `stale_after_secs`).
    async fn register_process(
        &self,
        role: &str,
        process_id: i32,
        stale_after_secs: i64,
    ) -> Result<bool, AppError>;

    async fn heartbeat(&self, role: &str, process_id: i32) -> Result<(), AppError>;

    async fn mark_stopped(&self, role: &str, process_id: i32) -> Result<(), AppError>;
}

/// Denormalized, sharded transaction log. Best-effort and eventually consistent.
#[async_trait]
pub trait TransactionLogStore: Send + Sync {
    /// Apply a partial update to one record
    async fn update_item(
        &self,
        shard: ShardKey,
        transaction_uuid: Uuid,
        update: &TransactionLogUpdate,
    ) -> Result<(), AppError>;

    /// Create or replace a full record
    async fn upsert_record(&self, record: &TransactionLogRecord) -> Result<(), AppError>;

    async fn get_record(
        &self,
        shard: ShardKey,
        transaction_uuid: Uuid,
    ) -> Result<Option<TransactionLogRecord>, AppError>;
}

/// Chain node access used by recovery handlers and the execution workflow
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current state of a transaction by hash
    async fn transaction_state(
        &self,
        chain_id: i64,
        transaction_hash: &str,
    ) -> Result<ChainTxState, AppError>;

    /// Whether the chain's node answers at all
    async fn is_node_healthy(&self, chain_id: i64) -> Result<bool, AppError>;

    /// Broadcast the transaction; returns its hash
    async fn submit(&self, message: &ExecuteTransactionMessage) -> Result<String, AppError> {
        let _ = message;
        Err(AppError::NotSupported(
            "submit not implemented".to_string(),
        ))
    }
}

/// Pull side of a message broker subscription
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Next available delivery, or `None` when the queue is currently empty
    async fn next_delivery(&self) -> Result<Option<Delivery>, AppError>;

    /// Acknowledge a delivery so it is never redelivered
    async fn ack(&self, tag: i64) -> Result<(), AppError>;
}

/// Push side of a message broker
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, queue: &str, message: &ExecuteTransactionMessage)
    -> Result<i64, AppError>;

    /// Publish the most recent execute message for `transaction_uuid` again.
    /// Returns `false` if no such message was ever published.
    async fn requeue_transaction(&self, transaction_uuid: Uuid) -> Result<bool, AppError>;
}

/// Work driven by one broker delivery
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnlyChainClient;

    #[async_trait]
    impl ChainClient for ReadOnlyChainClient {
        async fn transaction_state(
            &self,
            _chain_id: i64,
            _transaction_hash: &str,
        ) -> Result<ChainTxState, AppError> {
            Ok(ChainTxState::Pending)
        }

        async fn is_node_healthy(&self, _chain_id: i64) -> Result<bool, AppError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_chain_client_submit_not_supported_by_default() {
        let client = ReadOnlyChainClient;
        let message = ExecuteTransactionMessage {
            transaction_uuid: Uuid::new_v4(),
            client_id: 1,
            chain_id: 1,
            kind: Default::default(),
            from_address: "0xa".to_string(),
            to_address: "0xb".to_string(),
            amount: "1".to_string(),
            raw_transaction: None,
        };
        let result = client.submit(&message).await;
        assert!(matches!(result, Err(AppError::NotSupported(_))));
    }
}
