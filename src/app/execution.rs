//! Execute-transaction message handler driven by the queue consumer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::domain::{
    AppError, ChainClient, Delivery, ExecuteTransactionMessage, ExecutionRecord, LockLeaseStore,
    MessageHandler, QueueError, ShardKey, TransactionLogRecord, TransactionLogStore,
    TransactionStatus,
};

/// Submits a transaction and records where it ended up.
///
/// The `transaction_meta` write is skipped for rows a scheduler currently
/// leases; the lease holder owns their status until it releases.
pub struct ExecuteTransactionHandler {
    store: Arc<dyn LockLeaseStore>,
    tx_log: Arc<dyn TransactionLogStore>,
    chain: Arc<dyn ChainClient>,
    /// Seconds before the observer checks a submitted transaction
    submitted_grace_secs: i64,
    /// Seconds before the observer reconsiders a parked transaction
    parked_grace_secs: i64,
}

impl ExecuteTransactionHandler {
    #[must_use]
    pub fn new(
        store: Arc<dyn LockLeaseStore>,
        tx_log: Arc<dyn TransactionLogStore>,
        chain: Arc<dyn ChainClient>,
        submitted_grace_secs: i64,
    ) -> Self {
        Self {
            store,
            tx_log,
            chain,
            submitted_grace_secs,
            parked_grace_secs: submitted_grace_secs,
        }
    }

    #[must_use]
    pub fn with_parked_grace(mut self, secs: i64) -> Self {
        self.parked_grace_secs = secs;
        self
    }

    fn parse(delivery: &Delivery) -> Result<ExecuteTransactionMessage, AppError> {
        serde_json::from_value(delivery.payload.clone()).map_err(|e| {
            AppError::Queue(QueueError::Malformed {
                tag: delivery.tag,
                reason: e.to_string(),
            })
        })
    }

    async fn write_log(&self, message: &ExecuteTransactionMessage, record: &ExecutionRecord) {
        let log = TransactionLogRecord {
            transaction_uuid: message.transaction_uuid,
            shard: ShardKey::new(message.client_id, message.chain_id),
            status: record.status,
            transaction_hash: record.transaction_hash.clone(),
            from_address: Some(message.from_address.clone()),
            to_address: Some(message.to_address.clone()),
            amount: Some(message.amount.clone()),
            error_code: record.error_code.clone(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.tx_log.upsert_record(&log).await {
            warn!(uuid = %message.transaction_uuid, error = %e, "Transaction log upsert failed");
        }
    }
}

#[async_trait]
impl MessageHandler for ExecuteTransactionHandler {
    #[instrument(skip(self, delivery), fields(tag = delivery.tag))]
    async fn handle(&self, delivery: &Delivery) -> Result<(), AppError> {
        let message = Self::parse(delivery)?;
        let now = Utc::now().timestamp();

        if let Some(existing) = self.store.get_by_uuid(message.transaction_uuid).await? {
            if existing.status.is_terminal() {
                info!(
                    uuid = %message.transaction_uuid,
                    status = %existing.status,
                    "Transaction already final, skipping execution"
                );
                return Ok(());
            }
        }

        let record = match self.chain.submit(&message).await {
            Ok(hash) => ExecutionRecord {
                transaction_uuid: message.transaction_uuid,
                transaction_hash: Some(hash),
                client_id: message.client_id,
                chain_id: message.chain_id,
                kind: message.kind,
                status: TransactionStatus::Submitted,
                next_action_at: Some(now + self.submitted_grace_secs),
                error_code: None,
            },
            Err(AppError::Chain(e)) => {
                let status = e.parked_status();
                warn!(
                    uuid = %message.transaction_uuid,
                    error = %e,
                    status = %status,
                    "Submission failed"
                );
                ExecutionRecord {
                    transaction_uuid: message.transaction_uuid,
                    transaction_hash: None,
                    client_id: message.client_id,
                    chain_id: message.chain_id,
                    kind: message.kind,
                    status,
                    next_action_at: (!status.is_terminal()).then_some(now + self.parked_grace_secs),
                    error_code: Some(e.code().to_string()),
                }
            }
            Err(e) => return Err(e),
        };

        let written = self.store.record_execution(&record).await?;
        if !written {
            warn!(
                uuid = %message.transaction_uuid,
                "Transaction is leased by the observer, execution result not recorded"
            );
        }
        self.write_log(&message, &record).await;

        info!(
            uuid = %message.transaction_uuid,
            status = %record.status,
            hash = ?record.transaction_hash,
            "Execution recorded"
        );
        Ok(())
    }
}
