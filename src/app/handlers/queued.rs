//! Transactions stuck in `queued` past their deadline are abandoned.

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{
    BatchOutcome, HandlerContext, StatusHandler, Transition, abort_if_inconsistent, apply_plan,
};
use crate::domain::{AppError, LeaseId, TransactionMeta, TransactionStatus};

/// Error code stored on transactions failed by this handler
pub const QUEUED_TIMEOUT: &str = "queued_timeout";

/// Fails every claimed `queued` row. The shard log is updated before the
/// relational release so readers of either store converge on `failed`.
pub struct QueuedHandler {
    ctx: HandlerContext,
}

impl QueuedHandler {
    #[must_use]
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StatusHandler for QueuedHandler {
    fn status(&self) -> TransactionStatus {
        TransactionStatus::Queued
    }

    #[instrument(skip(self, rows), fields(lease = %lease, rows = rows.len()))]
    async fn handle_batch(
        &self,
        lease: LeaseId,
        rows: Vec<TransactionMeta>,
    ) -> Result<BatchOutcome, AppError> {
        abort_if_inconsistent(&self.ctx, lease, self.status(), &rows).await?;

        let planned = rows
            .into_iter()
            .map(|row| (row, Transition::failed(QUEUED_TIMEOUT)))
            .collect();

        let outcome = apply_plan(&self.ctx, lease, self.status(), planned).await?;
        info!(
            failed = outcome.released,
            lost = outcome.lost,
            "Abandoned queued transactions marked failed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ShardKey, TransactionLogStore};
    use crate::test_utils::{Harness, queued_row};

    #[tokio::test]
    async fn test_queued_rows_fail_in_both_stores() {
        let harness = Harness::new();
        let row = harness.insert(queued_row(1, -60));
        let lease = harness.claim_all(TransactionStatus::Queued).await;

        let handler = QueuedHandler::new(harness.context());
        let rows = harness.store.fetch_now(lease);
        let outcome = handler.handle_batch(lease, rows).await.unwrap();

        assert_eq!(outcome.claimed, 1);
        assert_eq!(outcome.released, 1);
        assert_eq!(outcome.lost, 0);

        let stored = harness.store.get(row.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.next_action_at, None);
        assert_eq!(stored.lock, None);
        assert_eq!(stored.error_code.as_deref(), Some(QUEUED_TIMEOUT));

        let record = harness
            .tx_log
            .get_record(ShardKey::new(row.client_id, row.chain_id), row.transaction_uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Failed);
        assert_eq!(harness.digest.total(), 1);
    }

    #[tokio::test]
    async fn test_drifted_row_aborts_whole_batch() {
        let harness = Harness::new();
        let first = harness.insert(queued_row(1, -60));
        let second = harness.insert(queued_row(2, -60));
        let lease = harness.claim_all(TransactionStatus::Queued).await;

        let mut rows = harness.store.fetch_now(lease);
        rows.iter_mut()
            .find(|r| r.id == second.id)
            .unwrap()
            .status = TransactionStatus::Submitted;

        let handler = QueuedHandler::new(harness.context());
        let result = handler.handle_batch(lease, rows).await;
        assert!(matches!(result, Err(AppError::Consistency(_))));

        for id in [first.id, second.id] {
            let stored = harness.store.get(id).unwrap();
            assert_eq!(stored.status, TransactionStatus::Queued);
            assert_eq!(stored.lock, None);
            assert_eq!(stored.retry_count, 0);
        }
        assert_eq!(harness.tx_log.write_count(), 0);
    }

    #[tokio::test]
    async fn test_log_store_failure_does_not_block_release() {
        let harness = Harness::new();
        harness.tx_log.set_failing(true);
        let row = harness.insert(queued_row(1, -60));
        let lease = harness.claim_all(TransactionStatus::Queued).await;

        let handler = QueuedHandler::new(harness.context());
        let rows = harness.store.fetch_now(lease);
        handler.handle_batch(lease, rows).await.unwrap();

        let stored = harness.store.get(row.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.lock, None);
    }

    #[tokio::test]
    async fn test_row_taken_over_before_handling_gets_no_side_effects() {
        let harness = Harness::new();
        let row = harness.insert(queued_row(1, -60));
        let lease = harness.claim_all(TransactionStatus::Queued).await;
        let rows = harness.store.fetch_now(lease);

        // Another observer reclaims the row after the fetch
        let rival = LeaseId::new(lease.epoch_millis + 1, lease.process_id + 1);
        let mut taken = harness.store.get(row.id).unwrap();
        taken.lock = Some(rival);
        harness.store.insert(taken);

        let handler = QueuedHandler::new(harness.context());
        let outcome = handler.handle_batch(lease, rows).await.unwrap();

        assert_eq!(outcome.released, 0);
        assert_eq!(outcome.lost, 1);

        let stored = harness.store.get(row.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Queued);
        assert_eq!(stored.lock, Some(rival));

        let record = harness
            .tx_log
            .get_record(ShardKey::new(row.client_id, row.chain_id), row.transaction_uuid)
            .await
            .unwrap();
        assert!(record.is_none());
        assert_eq!(harness.tx_log.write_count(), 0);
        assert_eq!(harness.digest.total(), 0);
    }
}
