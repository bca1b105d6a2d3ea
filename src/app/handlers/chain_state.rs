//! Re-examines chain state for transactions whose outcome is not yet known.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::{
    BatchOutcome, HandlerContext, StatusHandler, Transition, abort_if_inconsistent, apply_plan,
};
use crate::domain::{
    AppError, ChainError, ChainTxState, LeaseId, NextAction, ReleaseUpdate, TransactionLogUpdate,
    TransactionMeta, TransactionStatus,
};

/// Handles `submitted` and `unknown` rows by looking the hash up on chain.
///
/// Mined rows become `mined`, reverted ones `failed`; rows still pending are
/// re-armed with backoff so a later tick checks again. A node that cannot be
/// reached parks the row in `geth_down`.
pub struct ChainStateHandler {
    ctx: HandlerContext,
    status: TransactionStatus,
}

impl ChainStateHandler {
    #[must_use]
    pub fn submitted(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            status: TransactionStatus::Submitted,
        }
    }

    #[must_use]
    pub fn unknown(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            status: TransactionStatus::Unknown,
        }
    }

    async fn plan(&self, row: &TransactionMeta, now_secs: i64) -> Transition {
        match row.transaction_hash.as_deref() {
            Some(hash) => resolve_chain_state(&self.ctx, row, hash, now_secs).await,
            // An unknown submission without a hash may never have reached the chain
            None if self.status == TransactionStatus::Unknown => {
                Transition::requeue(&self.ctx, row, now_secs)
            }
            None => {
                warn!(id = row.id, "Submitted transaction has no hash");
                Transition::failed("missing_transaction_hash")
            }
        }
    }
}

/// Transition for a row with a known hash, based on what the chain reports
pub(crate) async fn resolve_chain_state(
    ctx: &HandlerContext,
    row: &TransactionMeta,
    hash: &str,
    now_secs: i64,
) -> Transition {
    match ctx.chain.transaction_state(row.chain_id, hash).await {
        Ok(ChainTxState::Mined {
            block_number,
            success: true,
        }) => {
            debug!(id = row.id, hash, block_number, "Transaction mined");
            Transition::new(ReleaseUpdate {
                status: Some(TransactionStatus::Mined),
                next_action: NextAction::Clear,
                ..ReleaseUpdate::default()
            })
            .with_log(
                TransactionLogUpdate::status(TransactionStatus::Mined)
                    .with_hash(Some(hash.to_string())),
            )
        }
        Ok(ChainTxState::Mined {
            block_number,
            success: false,
        }) => {
            info!(id = row.id, hash, block_number, "Transaction reverted on chain");
            let mut transition = Transition::failed("reverted");
            if let Some(log) = transition.log.as_mut() {
                log.transaction_hash = Some(hash.to_string());
            }
            transition
        }
        Ok(state @ (ChainTxState::Pending | ChainTxState::NotFound)) => {
            debug!(id = row.id, hash, state = ?state, "Transaction not mined yet");
            Transition::retry(ctx, row, now_secs)
        }
        Err(AppError::Chain(
            e @ (ChainError::NodeUnavailable(_) | ChainError::Timeout(_)),
        )) => {
            warn!(id = row.id, chain_id = row.chain_id, error = %e, "Chain node unreachable");
            let mut transition = Transition::retry(ctx, row, now_secs);
            if transition.update.status.is_none() {
                transition.update.status = Some(TransactionStatus::GethDown);
                transition.update.error_code = Some(e.code().to_string());
                transition.log = Some(
                    TransactionLogUpdate::status(TransactionStatus::GethDown)
                        .with_error_code(Some(e.code().to_string())),
                );
            }
            transition
        }
        Err(e) => {
            warn!(id = row.id, hash, error = %e, "Chain state lookup failed");
            Transition::retry(ctx, row, now_secs)
        }
    }
}

#[async_trait]
impl StatusHandler for ChainStateHandler {
    fn status(&self) -> TransactionStatus {
        self.status
    }

    #[instrument(
        skip(self, rows),
        fields(status = %self.status, lease = %lease, rows = rows.len())
    )]
    async fn handle_batch(
        &self,
        lease: LeaseId,
        rows: Vec<TransactionMeta>,
    ) -> Result<BatchOutcome, AppError> {
        abort_if_inconsistent(&self.ctx, lease, self.status, &rows).await?;

        let now_secs = Utc::now().timestamp();
        let mut planned = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(self.ctx.settings.log_batch_size.max(1)) {
            let transitions = join_all(chunk.iter().map(|row| self.plan(row, now_secs))).await;
            planned.extend(chunk.iter().cloned().zip(transitions));
        }

        let outcome = apply_plan(&self.ctx, lease, self.status, planned).await?;
        info!(
            released = outcome.released,
            requeued = outcome.requeued,
            lost = outcome.lost,
            "Chain state batch processed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Harness, row_with_hash};

    #[tokio::test]
    async fn test_mined_and_reverted_transactions_finalize() {
        let harness = Harness::new();
        let mined = harness.insert(row_with_hash(1, TransactionStatus::Submitted, "0xaa", -30));
        let reverted = harness.insert(row_with_hash(2, TransactionStatus::Submitted, "0xbb", -30));
        harness.chain.set_state("0xaa", ChainTxState::Mined { block_number: 10, success: true });
        harness.chain.set_state("0xbb", ChainTxState::Mined { block_number: 11, success: false });

        let lease = harness.claim_all(TransactionStatus::Submitted).await;
        let handler = ChainStateHandler::submitted(harness.context());
        let outcome = handler
            .handle_batch(lease, harness.store.fetch_now(lease))
            .await
            .unwrap();
        assert_eq!(outcome.released, 2);

        let mined = harness.store.get(mined.id).unwrap();
        assert_eq!(mined.status, TransactionStatus::Mined);
        assert_eq!(mined.next_action_at, None);
        assert_eq!(mined.lock, None);

        let reverted = harness.store.get(reverted.id).unwrap();
        assert_eq!(reverted.status, TransactionStatus::Failed);
        assert_eq!(reverted.error_code.as_deref(), Some("reverted"));
    }

    #[tokio::test]
    async fn test_pending_transaction_is_rearmed() {
        let harness = Harness::new();
        let row = harness.insert(row_with_hash(1, TransactionStatus::Submitted, "0xaa", -30));
        harness.chain.set_state("0xaa", ChainTxState::Pending);

        let before = Utc::now().timestamp();
        let lease = harness.claim_all(TransactionStatus::Submitted).await;
        ChainStateHandler::submitted(harness.context())
            .handle_batch(lease, harness.store.fetch_now(lease))
            .await
            .unwrap();

        let stored = harness.store.get(row.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Submitted);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.next_action_at.unwrap() >= before + harness.retry.backoff_secs(0));
        assert_eq!(stored.lock, None);
    }

    #[tokio::test]
    async fn test_ninth_retry_exhausts_budget() {
        let harness = Harness::new();
        let mut row = row_with_hash(1, TransactionStatus::Submitted, "0xaa", -30);
        row.retry_count = 9;
        let row = harness.insert(row);
        harness.chain.set_state("0xaa", ChainTxState::NotFound);

        let lease = harness.claim_all(TransactionStatus::Submitted).await;
        ChainStateHandler::submitted(harness.context())
            .handle_batch(lease, harness.store.fetch_now(lease))
            .await
            .unwrap();

        let stored = harness.store.get(row.id).unwrap();
        assert_eq!(stored.retry_count, 10);
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some("retries_exhausted"));
        assert_eq!(stored.lock, None);
    }

    #[tokio::test]
    async fn test_unreachable_node_parks_in_geth_down() {
        let harness = Harness::new();
        let row = harness.insert(row_with_hash(1, TransactionStatus::Submitted, "0xaa", -30));
        harness
            .chain
            .fail_lookups(ChainError::NodeUnavailable("connection refused".to_string()));

        let lease = harness.claim_all(TransactionStatus::Submitted).await;
        ChainStateHandler::submitted(harness.context())
            .handle_batch(lease, harness.store.fetch_now(lease))
            .await
            .unwrap();

        let stored = harness.store.get(row.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::GethDown);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error_code.as_deref(), Some("node_unavailable"));
    }

    #[tokio::test]
    async fn test_unknown_without_hash_is_requeued() {
        let harness = Harness::new();
        let mut row = row_with_hash(1, TransactionStatus::Unknown, "", -30);
        row.transaction_hash = None;
        let row = harness.insert(row);
        harness.publisher.remember(row.transaction_uuid);

        let lease = harness.claim_all(TransactionStatus::Unknown).await;
        let outcome = ChainStateHandler::unknown(harness.context())
            .handle_batch(lease, harness.store.fetch_now(lease))
            .await
            .unwrap();
        assert_eq!(outcome.requeued, 1);

        let stored = harness.store.get(row.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(harness.publisher.requeued(), vec![row.transaction_uuid]);
    }

    #[tokio::test]
    async fn test_submitted_without_hash_fails() {
        let harness = Harness::new();
        let mut row = row_with_hash(1, TransactionStatus::Submitted, "", -30);
        row.transaction_hash = None;
        let row = harness.insert(row);

        let lease = harness.claim_all(TransactionStatus::Submitted).await;
        ChainStateHandler::submitted(harness.context())
            .handle_batch(lease, harness.store.fetch_now(lease))
            .await
            .unwrap();

        let stored = harness.store.get(row.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some("missing_transaction_hash"));
    }
}
