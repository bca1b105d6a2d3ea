//! Recovery for transactions parked by a failed submission.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{info, instrument, warn};

use super::chain_state::resolve_chain_state;
use super::{
    BatchOutcome, HandlerContext, StatusHandler, Transition, abort_if_inconsistent, apply_plan,
};
use crate::domain::{AppError, LeaseId, TransactionMeta, TransactionStatus};

/// Handles `geth_down`, `insufficient_gas`, `nonce_too_low` and
/// `replacement_tx_under_priced` rows.
///
/// A row that already has a hash is resolved against the chain; one without
/// is handed back to the execution workflow. With the health gate on, rows
/// whose chain node is still down only get their backoff extended.
pub struct ResubmitHandler {
    ctx: HandlerContext,
    status: TransactionStatus,
    health_gate: bool,
}

impl ResubmitHandler {
    #[must_use]
    pub fn new(ctx: HandlerContext, status: TransactionStatus, health_gate: bool) -> Self {
        Self {
            ctx,
            status,
            health_gate,
        }
    }

    /// Rows parked because the node was unreachable
    #[must_use]
    pub fn geth_down(ctx: HandlerContext) -> Self {
        Self::new(ctx, TransactionStatus::GethDown, true)
    }

    /// Rows parked by a submission the node rejected
    #[must_use]
    pub fn rejected(ctx: HandlerContext, status: TransactionStatus) -> Self {
        Self::new(ctx, status, false)
    }

    /// One health probe per distinct chain in the batch
    async fn node_health(&self, rows: &[TransactionMeta]) -> BTreeMap<i64, bool> {
        let mut chains: Vec<i64> = rows.iter().map(|row| row.chain_id).collect();
        chains.sort_unstable();
        chains.dedup();

        let probes = join_all(chains.iter().map(|&chain_id| async move {
            match self.ctx.chain.is_node_healthy(chain_id).await {
                Ok(healthy) => (chain_id, healthy),
                Err(e) => {
                    warn!(chain_id, error = %e, "Node health probe failed");
                    (chain_id, false)
                }
            }
        }))
        .await;

        probes.into_iter().collect()
    }

    async fn plan(
        &self,
        row: &TransactionMeta,
        healthy: Option<bool>,
        now_secs: i64,
    ) -> Transition {
        if healthy == Some(false) {
            return Transition::retry(&self.ctx, row, now_secs);
        }
        match row.transaction_hash.as_deref() {
            Some(hash) => resolve_chain_state(&self.ctx, row, hash, now_secs).await,
            None => Transition::requeue(&self.ctx, row, now_secs),
        }
    }
}

#[async_trait]
impl StatusHandler for ResubmitHandler {
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

        let health = if self.health_gate {
            self.node_health(&rows).await
        } else {
            BTreeMap::new()
        };

        let now_secs = Utc::now().timestamp();
        let mut planned = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(self.ctx.settings.log_batch_size.max(1)) {
            let transitions = join_all(
                chunk
                    .iter()
                    .map(|row| self.plan(row, health.get(&row.chain_id).copied(), now_secs)),
            )
            .await;
            planned.extend(chunk.iter().cloned().zip(transitions));
        }

        let outcome = apply_plan(&self.ctx, lease, self.status, planned).await?;
        info!(
            released = outcome.released,
            requeued = outcome.requeued,
            lost = outcome.lost,
            "Parked transactions processed"
        );
        Ok(outcome)
    }
}
