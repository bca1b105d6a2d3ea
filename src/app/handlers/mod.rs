//! Status handlers: recovery and finalization strategies, one per transaction status.
//!
//! A handler receives the whole status partition of a claimed batch. It plans
//! a transition for every row, confirms the rows are still held, writes the
//! sharded log best-effort, then releases the rows with the planned mutation
//! in the same statement that drops the lease. Requeue publishes and digest
//! entries follow only releases that actually landed.

pub mod chain_state;
pub mod queued;
pub mod resubmit;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, error, warn};

use crate::app::digest::FailureDigest;
use crate::app::retry::RetryPolicy;
use crate::domain::{
    AppError, ChainClient, LeaseId, LockLeaseStore, MessagePublisher, NextAction, Release,
    ReleaseUpdate, TransactionLogStore, TransactionLogUpdate, TransactionMeta, TransactionStatus,
};

pub use chain_state::ChainStateHandler;
pub use queued::QueuedHandler;
pub use resubmit::ResubmitHandler;

/// Strategy for rows claimed in one status
#[async_trait]
pub trait StatusHandler: Send + Sync {
    /// The status this handler is registered for
    fn status(&self) -> TransactionStatus;

    /// Process every row of one status partition. Must leave no row holding `lease`.
    async fn handle_batch(
        &self,
        lease: LeaseId,
        rows: Vec<TransactionMeta>,
    ) -> Result<BatchOutcome, AppError>;
}

/// Result of one handler invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub claimed: usize,
    pub released: u64,
    /// Rows whose release matched nothing (lease lost or status changed)
    pub lost: u64,
    pub requeued: usize,
}

/// Tunables shared by all handlers
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    /// Grace given to a requeued transaction before QueuedHandler fails it
    pub queued_grace_secs: i64,
    /// Concurrent shard log writes per chunk
    pub log_batch_size: usize,
    pub log_write_timeout: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            queued_grace_secs: 300,
            log_batch_size: 10,
            log_write_timeout: Duration::from_secs(5),
        }
    }
}

impl HandlerSettings {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let queued_grace_secs = std::env::var("QUEUED_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.queued_grace_secs);
        Self {
            queued_grace_secs,
            ..defaults
        }
    }
}

/// Collaborators every handler works against
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<dyn LockLeaseStore>,
    pub tx_log: Arc<dyn TransactionLogStore>,
    pub chain: Arc<dyn ChainClient>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub retry: RetryPolicy,
    pub digest: Arc<FailureDigest>,
    pub settings: HandlerSettings,
}

/// Planned outcome for one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transition {
    pub update: ReleaseUpdate,
    pub log: Option<TransactionLogUpdate>,
    /// Republish the execute message once the release lands
    pub requeue: bool,
}

impl Transition {
    pub(crate) fn new(update: ReleaseUpdate) -> Self {
        Self {
            update,
            log: None,
            requeue: false,
        }
    }

    pub(crate) fn with_log(mut self, log: TransactionLogUpdate) -> Self {
        self.log = Some(log);
        self
    }

    /// Terminal failure, mirrored into the shard log
    pub(crate) fn failed(code: &str) -> Self {
        Self::new(ReleaseUpdate::failed(code)).with_log(
            TransactionLogUpdate::status(TransactionStatus::Failed)
                .with_error_code(Some(code.to_string())),
        )
    }

    /// Another attempt later, or terminal failure once the retry budget is spent
    pub(crate) fn retry(ctx: &HandlerContext, row: &TransactionMeta, now_secs: i64) -> Self {
        if ctx.retry.exhausted_after_increment(row.retry_count) {
            let mut transition = Self::failed("retries_exhausted");
            transition.update.increment_retry = true;
            return transition;
        }
        Self::new(ReleaseUpdate::retry_at(
            now_secs + ctx.retry.backoff_secs(row.retry_count),
        ))
    }

    /// Hand the transaction back to the execution workflow
    pub(crate) fn requeue(ctx: &HandlerContext, row: &TransactionMeta, now_secs: i64) -> Self {
        if ctx.retry.exhausted_after_increment(row.retry_count) {
            return Self::retry(ctx, row, now_secs);
        }
        let update = ReleaseUpdate {
            status: Some(TransactionStatus::Queued),
            next_action: NextAction::At(now_secs + ctx.settings.queued_grace_secs),
            increment_retry: true,
            ..ReleaseUpdate::default()
        };
        Self {
            update,
            log: Some(TransactionLogUpdate::status(TransactionStatus::Queued)),
            requeue: true,
        }
    }
}

/// Abort the whole batch if any row drifted from what the handler expects.
///
/// All rows go back unchanged; nothing is mutated for any of them.
pub(crate) async fn abort_if_inconsistent(
    ctx: &HandlerContext,
    lease: LeaseId,
    expected: TransactionStatus,
    rows: &[TransactionMeta],
) -> Result<(), AppError> {
    let drifted: Vec<i64> = rows
        .iter()
        .filter(|row| row.status != expected || row.lock != Some(lease))
        .map(|row| row.id)
        .collect();

    if drifted.is_empty() {
        return Ok(());
    }

    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    warn!(
        lease = %lease,
        expected = %expected,
        drifted = ?drifted,
        batch = ids.len(),
        "Claimed rows do not match handler expectation, aborting batch"
    );
    let released = ctx.store.release(lease, &Release::unchanged(ids)).await?;
    debug!(lease = %lease, released, "Released aborted batch unchanged");

    Err(AppError::Consistency(format!(
        "{} of {} rows in {} batch drifted under lease {}",
        drifted.len(),
        rows.len(),
        expected,
        lease
    )))
}

/// Write shard log updates in bounded concurrent chunks. Failures are logged only.
pub(crate) async fn write_log_updates(
    ctx: &HandlerContext,
    planned: &[(TransactionMeta, Transition)],
) {
    let writes: Vec<(&TransactionMeta, &TransactionLogUpdate)> = planned
        .iter()
        .filter_map(|(row, transition)| transition.log.as_ref().map(|log| (row, log)))
        .collect();

    for chunk in writes.chunks(ctx.settings.log_batch_size.max(1)) {
        let results = join_all(chunk.iter().map(|(row, update)| async move {
            let write = ctx
                .tx_log
                .update_item(row.shard_key(), row.transaction_uuid, update);
            match tokio::time::timeout(ctx.settings.log_write_timeout, write).await {
                Ok(result) => (row, result),
                Err(_) => (
                    row,
                    Err(AppError::ExternalService(
                        crate::domain::ExternalServiceError::Timeout(
                            "transaction log update".to_string(),
                        ),
                    )),
                ),
            }
        }))
        .await;

        for (row, result) in results {
            if let Err(e) = result {
                warn!(
                    id = row.id,
                    uuid = %row.transaction_uuid,
                    shard = %row.shard_key(),
                    error = %e,
                    "Transaction log update failed"
                );
            }
        }
    }
}

/// Log, release and requeue according to the plan.
///
/// Rows no longer held by `lease` are dropped from the plan before any side
/// effect, and digest entries are recorded only for releases that landed.
pub(crate) async fn apply_plan(
    ctx: &HandlerContext,
    lease: LeaseId,
    expected: TransactionStatus,
    planned: Vec<(TransactionMeta, Transition)>,
) -> Result<BatchOutcome, AppError> {
    let mut outcome = BatchOutcome {
        claimed: planned.len(),
        ..BatchOutcome::default()
    };

    let held: HashSet<i64> = ctx
        .store
        .fetch(lease)
        .await?
        .into_iter()
        .filter(|row| row.status == expected)
        .map(|row| row.id)
        .collect();
    let (planned, taken): (Vec<_>, Vec<_>) = planned
        .into_iter()
        .partition(|(row, _)| held.contains(&row.id));
    if !taken.is_empty() {
        outcome.lost += taken.len() as u64;
        warn!(
            lease = %lease,
            status = %expected,
            ids = ?taken.iter().map(|(row, _)| row.id).collect::<Vec<_>>(),
            "Rows no longer held by lease, skipping their transitions"
        );
    }

    write_log_updates(ctx, &planned).await;

    // Requeued rows are released one by one so the publish only follows a landed release
    let mut groups: Vec<(&ReleaseUpdate, Vec<&TransactionMeta>)> = Vec::new();
    let mut requeues: Vec<(&TransactionMeta, &ReleaseUpdate)> = Vec::new();
    for (row, transition) in &planned {
        if transition.requeue {
            requeues.push((row, &transition.update));
            continue;
        }
        match groups
            .iter_mut()
            .find(|(update, _)| **update == transition.update)
        {
            Some((_, rows)) => rows.push(row),
            None => groups.push((&transition.update, vec![row])),
        }
    }

    for (update, rows) in groups {
        let expected_count = rows.len() as u64;
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let release = Release::new(ids, expected, update.clone());
        let released = ctx.store.release(lease, &release).await?;
        outcome.released += released;
        if released < expected_count {
            outcome.lost += expected_count - released;
            warn!(
                lease = %lease,
                status = %expected,
                ids = ?release.ids,
                expected = expected_count,
                released,
                "Release matched fewer rows than claimed, lease lost"
            );
            continue;
        }
        if update.status == Some(TransactionStatus::Failed) {
            record_failures(ctx, expected, update, &rows);
        }
    }

    for (row, update) in requeues {
        let released = ctx
            .store
            .release(lease, &Release::new(vec![row.id], expected, update.clone()))
            .await?;
        if released == 0 {
            outcome.lost += 1;
            warn!(lease = %lease, id = row.id, "Lease lost before requeue, skipping publish");
            continue;
        }
        outcome.released += released;
        match ctx.publisher.requeue_transaction(row.transaction_uuid).await {
            Ok(true) => outcome.requeued += 1,
            Ok(false) => {
                error!(id = row.id, uuid = %row.transaction_uuid, "No execute message to requeue");
                ctx.digest.record(
                    "requeue_missing_message",
                    Some(row.transaction_uuid),
                    "no execute message found",
                );
            }
            Err(e) => {
                error!(
                    id = row.id,
                    uuid = %row.transaction_uuid,
                    error = %e,
                    "Requeue publish failed"
                );
                ctx.digest
                    .record("requeue_failed", Some(row.transaction_uuid), e.to_string());
            }
        }
    }

    Ok(outcome)
}

fn record_failures(
    ctx: &HandlerContext,
    expected: TransactionStatus,
    update: &ReleaseUpdate,
    rows: &[&TransactionMeta],
) {
    let code = update.error_code.as_deref().unwrap_or("failed");
    for row in rows {
        ctx.digest.record(
            code,
            Some(row.transaction_uuid),
            format!("{} -> failed (retry {})", expected, row.retry_count),
        );
    }
}
