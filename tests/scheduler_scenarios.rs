//! End-to-end scheduler ticks against the in-memory lease store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use tx_orchestrator::app::{LeaseScheduler, SchedulerConfig, StatusHandlerRegistry};
use tx_orchestrator::domain::{ChainTxState, ShardKey, TransactionLogStore, TransactionStatus};
use tx_orchestrator::test_utils::{
    Harness, TEST_CHAIN_ID, queued_row, row_with_hash, row_with_status,
};

fn scheduler(harness: &Harness) -> LeaseScheduler {
    LeaseScheduler::new(
        SchedulerConfig {
            process_id: 11,
            max_jitter: Duration::ZERO,
            ..SchedulerConfig::default()
        },
        harness.store.clone(),
        StatusHandlerRegistry::standard(harness.context()),
        harness.retry,
        Arc::clone(&harness.digest),
    )
}

/// Move a row's deadline into the past so the next tick may claim it
fn make_due(harness: &Harness, id: i64) {
    let mut row = harness.store.get(id).expect("row exists");
    row.next_action_at = row.next_action_at.map(|_| Utc::now().timestamp() - 1);
    harness.insert(row);
}

#[tokio::test]
async fn test_abandoned_queued_row_ends_failed_in_both_stores() {
    let harness = Harness::new();
    let row = harness.insert(queued_row(1, -60));

    let report = scheduler(&harness).tick().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.handler_failures, 0);

    let stored = harness.store.get(row.id).unwrap();
    assert_eq!(stored.status, TransactionStatus::Failed);
    assert_eq!(stored.next_action_at, None);
    assert_eq!(stored.lock, None);

    let record = harness
        .tx_log
        .get_record(ShardKey::new(row.client_id, row.chain_id), row.transaction_uuid)
        .await
        .unwrap()
        .expect("shard record written");
    assert_eq!(record.status, TransactionStatus::Failed);
}

#[tokio::test]
async fn test_second_tick_leaves_failed_row_untouched() {
    let harness = Harness::new();
    harness.insert(queued_row(1, -60));
    let scheduler = scheduler(&harness);

    scheduler.tick().await.unwrap();
    let after_first = harness.store.get(1).unwrap();
    let writes = harness.tx_log.write_count();

    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(harness.store.get(1).unwrap(), after_first);
    assert_eq!(harness.tx_log.write_count(), writes);
}

#[tokio::test]
async fn test_ninth_retry_becomes_permanently_unclaimable() {
    let harness = Harness::new();
    let mut row = row_with_hash(1, TransactionStatus::Submitted, "0xabc", -60);
    row.retry_count = 9;
    harness.insert(row);
    harness.chain.set_state("0xabc", ChainTxState::Pending);
    let scheduler = scheduler(&harness);

    scheduler.tick().await.unwrap();
    let stored = harness.store.get(1).unwrap();
    assert_eq!(stored.retry_count, 10);
    assert_eq!(stored.status, TransactionStatus::Failed);
    assert_eq!(stored.next_action_at, None);

    // Even with a past deadline and a claimable status, 10 retries excludes it
    let mut revived = stored;
    revived.status = TransactionStatus::Submitted;
    revived.next_action_at = Some(Utc::now().timestamp() - 60);
    harness.insert(revived);
    assert_eq!(scheduler.tick().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn test_retry_count_never_passes_budget() {
    let harness = Harness::new();
    harness.insert(row_with_hash(1, TransactionStatus::Submitted, "0xabc", -60));
    harness.chain.set_state("0xabc", ChainTxState::NotFound);
    let scheduler = scheduler(&harness);

    let mut claims = 0;
    for _ in 0..15 {
        claims += scheduler.tick().await.unwrap().claimed;
        let stored = harness.store.get(1).unwrap();
        assert!(stored.retry_count <= harness.retry.max_retries);
        assert_eq!(stored.lock, None);
        make_due(&harness, 1);
    }

    let stored = harness.store.get(1).unwrap();
    assert_eq!(claims, 10);
    assert_eq!(stored.retry_count, 10);
    assert_eq!(stored.status, TransactionStatus::Failed);
    assert_eq!(stored.error_code.as_deref(), Some("retries_exhausted"));
}

#[tokio::test]
async fn test_every_partition_is_released() {
    let harness = Harness::new();
    harness.insert(queued_row(1, -60));
    harness.insert(row_with_hash(2, TransactionStatus::Submitted, "0x02", -60));
    harness.insert(row_with_status(3, TransactionStatus::GethDown, -60));
    let unknown = harness.insert(row_with_status(4, TransactionStatus::Unknown, -60));
    let nonce = harness.insert(row_with_status(5, TransactionStatus::NonceTooLow, -60));
    harness.insert(row_with_hash(6, TransactionStatus::Submitted, "0x06", -60));
    harness.chain.set_state("0x02", ChainTxState::Mined { block_number: 1, success: true });
    harness.chain.set_state("0x06", ChainTxState::Pending);
    harness.chain.set_node_healthy(TEST_CHAIN_ID, false);
    harness.publisher.remember(unknown.transaction_uuid);
    harness.publisher.remember(nonce.transaction_uuid);

    let report = scheduler(&harness).tick().await.unwrap();
    assert_eq!(report.claimed, 6);
    assert_eq!(report.partitions, 5);
    assert_eq!(report.stuck_leases, 0);
    assert_eq!(report.requeued, 2);
    assert!(harness.store.all().iter().all(|row| row.lock.is_none()));

    let status = |id| harness.store.get(id).unwrap().status;
    assert_eq!(status(1), TransactionStatus::Failed);
    assert_eq!(status(2), TransactionStatus::Mined);
    assert_eq!(status(3), TransactionStatus::GethDown);
    assert_eq!(status(4), TransactionStatus::Queued);
    assert_eq!(status(5), TransactionStatus::Queued);
    assert_eq!(status(6), TransactionStatus::Submitted);
}

#[tokio::test]
async fn test_failing_release_still_frees_rows() {
    let harness = Harness::new();
    harness.insert(queued_row(1, -60));
    harness.insert(row_with_hash(2, TransactionStatus::Submitted, "0x02", -60));
    harness.store.fail_releases(true);

    let report = scheduler(&harness).tick().await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.handler_failures, 2);
    assert_eq!(report.stuck_leases, 2);
    assert!(harness.store.all().iter().all(|row| row.lock.is_none()));
    assert_eq!(harness.store.get(1).unwrap().status, TransactionStatus::Queued);
}

#[tokio::test]
async fn test_rows_beyond_batch_size_wait_for_next_tick() {
    let harness = Harness::new();
    for id in 1..=5 {
        harness.insert(queued_row(id, -60));
    }
    let scheduler = LeaseScheduler::new(
        SchedulerConfig {
            process_id: 11,
            rows_to_process: 3,
            max_jitter: Duration::ZERO,
            ..SchedulerConfig::default()
        },
        harness.store.clone(),
        StatusHandlerRegistry::standard(harness.context()),
        harness.retry,
        Arc::clone(&harness.digest),
    );

    assert_eq!(scheduler.tick().await.unwrap().claimed, 3);
    assert_eq!(scheduler.tick().await.unwrap().claimed, 2);
    assert!(
        harness
            .store
            .all()
            .iter()
            .all(|row| row.status == TransactionStatus::Failed)
    );
}
