//! Test doubles and fixtures shared by unit and integration tests.

pub mod mocks;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

pub use mocks::{
    InMemoryLeaseStore, InMemoryMessageSource, MockChainClient, MockMessageHandler,
    MockProcessRegistry, MockPublisher, MockTransactionLogStore,
};

use crate::app::{FailureDigest, HandlerContext, HandlerSettings, RetryPolicy};
use crate::domain::{
    ClaimCriteria, Delivery, ExecuteTransactionMessage, LeaseId, LockLeaseStore, TransactionKind,
    TransactionMeta, TransactionStatus,
};

/// Client every fixture row belongs to
pub const TEST_CLIENT_ID: i64 = 7;
/// Chain every fixture row lives on
pub const TEST_CHAIN_ID: i64 = 1;

/// One set of mocks wired together the way the observer wires real stores
pub struct Harness {
    pub store: Arc<InMemoryLeaseStore>,
    pub tx_log: Arc<MockTransactionLogStore>,
    pub chain: Arc<MockChainClient>,
    pub publisher: Arc<MockPublisher>,
    pub digest: Arc<FailureDigest>,
    pub retry: RetryPolicy,
    pub settings: HandlerSettings,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryLeaseStore::new()),
            tx_log: Arc::new(MockTransactionLogStore::new()),
            chain: Arc::new(MockChainClient::new()),
            publisher: Arc::new(MockPublisher::new()),
            digest: Arc::new(FailureDigest::new()),
            retry: RetryPolicy::default(),
            settings: HandlerSettings::default(),
        }
    }

    pub fn insert(&self, row: TransactionMeta) -> TransactionMeta {
        self.store.insert(row)
    }

    /// Claim every eligible row in `status` under a fresh lease
    pub async fn claim_all(&self, status: TransactionStatus) -> LeaseId {
        let lease = LeaseId::generate(99);
        let criteria = ClaimCriteria {
            statuses: vec![status],
            now_secs: Utc::now().timestamp(),
            max_retries: self.retry.max_retries,
            limit: i64::MAX,
        };
        self.store
            .claim_and_fetch(lease, &criteria)
            .await
            .expect("in-memory claim cannot fail");
        lease
    }

    #[must_use]
    pub fn context(&self) -> HandlerContext {
        HandlerContext {
            store: self.store.clone(),
            tx_log: self.tx_log.clone(),
            chain: self.chain.clone(),
            publisher: self.publisher.clone(),
            retry: self.retry,
            digest: Arc::clone(&self.digest),
            settings: self.settings,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Unleased row in `status` whose deadline is `offset_secs` from now
#[must_use]
pub fn row_with_status(id: i64, status: TransactionStatus, offset_secs: i64) -> TransactionMeta {
    let mut row = TransactionMeta::new(id, TEST_CLIENT_ID, TEST_CHAIN_ID, status);
    row.next_action_at = Some(Utc::now().timestamp() + offset_secs);
    row
}

#[must_use]
pub fn queued_row(id: i64, offset_secs: i64) -> TransactionMeta {
    row_with_status(id, TransactionStatus::Queued, offset_secs)
}

#[must_use]
pub fn row_with_hash(
    id: i64,
    status: TransactionStatus,
    transaction_hash: &str,
    offset_secs: i64,
) -> TransactionMeta {
    let mut row = row_with_status(id, status, offset_secs);
    row.transaction_hash = Some(transaction_hash.to_string());
    row
}

#[must_use]
pub fn execute_message(client_id: i64, chain_id: i64) -> ExecuteTransactionMessage {
    ExecuteTransactionMessage {
        transaction_uuid: Uuid::new_v4(),
        client_id,
        chain_id,
        kind: TransactionKind::TokenTransfer,
        from_address: "0x1111111111111111111111111111111111111111".to_string(),
        to_address: "0x2222222222222222222222222222222222222222".to_string(),
        amount: "1000000000000000000".to_string(),
        raw_transaction: Some("0x02f86b".to_string()),
    }
}

#[must_use]
pub fn execute_delivery(tag: i64, message: &ExecuteTransactionMessage) -> Delivery {
    Delivery {
        tag,
        queue: crate::app::consumer::DEFAULT_QUEUE.to_string(),
        payload: serde_json::to_value(message).expect("message serializes"),
        transaction_uuid: Some(message.transaction_uuid),
        redelivered: false,
    }
}
