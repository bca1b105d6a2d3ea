//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    AppError, ChainClient, ChainError, ChainTxState, ClaimCriteria, DatabaseError, Delivery,
    ExecuteTransactionMessage, ExecutionRecord, ExternalServiceError, LeaseId, LockLeaseStore,
    MessageHandler, MessagePublisher, MessageSource, ProcessRegistry, QueueError, Release,
    ShardKey, TransactionLogRecord, TransactionLogStore, TransactionLogUpdate, TransactionMeta,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory `transaction_meta` table.
///
/// Every operation runs under one mutex, which gives the same atomicity the
/// conditional SQL statements give the Postgres store.
pub struct InMemoryLeaseStore {
    rows: Mutex<BTreeMap<i64, TransactionMeta>>,
    fail_releases: AtomicBool,
    is_healthy: AtomicBool,
}

impl InMemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            fail_releases: AtomicBool::new(false),
            is_healthy: AtomicBool::new(true),
        }
    }

    /// Insert or replace a row as-is
    pub fn insert(&self, row: TransactionMeta) -> TransactionMeta {
        lock(&self.rows).insert(row.id, row.clone());
        row
    }

    pub fn get(&self, id: i64) -> Option<TransactionMeta> {
        lock(&self.rows).get(&id).cloned()
    }

    pub fn all(&self) -> Vec<TransactionMeta> {
        lock(&self.rows).values().cloned().collect()
    }

    /// Rows held by `lease`, without going through the async trait
    pub fn fetch_now(&self, lease: LeaseId) -> Vec<TransactionMeta> {
        lock(&self.rows)
            .values()
            .filter(|row| row.lock == Some(lease))
            .cloned()
            .collect()
    }

    /// Make `release` fail. `release_all` keeps working.
    pub fn fail_releases(&self, failing: bool) {
        self.fail_releases.store(failing, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::SeqCst);
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockLeaseStore for InMemoryLeaseStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if self.is_healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Database(DatabaseError::Connection(
                "Database unhealthy".to_string(),
            )))
        }
    }

    async fn claim(&self, lease: LeaseId, criteria: &ClaimCriteria) -> Result<u64, AppError> {
        Ok(self.claim_and_fetch(lease, criteria).await?.len() as u64)
    }

    async fn fetch(&self, lease: LeaseId) -> Result<Vec<TransactionMeta>, AppError> {
        Ok(self.fetch_now(lease))
    }

    async fn claim_and_fetch(
        &self,
        lease: LeaseId,
        criteria: &ClaimCriteria,
    ) -> Result<Vec<TransactionMeta>, AppError> {
        let mut rows = lock(&self.rows);
        let limit = usize::try_from(criteria.limit.max(0)).unwrap_or(usize::MAX);
        let mut claimed = Vec::new();
        for row in rows.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if criteria.matches(row) {
                row.lock = Some(lease);
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn release(&self, lease: LeaseId, release: &Release) -> Result<u64, AppError> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(AppError::Database(DatabaseError::Query(
                "release failed".to_string(),
            )));
        }
        let mut rows = lock(&self.rows);
        let mut released = 0;
        for id in &release.ids {
            let Some(row) = rows.get_mut(id) else {
                continue;
            };
            let status_matches = release
                .expected_status
                .is_none_or(|expected| row.status == expected);
            if row.lock == Some(lease) && status_matches {
                release.update.apply_to(row);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_all(&self, lease: LeaseId) -> Result<u64, AppError> {
        let mut rows = lock(&self.rows);
        let mut released = 0;
        for row in rows.values_mut().filter(|row| row.lock == Some(lease)) {
            row.lock = None;
            released += 1;
        }
        Ok(released)
    }

    async fn reclaim_expired_leases(&self, older_than_millis: i64) -> Result<u64, AppError> {
        let mut rows = lock(&self.rows);
        let mut reclaimed = 0;
        for row in rows.values_mut() {
            if row
                .lock
                .is_some_and(|lease| lease.epoch_millis < older_than_millis)
            {
                row.lock = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<bool, AppError> {
        let mut rows = lock(&self.rows);
        let existing = rows
            .values_mut()
            .find(|row| row.transaction_uuid == record.transaction_uuid);

        if let Some(row) = existing {
            if row.lock.is_some() || row.status.is_terminal() {
                return Ok(false);
            }
            if record.transaction_hash.is_some() {
                row.transaction_hash = record.transaction_hash.clone();
            }
            row.status = record.status;
            row.next_action_at = record.next_action_at;
            row.error_code = record.error_code.clone();
            row.updated_at = Utc::now();
            return Ok(true);
        }

        let id = rows.keys().next_back().map_or(1, |last| last + 1);
        let mut row = TransactionMeta::new(id, record.client_id, record.chain_id, record.status);
        row.transaction_uuid = record.transaction_uuid;
        row.transaction_hash = record.transaction_hash.clone();
        row.kind = record.kind;
        row.next_action_at = record.next_action_at;
        row.error_code = record.error_code.clone();
        rows.insert(id, row);
        Ok(true)
    }

    async fn get_by_uuid(
        &self,
        transaction_uuid: Uuid,
    ) -> Result<Option<TransactionMeta>, AppError> {
        Ok(lock(&self.rows)
            .values()
            .find(|row| row.transaction_uuid == transaction_uuid)
            .cloned())
    }
}

/// Mock sharded transaction log
#[derive(Default)]
pub struct MockTransactionLogStore {
    records: Mutex<HashMap<(ShardKey, Uuid), TransactionLogRecord>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MockTransactionLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Write attempts, failed ones included
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn begin_write(&self) -> Result<(), AppError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::ExternalService(ExternalServiceError::Unavailable(
                "transaction log unavailable".to_string(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionLogStore for MockTransactionLogStore {
    async fn update_item(
        &self,
        shard: ShardKey,
        transaction_uuid: Uuid,
        update: &TransactionLogUpdate,
    ) -> Result<(), AppError> {
        self.begin_write()?;
        let mut records = lock(&self.records);
        let record = records
            .entry((shard, transaction_uuid))
            .or_insert_with(|| TransactionLogRecord {
                transaction_uuid,
                shard,
                status: update.status,
                transaction_hash: None,
                from_address: None,
                to_address: None,
                amount: None,
                error_code: None,
                updated_at: Utc::now(),
            });
        record.status = update.status;
        if update.transaction_hash.is_some() {
            record.transaction_hash = update.transaction_hash.clone();
        }
        if update.error_code.is_some() {
            record.error_code = update.error_code.clone();
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_record(&self, record: &TransactionLogRecord) -> Result<(), AppError> {
        self.begin_write()?;
        lock(&self.records).insert((record.shard, record.transaction_uuid), record.clone());
        Ok(())
    }

    async fn get_record(
        &self,
        shard: ShardKey,
        transaction_uuid: Uuid,
    ) -> Result<Option<TransactionLogRecord>, AppError> {
        Ok(lock(&self.records).get(&(shard, transaction_uuid)).cloned())
    }
}

/// Mock chain node. Unknown hashes are `NotFound`, chains are healthy by default.
#[derive(Default)]
pub struct MockChainClient {
    states: Mutex<HashMap<String, ChainTxState>>,
    lookup_error: Mutex<Option<ChainError>>,
    unhealthy_chains: Mutex<HashSet<i64>>,
    health_probes: AtomicUsize,
    submit_result: Mutex<Option<Result<String, ChainError>>>,
    submitted: Mutex<Vec<Uuid>>,
}

impl MockChainClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, transaction_hash: &str, state: ChainTxState) {
        lock(&self.states).insert(transaction_hash.to_string(), state);
    }

    /// Fail every subsequent state lookup with `error`
    pub fn fail_lookups(&self, error: ChainError) {
        *lock(&self.lookup_error) = Some(error);
    }

    pub fn set_node_healthy(&self, chain_id: i64, healthy: bool) {
        let mut unhealthy = lock(&self.unhealthy_chains);
        if healthy {
            unhealthy.remove(&chain_id);
        } else {
            unhealthy.insert(chain_id);
        }
    }

    pub fn health_probes(&self) -> usize {
        self.health_probes.load(Ordering::SeqCst)
    }

    pub fn set_submit_result(&self, result: Result<String, ChainError>) {
        *lock(&self.submit_result) = Some(result);
    }

    /// Transactions passed to `submit`, in call order
    pub fn submitted(&self) -> Vec<Uuid> {
        lock(&self.submitted).clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn transaction_state(
        &self,
        _chain_id: i64,
        transaction_hash: &str,
    ) -> Result<ChainTxState, AppError> {
        if let Some(error) = lock(&self.lookup_error).clone() {
            return Err(AppError::Chain(error));
        }
        Ok(lock(&self.states)
            .get(transaction_hash)
            .cloned()
            .unwrap_or(ChainTxState::NotFound))
    }

    async fn is_node_healthy(&self, chain_id: i64) -> Result<bool, AppError> {
        self.health_probes.fetch_add(1, Ordering::SeqCst);
        Ok(!lock(&self.unhealthy_chains).contains(&chain_id))
    }

    async fn submit(&self, message: &ExecuteTransactionMessage) -> Result<String, AppError> {
        lock(&self.submitted).push(message.transaction_uuid);
        match lock(&self.submit_result).clone() {
            Some(Ok(hash)) => Ok(hash),
            Some(Err(error)) => Err(AppError::Chain(error)),
            None => Ok(format!("0x{}", message.transaction_uuid.simple())),
        }
    }
}

/// Mock broker publisher. Only remembered transactions have a message to requeue.
#[derive(Default)]
pub struct MockPublisher {
    known: Mutex<HashSet<Uuid>>,
    requeued: Mutex<Vec<Uuid>>,
    published: Mutex<Vec<(String, ExecuteTransactionMessage)>>,
}

impl MockPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend an execute message for `transaction_uuid` was published earlier
    pub fn remember(&self, transaction_uuid: Uuid) {
        lock(&self.known).insert(transaction_uuid);
    }

    pub fn requeued(&self) -> Vec<Uuid> {
        lock(&self.requeued).clone()
    }

    pub fn published(&self) -> Vec<(String, ExecuteTransactionMessage)> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl MessagePublisher for MockPublisher {
    async fn publish(
        &self,
        queue: &str,
        message: &ExecuteTransactionMessage,
    ) -> Result<i64, AppError> {
        let mut published = lock(&self.published);
        published.push((queue.to_string(), message.clone()));
        self.remember(message.transaction_uuid);
        Ok(published.len() as i64)
    }

    async fn requeue_transaction(&self, transaction_uuid: Uuid) -> Result<bool, AppError> {
        if !lock(&self.known).contains(&transaction_uuid) {
            return Ok(false);
        }
        lock(&self.requeued).push(transaction_uuid);
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct ProcessEntry {
    heartbeat_at: DateTime<Utc>,
    stopped: bool,
    heartbeats: usize,
}

/// Mock process registry
#[derive(Default)]
pub struct MockProcessRegistry {
    entries: Mutex<HashMap<(String, i32), ProcessEntry>>,
}

impl MockProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeats(&self, role: &str, process_id: i32) -> usize {
        lock(&self.entries)
            .get(&(role.to_string(), process_id))
            .map_or(0, |entry| entry.heartbeats)
    }

    pub fn is_running(&self, role: &str, process_id: i32) -> bool {
        lock(&self.entries)
            .get(&(role.to_string(), process_id))
            .is_some_and(|entry| !entry.stopped)
    }
}

#[async_trait]
impl ProcessRegistry for MockProcessRegistry {
    async fn register_process(
        &self,
        role: &str,
        process_id: i32,
        stale_after_secs: i64,
    ) -> Result<bool, AppError> {
        let mut entries = lock(&self.entries);
        let now = Utc::now();
        let key = (role.to_string(), process_id);
        if let Some(entry) = entries.get(&key) {
            let stale = entry.heartbeat_at < now - chrono::Duration::seconds(stale_after_secs);
            if !entry.stopped && !stale {
                return Ok(false);
            }
        }
        entries.insert(
            key,
            ProcessEntry {
                heartbeat_at: now,
                stopped: false,
                heartbeats: 0,
            },
        );
        Ok(true)
    }

    async fn heartbeat(&self, role: &str, process_id: i32) -> Result<(), AppError> {
        if let Some(entry) = lock(&self.entries).get_mut(&(role.to_string(), process_id)) {
            entry.heartbeat_at = Utc::now();
            entry.heartbeats += 1;
        }
        Ok(())
    }

    async fn mark_stopped(&self, role: &str, process_id: i32) -> Result<(), AppError> {
        if let Some(entry) = lock(&self.entries).get_mut(&(role.to_string(), process_id)) {
            entry.stopped = true;
        }
        Ok(())
    }
}

/// In-memory broker subscription
#[derive(Default)]
pub struct InMemoryMessageSource {
    ready: Mutex<VecDeque<Delivery>>,
    acked: Mutex<Vec<i64>>,
    fail_acks: AtomicBool,
}

impl InMemoryMessageSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, delivery: Delivery) {
        lock(&self.ready).push_back(delivery);
    }

    /// Queue one delivery with an empty payload
    pub fn push_tag(&self, tag: i64) {
        self.push(Delivery {
            tag,
            queue: "execute_transaction".to_string(),
            payload: serde_json::Value::Null,
            transaction_uuid: Some(Uuid::new_v4()),
            redelivered: false,
        });
    }

    /// Queue `count` deliveries tagged `1..=count`
    pub fn push_tags(&self, count: i64) {
        for tag in 1..=count {
            self.push_tag(tag);
        }
    }

    pub fn remaining(&self) -> usize {
        lock(&self.ready).len()
    }

    pub fn acked(&self) -> Vec<i64> {
        let mut acked = lock(&self.acked).clone();
        acked.sort_unstable();
        acked
    }

    pub fn fail_acks(&self, failing: bool) {
        self.fail_acks.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageSource for InMemoryMessageSource {
    async fn next_delivery(&self) -> Result<Option<Delivery>, AppError> {
        Ok(lock(&self.ready).pop_front())
    }

    async fn ack(&self, tag: i64) -> Result<(), AppError> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(AppError::Queue(QueueError::AckFailed(tag)));
        }
        lock(&self.acked).push(tag);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Behavior {
    Delay(Duration),
    Fail,
    Panic,
}

/// Message handler with scripted per-tag delays, failures and panics
#[derive(Default)]
pub struct MockMessageHandler {
    behaviors: Mutex<HashMap<i64, Behavior>>,
    default_delay: Mutex<Duration>,
    handled: Mutex<Vec<i64>>,
    started: AtomicUsize,
}

impl MockMessageHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to tags without a scripted behavior
    pub fn set_default_delay(&self, delay: Duration) {
        *lock(&self.default_delay) = delay;
    }

    pub fn delay(&self, tag: i64, delay: Duration) {
        lock(&self.behaviors).insert(tag, Behavior::Delay(delay));
    }

    pub fn fail(&self, tag: i64) {
        lock(&self.behaviors).insert(tag, Behavior::Fail);
    }

    pub fn panic_on(&self, tag: i64) {
        lock(&self.behaviors).insert(tag, Behavior::Panic);
    }

    /// Tags whose handler ran to completion, successful or not
    pub fn handled(&self) -> Vec<i64> {
        let mut handled = lock(&self.handled).clone();
        handled.sort_unstable();
        handled
    }

    /// Handler invocations started so far
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for MockMessageHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let behavior = lock(&self.behaviors).get(&delivery.tag).cloned();
        let default_delay = *lock(&self.default_delay);

        let result = match behavior {
            Some(Behavior::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(Behavior::Fail) => Err(AppError::Internal(format!(
                "scripted failure for {}",
                delivery.tag
            ))),
            Some(Behavior::Panic) => panic!("scripted panic for {}", delivery.tag),
            None => {
                if !default_delay.is_zero() {
                    tokio::time::sleep(default_delay).await;
                }
                Ok(())
            }
        };
        lock(&self.handled).push(delivery.tag);
        result
    }
}

