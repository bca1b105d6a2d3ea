//! Domain types for transaction recovery and queue-driven execution.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lease::LeaseId;

/// Default cap on reclaim attempts for a single transaction
pub const DEFAULT_MAX_RETRIES: i32 = 10;

/// Lifecycle status of a transaction as tracked in `transaction_meta`
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Accepted by the execution workflow, not yet on chain
    #[default]
    Queued,
    /// Broadcast to the chain, awaiting mining
    Submitted,
    /// Being executed by a queue consumer
    Processing,
    /// Included in a block
    Mined,
    /// Terminal failure, never retried
    Failed,
    /// Submission outcome could not be determined
    Unknown,
    /// Chain node was unreachable
    GethDown,
    /// Sender could not cover gas
    InsufficientGas,
    /// Nonce was already used
    NonceTooLow,
    /// Replacement was rejected for a low gas price
    ReplacementTxUnderPriced,
}

impl TransactionStatus {
    pub const ALL: [Self; 10] = [
        Self::Queued,
        Self::Submitted,
        Self::Processing,
        Self::Mined,
        Self::Failed,
        Self::Unknown,
        Self::GethDown,
        Self::InsufficientGas,
        Self::NonceTooLow,
        Self::ReplacementTxUnderPriced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Mined => "mined",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
            Self::GethDown => "geth_down",
            Self::InsufficientGas => "insufficient_gas",
            Self::NonceTooLow => "nonce_too_low",
            Self::ReplacementTxUnderPriced => "replacement_tx_under_priced",
        }
    }

    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Mined | Self::Failed)
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid transaction status: {}", s))
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of token movement a transaction performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    #[default]
    TokenTransfer,
    StpTransfer,
    ExternalTransfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenTransfer => "token_transfer",
            Self::StpTransfer => "stp_transfer",
            Self::ExternalTransfer => "external_transfer",
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_transfer" => Ok(Self::TokenTransfer),
            "stp_transfer" => Ok(Self::StpTransfer),
            "external_transfer" => Ok(Self::ExternalTransfer),
            _ => Err(format!("Invalid transaction kind: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Relational source of truth for retry scheduling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionMeta {
    pub id: i64,
    pub transaction_uuid: Uuid,
    pub transaction_hash: Option<String>,
    pub client_id: i64,
    pub chain_id: i64,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    /// Owning scheduler lease, set only between claim and release
    pub lock: Option<LeaseId>,
    /// Earliest reclaim time in epoch seconds; `None` once terminal
    pub next_action_at: Option<i64>,
    pub retry_count: i32,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionMeta {
    #[must_use]
    pub fn new(id: i64, client_id: i64, chain_id: i64, status: TransactionStatus) -> Self {
        let now = Utc::now();
        Self {
            id,
            transaction_uuid: Uuid::new_v4(),
            transaction_hash: None,
            client_id,
            chain_id,
            kind: TransactionKind::TokenTransfer,
            status,
            lock: None,
            next_action_at: Some(now.timestamp()),
            retry_count: 0,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn shard_key(&self) -> ShardKey {
        ShardKey::new(self.client_id, self.chain_id)
    }
}

/// Rows grouped by status, in a stable status order
pub fn partition_by_status(
    rows: Vec<TransactionMeta>,
) -> BTreeMap<TransactionStatus, Vec<TransactionMeta>> {
    let mut partitions: BTreeMap<TransactionStatus, Vec<TransactionMeta>> = BTreeMap::new();
    for row in rows {
        partitions.entry(row.status).or_default().push(row);
    }
    partitions
}

/// Eligibility condition for a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCriteria {
    pub statuses: Vec<TransactionStatus>,
    /// Rows with `next_action_at` strictly before this are eligible
    pub now_secs: i64,
    /// Rows with `retry_count` at or above this are never claimed
    pub max_retries: i32,
    pub limit: i64,
}

impl ClaimCriteria {
    /// Whether an unleased row satisfies this condition
    #[must_use]
    pub fn matches(&self, row: &TransactionMeta) -> bool {
        row.lock.is_none()
            && self.statuses.contains(&row.status)
            && row.next_action_at.is_some_and(|at| at < self.now_secs)
            && row.retry_count < self.max_retries
    }
}

/// How a release treats `next_action_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextAction {
    #[default]
    Keep,
    Clear,
    At(i64),
}

/// Mutation applied in the same statement that drops a lease
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReleaseUpdate {
    pub status: Option<TransactionStatus>,
    pub next_action: NextAction,
    pub increment_retry: bool,
    pub transaction_hash: Option<String>,
    pub error_code: Option<String>,
}

impl ReleaseUpdate {
    /// Drop the lease without touching anything else
    #[must_use]
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Terminal failure; the row is never scheduled again
    #[must_use]
    pub fn failed(error_code: impl Into<String>) -> Self {
        Self {
            status: Some(TransactionStatus::Failed),
            next_action: NextAction::Clear,
            error_code: Some(error_code.into()),
            ..Self::default()
        }
    }

    /// Re-arm for a later tick, counting the attempt
    #[must_use]
    pub fn retry_at(next_action_at: i64) -> Self {
        Self {
            next_action: NextAction::At(next_action_at),
            increment_retry: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Apply to an in-memory copy of a row
    pub fn apply_to(&self, row: &mut TransactionMeta) {
        row.lock = None;
        if let Some(status) = self.status {
            row.status = status;
        }
        match self.next_action {
            NextAction::Keep => {}
            NextAction::Clear => row.next_action_at = None,
            NextAction::At(at) => row.next_action_at = Some(at),
        }
        if self.increment_retry {
            row.retry_count += 1;
        }
        if let Some(hash) = &self.transaction_hash {
            row.transaction_hash = Some(hash.clone());
        }
        if let Some(code) = &self.error_code {
            row.error_code = Some(code.clone());
        }
        row.updated_at = Utc::now();
    }
}

/// A release of some rows held under one lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub ids: Vec<i64>,
    /// Only release rows still in this status
    pub expected_status: Option<TransactionStatus>,
    pub update: ReleaseUpdate,
}

impl Release {
    #[must_use]
    pub fn new(ids: Vec<i64>, expected_status: TransactionStatus, update: ReleaseUpdate) -> Self {
        Self {
            ids,
            expected_status: Some(expected_status),
            update,
        }
    }

    /// Give rows back exactly as they were claimed
    #[must_use]
    pub fn unchanged(ids: Vec<i64>) -> Self {
        Self {
            ids,
            expected_status: None,
            update: ReleaseUpdate::unchanged(),
        }
    }
}

/// Row written by the execution workflow before any lease exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub transaction_uuid: Uuid,
    pub transaction_hash: Option<String>,
    pub client_id: i64,
    pub chain_id: i64,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub next_action_at: Option<i64>,
    pub error_code: Option<String>,
}

/// Partition of the denormalized transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub client_id: i64,
    pub chain_id: i64,
}

impl ShardKey {
    #[must_use]
    pub fn new(client_id: i64, chain_id: i64) -> Self {
        Self {
            client_id,
            chain_id,
        }
    }
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client_{}_chain_{}", self.client_id, self.chain_id)
    }
}

/// Partial update for a transaction log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogUpdate {
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl TransactionLogUpdate {
    #[must_use]
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status,
            transaction_hash: None,
            error_code: None,
        }
    }

    #[must_use]
    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.transaction_hash = hash;
        self
    }

    #[must_use]
    pub fn with_error_code(mut self, code: Option<String>) -> Self {
        self.error_code = code;
        self
    }
}

/// Denormalized transaction record held in the sharded log store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogRecord {
    pub transaction_uuid: Uuid,
    pub shard: ShardKey,
    pub status: TransactionStatus,
    pub transaction_hash: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    /// Token amount in base units, kept as a decimal string
    pub amount: Option<String>,
    pub error_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Payload of an "execute transaction" broker message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteTransactionMessage {
    pub transaction_uuid: Uuid,
    pub client_id: i64,
    pub chain_id: i64,
    #[serde(default)]
    pub kind: TransactionKind,
    pub from_address: String,
    pub to_address: String,
    pub amount: String,
    /// Signed transaction bytes (0x-prefixed hex) prepared by the signer
    #[serde(default)]
    pub raw_transaction: Option<String>,
}

/// One message handed out by the broker, unacknowledged until acked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub transaction_uuid: Option<Uuid>,
    pub redelivered: bool,
}

/// On-chain state of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainTxState {
    Mined { block_number: u64, success: bool },
    /// Known to the node but not yet in a block
    Pending,
    NotFound,
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus) -> Self {
        Self {
            status: database,
            database,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub r#type: String,
    pub message: String,
}
