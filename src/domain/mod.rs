//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod lease;
pub mod traits;
pub mod types;

pub use error::{
    AppError, ChainError, ConfigError, DatabaseError, ExternalServiceError, QueueError,
    ValidationError,
};
pub use lease::LeaseId;
pub use traits::{
    ChainClient, LockLeaseStore, MessageHandler, MessagePublisher, MessageSource, ProcessRegistry,
    TransactionLogStore,
};
pub use types::{
    ChainTxState, ClaimCriteria, DEFAULT_MAX_RETRIES, Delivery, ErrorDetail, ErrorResponse,
    ExecuteTransactionMessage, ExecutionRecord, HealthResponse, HealthStatus, NextAction, Release,
    ReleaseUpdate, ShardKey, TransactionKind, TransactionLogRecord, TransactionLogUpdate,
    TransactionMeta, TransactionStatus, partition_by_status,
};
