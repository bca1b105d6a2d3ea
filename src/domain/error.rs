//! Error types shared by every layer of the orchestrator.

use thiserror::Error;

use super::types::TransactionStatus;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("External service error: {0}")]
    ExternalService(#[from] ExternalServiceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A claimed batch no longer matches what its handler expects.
    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// Relational store failures
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid column value: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Duplicate(db_err.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Decode(err.to_string())
            }
            _ => Self::Query(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(DatabaseError::from(err))
    }
}

/// Failures reported by a chain node or while talking to one
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("RPC timeout: {0}")]
    Timeout(String),

    #[error("Insufficient gas: {0}")]
    InsufficientGas(String),

    #[error("Nonce too low: {0}")]
    NonceTooLow(String),

    #[error("Replacement transaction underpriced: {0}")]
    ReplacementUnderpriced(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("No RPC endpoint configured for chain {0}")]
    UnknownChain(i64),
}

impl ChainError {
    /// Whether the failure is worth another attempt on a later lease
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::Rejected(_) | Self::UnknownChain(_) | Self::InvalidResponse(_)
        )
    }

    /// Status a transaction is parked in after a submission attempt fails this way
    #[must_use]
    pub fn parked_status(&self) -> TransactionStatus {
        match self {
            Self::NodeUnavailable(_) | Self::Timeout(_) => TransactionStatus::GethDown,
            Self::InsufficientGas(_) => TransactionStatus::InsufficientGas,
            Self::NonceTooLow(_) => TransactionStatus::NonceTooLow,
            Self::ReplacementUnderpriced(_) => TransactionStatus::ReplacementTxUnderPriced,
            Self::Rejected(_) | Self::UnknownChain(_) | Self::InvalidResponse(_) => {
                TransactionStatus::Failed
            }
        }
    }

    /// Short machine-readable code stored on the transaction record
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeUnavailable(_) => "node_unavailable",
            Self::Timeout(_) => "rpc_timeout",
            Self::InsufficientGas(_) => "insufficient_gas",
            Self::NonceTooLow(_) => "nonce_too_low",
            Self::ReplacementUnderpriced(_) => "replacement_underpriced",
            Self::Rejected(_) => "rejected",
            Self::InvalidResponse(_) => "invalid_rpc_response",
            Self::UnknownChain(_) => "unknown_chain",
        }
    }
}

/// Message broker failures
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed message {tag}: {reason}")]
    Malformed { tag: i64, reason: String },

    #[error("Ack failed for delivery {0}")]
    AckFailed(i64),
}

/// Failures of best-effort downstream stores (the sharded transaction log)
#[derive(Debug, Error)]
pub enum ExternalServiceError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Startup configuration failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Input validation failures
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_parked_status() {
        assert_eq!(
            ChainError::NodeUnavailable("down".into()).parked_status(),
            TransactionStatus::GethDown
        );
        assert_eq!(
            ChainError::Timeout("slow".into()).parked_status(),
            TransactionStatus::GethDown
        );
        assert_eq!(
            ChainError::NonceTooLow("n".into()).parked_status(),
            TransactionStatus::NonceTooLow
        );
        assert_eq!(
            ChainError::ReplacementUnderpriced("r".into()).parked_status(),
            TransactionStatus::ReplacementTxUnderPriced
        );
        assert_eq!(
            ChainError::Rejected("bad".into()).parked_status(),
            TransactionStatus::Failed
        );
    }

    #[test]
    fn test_chain_error_transience() {
        assert!(ChainError::InsufficientGas("gas".into()).is_transient());
        assert!(ChainError::NodeUnavailable("down".into()).is_transient());
        assert!(!ChainError::Rejected("bad".into()).is_transient());
        assert!(!ChainError::UnknownChain(7).is_transient());
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err = DatabaseError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[test]
    fn test_error_display_includes_category() {
        let err = AppError::Consistency("status drifted".to_string());
        assert_eq!(err.to_string(), "Consistency violation: status drifted");
    }
}
