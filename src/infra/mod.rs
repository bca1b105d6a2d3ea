//! Infrastructure layer implementations.

pub mod blockchain;
pub mod database;
pub mod queue;
pub mod txlog;

pub use blockchain::{EvmRpcClient, EvmRpcConfig};
pub use database::{PostgresClient, PostgresConfig};
pub use queue::{PostgresQueue, PostgresQueueConfig};
pub use txlog::PostgresTransactionLogStore;
