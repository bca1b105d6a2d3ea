//! Sharded transaction log implementations.

pub mod postgres;

pub use postgres::PostgresTransactionLogStore;
