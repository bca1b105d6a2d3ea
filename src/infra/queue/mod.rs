//! Message broker implementations.

pub mod postgres;

pub use postgres::{PostgresQueue, PostgresQueueConfig};
