//! Lease-based recovery scheduler and bounded queue consumer for blockchain
//! token transactions.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
