//! Blockchain client implementations.

pub mod evm;

pub use evm::{EvmRpcClient, EvmRpcConfig, map_rpc_error, parse_endpoints};
