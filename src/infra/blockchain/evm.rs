//! EVM JSON-RPC chain client.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::domain::{
    AppError, ChainClient, ChainError, ChainTxState, ConfigError, ExecuteTransactionMessage,
    ValidationError,
};

/// RPC client configuration
#[derive(Debug, Clone)]
pub struct EvmRpcConfig {
    pub timeout: Duration,
}

impl Default for EvmRpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    block_number: Option<String>,
    /// `0x1` on success, `0x0` when reverted
    status: Option<String>,
}

/// Chain access over plain JSON-RPC, one endpoint per chain id
pub struct EvmRpcClient {
    endpoints: HashMap<i64, String>,
    http_client: reqwest::Client,
}

impl EvmRpcClient {
    pub fn new(endpoints: HashMap<i64, String>, config: EvmRpcConfig) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        info!(chains = ?endpoints.keys().collect::<Vec<_>>(), "EVM RPC client configured");
        Ok(Self {
            endpoints,
            http_client,
        })
    }

    /// Build from `CHAIN_RPC_URLS` (`chain_id=url,chain_id=url`)
    pub fn from_env() -> Result<Self, AppError> {
        let raw = env::var("CHAIN_RPC_URLS").unwrap_or_default();
        Self::new(parse_endpoints(&raw)?, EvmRpcConfig::default())
    }

    fn endpoint(&self, chain_id: i64) -> Result<&str, AppError> {
        self.endpoints
            .get(&chain_id)
            .map(String::as_str)
            .ok_or(AppError::Chain(ChainError::UnknownChain(chain_id)))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        chain_id: i64,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, AppError> {
        let url = self.endpoint(chain_id)?;
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .http_client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::Timeout(format!("{} on chain {}", method, chain_id))
                } else {
                    ChainError::NodeUnavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ChainError::NodeUnavailable(format!("HTTP {}", status)).into());
        }
        if !status.is_success() {
            return Err(ChainError::InvalidResponse(format!("HTTP {}", status)).into());
        }

        let body: JsonRpcResponse<T> = response.json().await.map_err(|e| {
            ChainError::InvalidResponse(format!("Failed to parse {} response: {}", method, e))
        })?;

        if let Some(error) = body.error {
            debug!(method, chain_id, message = %error.message, "RPC error");
            return Err(map_rpc_error(&error.message).into());
        }
        Ok(body.result)
    }
}

/// Parse `chain_id=url` pairs separated by commas
pub fn parse_endpoints(raw: &str) -> Result<HashMap<i64, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (chain, url) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                name: "CHAIN_RPC_URLS".to_string(),
                message: format!("expected chain_id=url, got '{}'", pair),
            })?;
            let chain_id = chain
                .trim()
                .parse::<i64>()
                .map_err(|e| ConfigError::InvalidValue {
                    name: "CHAIN_RPC_URLS".to_string(),
                    message: format!("invalid chain id '{}': {}", chain, e),
                })?;
            Ok((chain_id, url.trim().to_string()))
        })
        .collect()
}

/// Classify a node's error message
pub fn map_rpc_error(message: &str) -> ChainError {
    let lower = message.to_lowercase();
    if lower.contains("nonce too low") {
        ChainError::NonceTooLow(message.to_string())
    } else if lower.contains("underpriced") {
        ChainError::ReplacementUnderpriced(message.to_string())
    } else if lower.contains("insufficient funds")
        || lower.contains("intrinsic gas too low")
        || lower.contains("gas required exceeds allowance")
    {
        ChainError::InsufficientGas(message.to_string())
    } else {
        ChainError::Rejected(message.to_string())
    }
}

fn parse_quantity(value: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::InvalidResponse(format!("invalid quantity '{}': {}", value, e)))
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    #[instrument(skip(self))]
    async fn transaction_state(
        &self,
        chain_id: i64,
        transaction_hash: &str,
    ) -> Result<ChainTxState, AppError> {
        let receipt: Option<TransactionReceipt> = self
            .call(chain_id, "eth_getTransactionReceipt", json!([transaction_hash]))
            .await?;

        if let Some(receipt) = receipt {
            if let Some(block) = receipt.block_number.as_deref() {
                return Ok(ChainTxState::Mined {
                    block_number: parse_quantity(block)?,
                    success: receipt.status.as_deref() == Some("0x1"),
                });
            }
        }

        let transaction: Option<Value> = self
            .call(chain_id, "eth_getTransactionByHash", json!([transaction_hash]))
            .await?;
        Ok(match transaction {
            Some(_) => ChainTxState::Pending,
            None => ChainTxState::NotFound,
        })
    }

    #[instrument(skip(self))]
    async fn is_node_healthy(&self, chain_id: i64) -> Result<bool, AppError> {
        match self.call::<String>(chain_id, "eth_blockNumber", json!([])).await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(AppError::Chain(ChainError::NodeUnavailable(_) | ChainError::Timeout(_))) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(
        skip(self, message),
        fields(uuid = %message.transaction_uuid, chain_id = message.chain_id)
    )]
    async fn submit(&self, message: &ExecuteTransactionMessage) -> Result<String, AppError> {
        let raw = message.raw_transaction.as_deref().ok_or_else(|| {
            AppError::Validation(ValidationError::MissingField("raw_transaction".to_string()))
        })?;

        let hash: Option<String> = self
            .call(message.chain_id, "eth_sendRawTransaction", json!([raw]))
            .await?;
        hash.ok_or_else(|| {
            ChainError::InvalidResponse("eth_sendRawTransaction returned no hash".to_string())
                .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        let endpoints =
            parse_endpoints("1=https://eth.example, 137=https://polygon.example").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[&137], "https://polygon.example");
        assert!(parse_endpoints("").unwrap().is_empty());
        assert!(parse_endpoints("mainnet").is_err());
        assert!(parse_endpoints("eth=https://x").is_err());
    }

    #[test]
    fn test_map_rpc_error() {
        assert!(matches!(map_rpc_error("nonce too low"), ChainError::NonceTooLow(_)));
        assert!(matches!(
            map_rpc_error("replacement transaction underpriced"),
            ChainError::ReplacementUnderpriced(_)
        ));
        assert!(matches!(
            map_rpc_error("insufficient funds for gas * price + value"),
            ChainError::InsufficientGas(_)
        ));
        assert!(matches!(map_rpc_error("execution reverted"), ChainError::Rejected(_)));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert!(parse_quantity("0xzz").is_err());
    }
}
