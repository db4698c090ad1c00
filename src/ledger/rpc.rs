//! Minimal Ethereum JSON-RPC client used by the anchor service.

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time;

/// Errors surfaced by a single JSON-RPC round trip.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("rpc request timed out after {0:?}")]
    /// The call exceeded its deadline.
    Timeout(Duration),
    #[error("rpc transport error: {0}")]
    /// Connection, TLS or HTTP level failure.
    Transport(String),
    #[error("rpc node error {code}: {message}")]
    /// The node answered with a JSON-RPC error object.
    Node {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the node.
        message: String,
    },
    #[error("rpc decode error: {0}")]
    /// Response did not have the expected shape.
    Decode(String),
}

impl RpcError {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Node { code, .. } => *code == -32000 || *code == -32603,
            Self::Decode(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Receipt fields the anchor service cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    /// Transaction hash.
    pub transaction_hash: String,
    /// Block that included the transaction.
    pub block_number: u64,
    /// `true` when execution succeeded (status `0x1`).
    pub success: bool,
}

/// Log entry returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Indexed topics.
    pub topics: Vec<String>,
    /// Non-indexed data.
    pub data: String,
    /// Block number, when the node reports one.
    pub block_number: Option<u64>,
    /// Transaction hash, when the node reports one.
    pub transaction_hash: Option<String>,
}

/// JSON-RPC client bound to a single node URL with a per-call timeout.
#[derive(Debug)]
pub struct RpcClient {
    url: String,
    client: Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Builds a client; the timeout applies to every call independently.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|err| RpcError::Transport(format!("client error: {err}")))?;
        Ok(Self {
            url: url.into(),
            client,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Node URL this client talks to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Performs one JSON-RPC call and returns the `result` member.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let request = async {
            let resp = self
                .client
                .post(&self.url)
                .json(&payload)
                .send()
                .await
                .map_err(|err| {
                    if err.is_timeout() {
                        RpcError::Timeout(self.timeout)
                    } else {
                        RpcError::Transport(format!("{method} request failed: {err}"))
                    }
                })?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(RpcError::Transport(format!("{method} status {status}: {body}")));
            }
            resp.json::<RpcEnvelope>()
                .await
                .map_err(|err| RpcError::Decode(format!("{method} decode failed: {err}")))
        };
        let envelope = time::timeout(self.timeout, request)
            .await
            .map_err(|_| RpcError::Timeout(self.timeout))??;
        if let Some(err) = envelope.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    /// `eth_chainId`.
    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        let value = self.call("eth_chainId", json!([])).await?;
        parse_quantity(&value)
    }

    /// `eth_blockNumber`.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let value = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&value)
    }

    /// `net_version`, parsed as a number.
    pub async fn network_id(&self) -> Result<u64, RpcError> {
        let value = self.call("net_version", json!([])).await?;
        match &value {
            Value::String(text) if !text.starts_with("0x") => text
                .parse::<u64>()
                .map_err(|err| RpcError::Decode(format!("net_version: {err}"))),
            _ => parse_quantity(&value),
        }
    }

    /// `eth_getTransactionCount(address, "pending")`.
    pub async fn pending_nonce(&self, address: &str) -> Result<u64, RpcError> {
        let value = self
            .call("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_quantity(&value)
    }

    /// `eth_getTransactionCount` at `latest`: nonces consumed by mined transactions.
    pub async fn confirmed_nonce(&self, address: &str) -> Result<u64, RpcError> {
        let value = self
            .call("eth_getTransactionCount", json!([address, "latest"]))
            .await?;
        parse_quantity(&value)
    }

    /// `eth_gasPrice`.
    pub async fn gas_price(&self) -> Result<u128, RpcError> {
        let value = self.call("eth_gasPrice", json!([])).await?;
        parse_quantity_u128(&value)
    }

    /// `eth_maxPriorityFeePerGas`; nodes without the method fall back to `default`.
    pub async fn max_priority_fee(&self, default: u128) -> Result<u128, RpcError> {
        match self.call("eth_maxPriorityFeePerGas", json!([])).await {
            Ok(value) => parse_quantity_u128(&value),
            Err(RpcError::Node { code: -32601, .. }) => Ok(default),
            Err(err) => Err(err),
        }
    }

    /// `eth_sendRawTransaction`, returning the node-reported hash.
    pub async fn send_raw_transaction(&self, raw_hex: &str) -> Result<String, RpcError> {
        let value = self.call("eth_sendRawTransaction", json!([raw_hex])).await?;
        value
            .as_str()
            .map(|s| s.to_ascii_lowercase())
            .ok_or_else(|| RpcError::Decode("eth_sendRawTransaction returned no hash".into()))
    }

    /// `eth_getTransactionReceipt`; `None` while the transaction is pending.
    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, RpcError> {
        let value = self.call("eth_getTransactionReceipt", json!([hash])).await?;
        if value.is_null() {
            return Ok(None);
        }
        let block_number = value
            .get("blockNumber")
            .filter(|v| !v.is_null())
            .map(parse_quantity)
            .transpose()?;
        let Some(block_number) = block_number else {
            return Ok(None);
        };
        let status = value
            .get("status")
            .map(parse_quantity)
            .transpose()?
            .unwrap_or(1);
        let transaction_hash = value
            .get("transactionHash")
            .and_then(Value::as_str)
            .unwrap_or(hash)
            .to_ascii_lowercase();
        Ok(Some(TxReceipt {
            transaction_hash,
            block_number,
            success: status == 1,
        }))
    }

    /// `eth_call` against `to` at the latest block, returning the raw bytes.
    pub async fn eth_call(&self, to: &str, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let value = self
            .call(
                "eth_call",
                json!([{"to": to, "data": format!("0x{}", hex::encode(data))}, "latest"]),
            )
            .await?;
        let text = value
            .as_str()
            .ok_or_else(|| RpcError::Decode("eth_call result is not a string".into()))?;
        decode_hex_prefixed(text)
    }

    /// `eth_getLogs` for one contract and a topic filter, over all blocks.
    pub async fn get_logs(
        &self,
        address: &str,
        topics: Vec<Value>,
    ) -> Result<Vec<LogEntry>, RpcError> {
        let value = self
            .call(
                "eth_getLogs",
                json!([{
                    "address": address,
                    "fromBlock": "0x0",
                    "toBlock": "latest",
                    "topics": topics,
                }]),
            )
            .await?;
        let items = value
            .as_array()
            .ok_or_else(|| RpcError::Decode("eth_getLogs result is not an array".into()))?;
        items.iter().map(parse_log).collect()
    }
}

fn parse_log(value: &Value) -> Result<LogEntry, RpcError> {
    let topics = value
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::Decode("log without topics".into()))?
        .iter()
        .filter_map(Value::as_str)
        .map(|s| s.to_ascii_lowercase())
        .collect();
    let data = value
        .get("data")
        .and_then(Value::as_str)
        .unwrap_or("0x")
        .to_string();
    let block_number = value
        .get("blockNumber")
        .filter(|v| !v.is_null())
        .map(parse_quantity)
        .transpose()?;
    let transaction_hash = value
        .get("transactionHash")
        .and_then(Value::as_str)
        .map(|s| s.to_ascii_lowercase());
    Ok(LogEntry {
        topics,
        data,
        block_number,
        transaction_hash,
    })
}

/// Parses a JSON-RPC quantity (`"0x1a"` or a bare number) into `u64`.
pub fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    let wide = parse_quantity_u128(value)?;
    u64::try_from(wide).map_err(|_| RpcError::Decode(format!("quantity overflows u64: {wide}")))
}

/// Parses a JSON-RPC quantity into `u128`.
pub fn parse_quantity_u128(value: &Value) -> Result<u128, RpcError> {
    if let Some(v) = value.as_u64() {
        return Ok(u128::from(v));
    }
    let text = value
        .as_str()
        .ok_or_else(|| RpcError::Decode(format!("expected quantity, found {value}")))?;
    let raw = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| RpcError::Decode(format!("quantity missing 0x prefix: {text}")))?;
    if raw.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(raw, 16).map_err(|err| RpcError::Decode(format!("bad quantity: {err}")))
}

/// Decodes `0x`-prefixed hex data.
pub fn decode_hex_prefixed(input: &str) -> Result<Vec<u8>, RpcError> {
    let trimmed = input.trim();
    let raw = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| RpcError::Decode("hex payload must start with 0x".into()))?;
    hex::decode(raw).map_err(|err| RpcError::Decode(format!("invalid hex payload: {err}")))
}

/// Formats a `u64` as a JSON-RPC quantity.
pub fn to_quantity(value: u64) -> String {
    format!("0x{value:x}")
}
