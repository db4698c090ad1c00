//! Single-process EVM JSON-RPC node hosting one anchor contract.
//!
//! Accepts signed EIP-1559 `storeHash` transactions, mines each into its own
//! block (or holds them in a mempool until [`DevnetHandle::mine`] when
//! automine is off), answers `verifyHash` calls and serves `HashStored` logs.  Anchoring a
//! digest twice reverts (receipt status `0x0`).  State lives in memory and is
//! optionally mirrored to a JSON file after every accepted transaction.

use crate::ledger::rpc::to_quantity;
use crate::ledger::tx::{self, Address};
use blake2::digest::{consts::U32, Digest as BlakeDigest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

const MAX_HEADER_BYTES: usize = 32 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_GAS_PRICE: u64 = 1_000_000_000;
const DEFAULT_PRIORITY_FEE: u64 = 100_000_000;
const STORE_HASH_GAS: u64 = 45_000;
const TRANSFER_GAS: u64 = 21_000;

/// Address of the anchor contract on a fresh devnet.
pub const DEFAULT_CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
/// Chain id used when none is supplied.
pub const DEFAULT_CHAIN_ID: u64 = 31_337;

type Blake2b256 = blake2::Blake2b<U32>;

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
    id: Option<Value>,
}

#[derive(Debug)]
struct NodeError {
    code: i64,
    message: String,
}

impl NodeError {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32000,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("method not found: {method}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredReceipt {
    transaction_hash: String,
    from: String,
    to: String,
    block_number: u64,
    status: u8,
    gas_used: u64,
    logs: Vec<StoredLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: u64,
    transaction_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAnchor {
    timestamp: u64,
    sender: String,
    block_number: u64,
    transaction_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DevnetState {
    latest_block: u64,
    nonces: HashMap<String, u64>,
    receipts: HashMap<String, StoredReceipt>,
    anchors: HashMap<String, StoredAnchor>,
    #[serde(default)]
    mempool: Vec<PooledTx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PooledTx {
    hash: String,
    from: String,
    raw_hex: String,
}

/// Devnet listener configuration.
#[derive(Debug, Clone)]
pub struct DevnetConfig {
    /// Socket address to bind; port `0` picks a free port.
    pub listen: SocketAddr,
    /// Chain id reported by `eth_chainId` and required of transactions.
    pub chain_id: u64,
    /// Address the anchor contract lives at.
    pub contract: Address,
    /// Optional JSON file the chain state is persisted to.
    pub state_path: Option<PathBuf>,
    /// Max request read timeout.
    pub request_timeout: Duration,
    /// Mine each transaction on arrival. When off, transactions wait in the
    /// mempool until [`DevnetHandle::mine`].
    pub automine: bool,
}

impl DevnetConfig {
    /// Config with the default contract address and no persistence.
    pub fn new(listen: SocketAddr, chain_id: u64) -> Self {
        let contract = Address::parse(DEFAULT_CONTRACT).unwrap_or(Address([0u8; 20]));
        Self {
            listen,
            chain_id,
            contract,
            state_path: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            automine: true,
        }
    }

    /// Persists chain state to `path`.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }
}

#[derive(Debug)]
struct Node {
    cfg: DevnetConfig,
    contract: String,
    automine: AtomicBool,
    state: Mutex<DevnetState>,
}

/// A devnet running on a background task.  Dropping it stops the node.
#[derive(Debug)]
pub struct DevnetHandle {
    addr: SocketAddr,
    contract: Address,
    chain_id: u64,
    node: Arc<Node>,
    task: JoinHandle<()>,
}

impl DevnetHandle {
    /// Bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://` URL clients should use.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Anchor contract address.
    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Chain id served by the node.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Switches between mining on arrival and holding transactions in the
    /// mempool.
    pub fn set_automine(&self, enabled: bool) {
        self.node.automine.store(enabled, Ordering::SeqCst);
    }

    /// Mines every pooled transaction and returns how many were mined.
    pub fn mine(&self) -> io::Result<usize> {
        self.node
            .mine_pending()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.message))
    }

    /// Distinct transactions accepted so far, mined or pooled.
    pub fn transaction_count(&self) -> io::Result<usize> {
        let state = self
            .node
            .lock()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.message))?;
        Ok(state.receipts.len() + state.mempool.len())
    }

    /// Stops accepting connections.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for DevnetHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Binds and serves on a background task, returning once the socket is bound.
pub async fn spawn_devnet(cfg: DevnetConfig) -> io::Result<DevnetHandle> {
    let listener = TcpListener::bind(cfg.listen).await?;
    let addr = listener.local_addr()?;
    let contract = cfg.contract;
    let chain_id = cfg.chain_id;
    let node = Arc::new(Node::open(cfg)?);
    info!(evt = "DEVNET_LISTEN", %addr, chain_id, contract = %contract, "devnet listening");
    let served = Arc::clone(&node);
    let task = tokio::spawn(async move {
        if let Err(err) = accept_loop(listener, served).await {
            warn!(evt = "DEVNET_STOPPED", error = %err, "devnet accept loop ended");
        }
    });
    Ok(DevnetHandle {
        addr,
        contract,
        chain_id,
        node,
        task,
    })
}

/// Serves requests until the process exits.
pub async fn run_devnet(cfg: DevnetConfig) -> io::Result<()> {
    let listener = TcpListener::bind(cfg.listen).await?;
    info!(
        evt = "DEVNET_LISTEN",
        addr = %listener.local_addr()?,
        chain_id = cfg.chain_id,
        contract = %cfg.contract,
        "devnet listening"
    );
    let node = Arc::new(Node::open(cfg)?);
    accept_loop(listener, node).await
}

async fn accept_loop(listener: TcpListener, node: Arc<Node>) -> io::Result<()> {
    loop {
        let (mut stream, _) = listener.accept().await?;
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(&mut stream, &node).await {
                debug!(evt = "DEVNET_CONN_ERR", error = %err, "devnet connection error");
            }
        });
    }
}

async fn handle_connection(stream: &mut TcpStream, node: &Node) -> io::Result<()> {
    let req = match read_http_request(
        stream,
        MAX_HEADER_BYTES,
        MAX_BODY_BYTES,
        node.cfg.request_timeout,
    )
    .await
    {
        Ok(req) => req,
        Err(err) => {
            let body = error_body(Value::Null, -32700, &format!("parse error: {err}"));
            let _ = stream
                .write_all(&build_json_response("400 Bad Request", &body))
                .await;
            let _ = stream.shutdown().await;
            return Ok(());
        }
    };

    let method = req.method.to_ascii_uppercase();
    let (status, body) = if method == "GET" && req.path == "/healthz" {
        let body = json!({
            "status": "ok",
            "service": "medledger-devnet",
            "chain_id": node.cfg.chain_id,
        })
        .to_string();
        ("200 OK", body)
    } else if method != "POST" {
        (
            "405 Method Not Allowed",
            error_body(Value::Null, -32600, "invalid request method"),
        )
    } else {
        match serde_json::from_slice::<JsonRpcRequest>(&req.body) {
            Ok(parsed) => {
                let id = parsed.id.clone().unwrap_or(Value::Null);
                let body = match node.dispatch(&parsed) {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string(),
                    Err(err) => error_body(id, err.code, &err.message),
                };
                ("200 OK", body)
            }
            Err(err) => (
                "400 Bad Request",
                error_body(Value::Null, -32700, &format!("parse error: {err}")),
            ),
        }
    };
    stream.write_all(&build_json_response(status, &body)).await?;
    stream.shutdown().await
}

fn error_body(id: Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
    .to_string()
}

impl Node {
    fn open(cfg: DevnetConfig) -> io::Result<Self> {
        let state = load_state(cfg.state_path.as_deref())?;
        Ok(Self {
            contract: cfg.contract.to_string(),
            automine: AtomicBool::new(cfg.automine),
            cfg,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DevnetState>, NodeError> {
        self.state
            .lock()
            .map_err(|_| NodeError::internal("devnet state lock poisoned"))
    }

    fn dispatch(&self, req: &JsonRpcRequest) -> Result<Value, NodeError> {
        match req.method.as_str() {
            "web3_clientVersion" => Ok(Value::String(format!(
                "medledger-devnet/{}",
                env!("CARGO_PKG_VERSION")
            ))),
            "net_version" => Ok(Value::String(self.cfg.chain_id.to_string())),
            "eth_chainId" => Ok(Value::String(to_quantity(self.cfg.chain_id))),
            "eth_blockNumber" => Ok(Value::String(to_quantity(self.lock()?.latest_block))),
            "eth_gasPrice" => Ok(Value::String(to_quantity(DEFAULT_GAS_PRICE))),
            "eth_maxPriorityFeePerGas" => Ok(Value::String(to_quantity(DEFAULT_PRIORITY_FEE))),
            "eth_getTransactionCount" => {
                let address = param_string(&req.params, 0)
                    .and_then(|a| tx::normalize_address(&a))
                    .ok_or_else(|| {
                        NodeError::invalid_params("eth_getTransactionCount expects address param")
                    })?;
                let state = self.lock()?;
                let nonce = match param_string(&req.params, 1).as_deref() {
                    Some("pending") => pending_nonce(&state, &address),
                    _ => confirmed_nonce(&state, &address),
                };
                Ok(Value::String(to_quantity(nonce)))
            }
            "eth_getTransactionReceipt" => self.receipt(req),
            "eth_sendRawTransaction" => self.send_raw_transaction(req),
            "eth_call" => self.call(req),
            "eth_getLogs" => self.logs(req),
            other => Err(NodeError::method_not_found(other)),
        }
    }

    fn receipt(&self, req: &JsonRpcRequest) -> Result<Value, NodeError> {
        let hash = param_string(&req.params, 0)
            .ok_or_else(|| NodeError::invalid_params("eth_getTransactionReceipt expects tx hash"))?;
        let state = self.lock()?;
        let Some(receipt) = state.receipts.get(&hash.to_ascii_lowercase()) else {
            return Ok(Value::Null);
        };
        let logs = receipt.logs.iter().map(log_to_rpc).collect::<Vec<_>>();
        Ok(json!({
            "transactionHash": receipt.transaction_hash,
            "transactionIndex": "0x0",
            "blockHash": synthetic_block_hash(receipt.block_number),
            "blockNumber": to_quantity(receipt.block_number),
            "from": receipt.from,
            "to": receipt.to,
            "cumulativeGasUsed": to_quantity(receipt.gas_used),
            "gasUsed": to_quantity(receipt.gas_used),
            "effectiveGasPrice": to_quantity(DEFAULT_GAS_PRICE),
            "contractAddress": Value::Null,
            "logs": logs,
            "type": "0x2",
            "status": to_quantity(u64::from(receipt.status)),
        }))
    }

    fn send_raw_transaction(&self, req: &JsonRpcRequest) -> Result<Value, NodeError> {
        let raw_hex = param_string(&req.params, 0)
            .ok_or_else(|| NodeError::invalid_params("eth_sendRawTransaction expects hex payload"))?;
        let raw = decode_hex_prefixed(&raw_hex)?;
        let recovered =
            tx::decode_signed_tx(&raw).map_err(|err| NodeError::invalid_params(err.to_string()))?;
        if recovered.tx.chain_id != self.cfg.chain_id {
            return Err(NodeError::invalid_params(format!(
                "chain id mismatch: expected {}, got {}",
                self.cfg.chain_id, recovered.tx.chain_id
            )));
        }
        let from = recovered.from.to_string();

        let mut state = self.lock()?;
        if state.receipts.contains_key(&recovered.hash)
            || state.mempool.iter().any(|p| p.hash == recovered.hash)
        {
            return Ok(Value::String(recovered.hash));
        }
        let expected_nonce = pending_nonce(&state, &from);
        if recovered.tx.nonce != expected_nonce {
            return Err(NodeError::internal(format!(
                "nonce mismatch: expected {expected_nonce}, got {}",
                recovered.tx.nonce
            )));
        }

        debug!(evt = "DEVNET_POOLED", tx = %recovered.hash, nonce = expected_nonce, "transaction pooled");
        state.mempool.push(PooledTx {
            hash: recovered.hash.clone(),
            from,
            raw_hex,
        });
        if self.automine.load(Ordering::SeqCst) {
            self.drain_mempool(&mut state)?;
        }
        save_state(self.cfg.state_path.as_deref(), &state)?;
        Ok(Value::String(recovered.hash))
    }

    /// Mines `recovered` into the next block.
    fn execute(&self, state: &mut DevnetState, recovered: &tx::RecoveredTx) {
        let from = recovered.from.to_string();
        let to = recovered.tx.to.to_string();
        let block_number = state.latest_block.saturating_add(1);
        let mut receipt = StoredReceipt {
            transaction_hash: recovered.hash.clone(),
            from: from.clone(),
            to: to.clone(),
            block_number,
            status: 1,
            gas_used: TRANSFER_GAS,
            logs: Vec::new(),
        };

        if to == self.contract {
            receipt.gas_used = STORE_HASH_GAS;
            match tx::decode_store_hash(&recovered.tx.input) {
                Ok((digest, timestamp)) => {
                    let key = format!("0x{}", hex::encode(digest));
                    if state.anchors.contains_key(&key) {
                        receipt.status = 0;
                        info!(evt = "DEVNET_REVERT", digest = %key, tx = %recovered.hash, "digest already anchored");
                    } else {
                        state.anchors.insert(
                            key.clone(),
                            StoredAnchor {
                                timestamp,
                                sender: from.clone(),
                                block_number,
                                transaction_hash: recovered.hash.clone(),
                            },
                        );
                        receipt.logs.push(StoredLog {
                            address: self.contract.clone(),
                            topics: vec![
                                format!("0x{}", hex::encode(*tx::HASH_STORED_TOPIC)),
                                key.clone(),
                                format!("0x{}", hex::encode(tx::address_topic(&recovered.from))),
                            ],
                            data: format!("0x{}", hex::encode(tx::u256_word(timestamp))),
                            block_number,
                            transaction_hash: recovered.hash.clone(),
                        });
                        info!(evt = "DEVNET_ANCHOR", digest = %key, block = block_number, tx = %recovered.hash, "digest anchored");
                    }
                }
                Err(err) => {
                    receipt.status = 0;
                    debug!(evt = "DEVNET_REVERT", error = %err, "unknown contract call");
                }
            }
        }

        state.latest_block = block_number;
        state
            .nonces
            .insert(from, recovered.tx.nonce.saturating_add(1));
        state.receipts.insert(recovered.hash.clone(), receipt);
    }

    /// Mines every pooled transaction in submission order.
    fn mine_pending(&self) -> Result<usize, NodeError> {
        let mut state = self.lock()?;
        let mined = self.drain_mempool(&mut state)?;
        save_state(self.cfg.state_path.as_deref(), &state)?;
        Ok(mined)
    }

    fn drain_mempool(&self, state: &mut DevnetState) -> Result<usize, NodeError> {
        let pooled = std::mem::take(&mut state.mempool);
        for entry in &pooled {
            let raw = decode_hex_prefixed(&entry.raw_hex)?;
            let recovered = tx::decode_signed_tx(&raw)
                .map_err(|err| NodeError::internal(err.to_string()))?;
            self.execute(state, &recovered);
        }
        Ok(pooled.len())
    }

    fn call(&self, req: &JsonRpcRequest) -> Result<Value, NodeError> {
        let call = req
            .params
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| NodeError::invalid_params("eth_call expects a call object"))?;
        let to = call
            .get("to")
            .and_then(Value::as_str)
            .and_then(tx::normalize_address)
            .ok_or_else(|| NodeError::invalid_params("eth_call expects a `to` address"))?;
        if to != self.contract {
            return Ok(Value::String("0x".into()));
        }
        let data = call
            .get("data")
            .or_else(|| call.get("input"))
            .and_then(Value::as_str)
            .unwrap_or("0x");
        let data = decode_hex_prefixed(data)?;
        let digest = tx::decode_verify_hash_call(&data).map_err(|err| NodeError {
            code: 3,
            message: format!("execution reverted: {err}"),
        })?;
        let key = format!("0x{}", hex::encode(digest));
        let state = self.lock()?;
        let result = match state.anchors.get(&key) {
            Some(anchor) => tx::encode_verify_result(true, anchor.timestamp),
            None => tx::encode_verify_result(false, 0),
        };
        Ok(Value::String(format!("0x{}", hex::encode(result))))
    }

    fn logs(&self, req: &JsonRpcRequest) -> Result<Value, NodeError> {
        let filter = req
            .params
            .as_array()
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or_else(|| json!({}));
        let address = filter
            .get("address")
            .and_then(Value::as_str)
            .and_then(tx::normalize_address);
        let wanted = filter
            .get("topics")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let state = self.lock()?;
        let from_block = block_param(filter.get("fromBlock"), 0, state.latest_block);
        let to_block = block_param(filter.get("toBlock"), state.latest_block, state.latest_block);

        let mut matched = state
            .receipts
            .values()
            .filter(|receipt| receipt.block_number >= from_block && receipt.block_number <= to_block)
            .flat_map(|receipt| receipt.logs.iter())
            .filter(|log| address.as_ref().map_or(true, |a| *a == log.address))
            .filter(|log| topics_match(&wanted, &log.topics))
            .collect::<Vec<_>>();
        matched.sort_by_key(|log| log.block_number);
        Ok(Value::Array(matched.into_iter().map(log_to_rpc).collect()))
    }
}

fn topics_match(wanted: &[Value], topics: &[String]) -> bool {
    wanted.iter().enumerate().all(|(idx, want)| match want {
        Value::Null => true,
        Value::String(topic) => topics
            .get(idx)
            .is_some_and(|t| t.eq_ignore_ascii_case(topic)),
        Value::Array(options) => topics.get(idx).is_some_and(|t| {
            options
                .iter()
                .filter_map(Value::as_str)
                .any(|o| o.eq_ignore_ascii_case(t))
        }),
        _ => false,
    })
}

fn block_param(value: Option<&Value>, default: u64, latest: u64) -> u64 {
    let Some(text) = value.and_then(Value::as_str) else {
        return default;
    };
    let lower = text.trim().to_ascii_lowercase();
    if matches!(lower.as_str(), "latest" | "pending" | "safe" | "finalized") {
        return latest;
    }
    if lower == "earliest" {
        return 0;
    }
    let raw = lower.strip_prefix("0x").unwrap_or(&lower);
    u64::from_str_radix(raw, 16).unwrap_or(default)
}

fn log_to_rpc(log: &StoredLog) -> Value {
    json!({
        "address": log.address,
        "topics": log.topics,
        "data": log.data,
        "blockNumber": to_quantity(log.block_number),
        "blockHash": synthetic_block_hash(log.block_number),
        "transactionHash": log.transaction_hash,
        "transactionIndex": "0x0",
        "logIndex": "0x0",
        "removed": false,
    })
}

fn load_state(path: Option<&Path>) -> io::Result<DevnetState> {
    let Some(path) = path else {
        return Ok(DevnetState::default());
    };
    if !path.exists() {
        return Ok(DevnetState::default());
    }
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("failed to decode devnet state: {err}"),
        )
    })
}

fn confirmed_nonce(state: &DevnetState, address: &str) -> u64 {
    state.nonces.get(address).copied().unwrap_or(0)
}

fn pending_nonce(state: &DevnetState, address: &str) -> u64 {
    let pooled = state.mempool.iter().filter(|p| p.from == address).count() as u64;
    confirmed_nonce(state, address).saturating_add(pooled)
}

fn save_state(path: Option<&Path>, state: &DevnetState) -> Result<(), NodeError> {
    let Some(path) = path else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| NodeError::internal(format!("failed to create state dir: {err}")))?;
    }
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|err| NodeError::internal(format!("failed to encode devnet state: {err}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|err| NodeError::internal(format!("failed to write devnet state: {err}")))
}

fn decode_hex_prefixed(input: &str) -> Result<Vec<u8>, NodeError> {
    let raw = input
        .trim()
        .strip_prefix("0x")
        .ok_or_else(|| NodeError::invalid_params("hex payload must start with 0x"))?;
    hex::decode(raw).map_err(|err| NodeError::invalid_params(format!("invalid hex payload: {err}")))
}

fn synthetic_block_hash(number: u64) -> String {
    let mut payload = b"medledger-devnet-block-v1:".to_vec();
    payload.extend_from_slice(&number.to_be_bytes());
    let mut hasher = Blake2b256::new();
    hasher.update(&payload);
    let digest: [u8; 32] = hasher.finalize().into();
    format!("0x{}", hex::encode(digest))
}

fn param_string(params: &Value, index: usize) -> Option<String> {
    params
        .as_array()
        .and_then(|arr| arr.get(index))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

async fn read_http_request(
    stream: &mut TcpStream,
    max_header_bytes: usize,
    max_body_bytes: usize,
    timeout: Duration,
) -> io::Result<HttpRequest> {
    let mut buf = Vec::new();
    let mut header_end = None;
    loop {
        let mut tmp = [0u8; 1024];
        let n = time::timeout(timeout, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            header_end = Some(pos + 4);
            break;
        }
        if buf.len() > max_header_bytes {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header too large"));
        }
    }

    let end = header_end
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "malformed request"))?;
    let header_str = str::from_utf8(&buf[..end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header"))?;
    let mut lines = header_str.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();
    let mut content_len = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_len = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_len > max_body_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "content-length exceeds limit",
        ));
    }

    let mut body = buf[end..].to_vec();
    while body.len() < content_len {
        let mut tmp = vec![0u8; (content_len - body.len()).min(8192)];
        let n = time::timeout(timeout, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    if body.len() < content_len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "incomplete request body",
        ));
    }
    Ok(HttpRequest { method, path, body })
}

fn build_json_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::rpc::RpcClient;
    use crate::ledger::tx::{AdminKey, Eip1559Tx};

    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn temp_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("medledger_devnet_{name}_{nanos}.json"))
    }

    fn store_tx(handle: &DevnetHandle, nonce: u64, digest: [u8; 32]) -> String {
        let key = AdminKey::from_hex(DEV_KEY).unwrap();
        let tx = Eip1559Tx {
            chain_id: handle.chain_id(),
            nonce,
            max_priority_fee_per_gas: 1,
            max_fee_per_gas: 2_000_000_000,
            gas_limit: 120_000,
            to: handle.contract(),
            value: 0,
            input: tx::encode_store_hash(&digest, 1_700_000_000),
        };
        tx.sign(&key).unwrap().raw_hex()
    }

    async fn spawn(state: Option<PathBuf>) -> DevnetHandle {
        let mut cfg = DevnetConfig::new("127.0.0.1:0".parse().unwrap(), DEFAULT_CHAIN_ID);
        cfg.state_path = state;
        spawn_devnet(cfg).await.unwrap()
    }

    #[tokio::test]
    async fn store_then_verify_then_duplicate_reverts() {
        let handle = spawn(None).await;
        let client = RpcClient::new(handle.url(), Duration::from_secs(5)).unwrap();
        assert_eq!(client.chain_id().await.unwrap(), DEFAULT_CHAIN_ID);

        let digest = [7u8; 32];
        let contract = handle.contract().to_string();
        let before = client
            .eth_call(&contract, &tx::encode_verify_hash(&digest))
            .await
            .unwrap();
        assert_eq!(tx::decode_verify_result(&before).unwrap(), (false, 0));

        let hash = client
            .send_raw_transaction(&store_tx(&handle, 0, digest))
            .await
            .unwrap();
        let receipt = client.transaction_receipt(&hash).await.unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.block_number, 1);

        let after = client
            .eth_call(&contract, &tx::encode_verify_hash(&digest))
            .await
            .unwrap();
        assert_eq!(
            tx::decode_verify_result(&after).unwrap(),
            (true, 1_700_000_000)
        );

        let dup = client
            .send_raw_transaction(&store_tx(&handle, 1, digest))
            .await
            .unwrap();
        let receipt = client.transaction_receipt(&dup).await.unwrap().unwrap();
        assert!(!receipt.success);

        let logs = client
            .get_logs(
                &contract,
                vec![
                    json!(format!("0x{}", hex::encode(*tx::HASH_STORED_TOPIC))),
                    json!(format!("0x{}", hex::encode(digest))),
                ],
            )
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].transaction_hash.as_deref(), Some(hash.as_str()));
    }

    #[tokio::test]
    async fn nonce_gap_rejected() {
        let handle = spawn(None).await;
        let client = RpcClient::new(handle.url(), Duration::from_secs(5)).unwrap();
        let err = client
            .send_raw_transaction(&store_tx(&handle, 5, [1u8; 32]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nonce mismatch"));
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let path = temp_path("restart");
        {
            let handle = spawn(Some(path.clone())).await;
            let client = RpcClient::new(handle.url(), Duration::from_secs(5)).unwrap();
            client
                .send_raw_transaction(&store_tx(&handle, 0, [9u8; 32]))
                .await
                .unwrap();
        }
        let handle = spawn(Some(path.clone())).await;
        let client = RpcClient::new(handle.url(), Duration::from_secs(5)).unwrap();
        assert_eq!(client.block_number().await.unwrap(), 1);
        let admin = AdminKey::from_hex(DEV_KEY).unwrap().address().to_string();
        assert_eq!(client.pending_nonce(&admin).await.unwrap(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn manual_mining_pools_until_mined() {
        let handle = spawn(None).await;
        handle.set_automine(false);
        let client = RpcClient::new(handle.url(), Duration::from_secs(5)).unwrap();
        let admin = AdminKey::from_hex(DEV_KEY).unwrap().address().to_string();

        let raw = store_tx(&handle, 0, [3u8; 32]);
        let hash = client.send_raw_transaction(&raw).await.unwrap();
        assert!(client.transaction_receipt(&hash).await.unwrap().is_none());
        assert_eq!(client.pending_nonce(&admin).await.unwrap(), 1);
        assert_eq!(client.confirmed_nonce(&admin).await.unwrap(), 0);

        // Rebroadcasting the pooled transaction is a no-op.
        assert_eq!(client.send_raw_transaction(&raw).await.unwrap(), hash);
        assert_eq!(handle.transaction_count().unwrap(), 1);

        assert_eq!(handle.mine().unwrap(), 1);
        let receipt = client.transaction_receipt(&hash).await.unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(client.confirmed_nonce(&admin).await.unwrap(), 1);
        assert_eq!(handle.transaction_count().unwrap(), 1);
    }

    #[test]
    fn topic_filter_semantics() {
        let topics = vec!["0xaa".to_string(), "0xbb".to_string()];
        assert!(topics_match(&[], &topics));
        assert!(topics_match(&[json!("0xAA"), Value::Null], &topics));
        assert!(topics_match(&[Value::Null, json!(["0xcc", "0xbb"])], &topics));
        assert!(!topics_match(&[json!("0xbb")], &topics));
        assert!(!topics_match(&[Value::Null, Value::Null, json!("0xcc")], &topics));
    }
}
