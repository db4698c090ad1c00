//! Anchoring of content digests on an external EVM ledger.
//!
//! A [`LedgerAnchor`] is built once from [`LedgerSettings`] and stays in the
//! state it started in: `Enabled` when every setting is present, well formed
//! and the node answered the connectivity probe, `Disabled` otherwise.  A
//! disabled anchor answers every ledger operation with
//! [`AnchorError::Unavailable`] immediately so record writes never stall on it.

/// JSON-RPC client for the ledger node.
pub mod rpc;
/// Transaction signing and anchor-contract ABI helpers.
pub mod tx;

use crate::canonical::ContentDigest;
use rpc::{RpcClient, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};
use tx::{AdminKey, Address, Eip1559Tx};

const DEFAULT_RPC_TIMEOUT_MS: u64 = 8_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 250;
const MAX_RETRY_DELAY_MS: u64 = 5_000;
const DEFAULT_RECEIPT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RECEIPT_POLL_MS: u64 = 250;
const DEFAULT_GAS_LIMIT: u64 = 120_000;
const DEFAULT_PRIORITY_FEE: u128 = 1_000_000_000;

/// Raw ledger configuration as supplied by the operator.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// JSON-RPC endpoint of the ledger node.
    pub node_url: Option<String>,
    /// Address of the anchor contract.
    pub contract_address: Option<String>,
    /// Address the admin key is expected to control.
    pub admin_address: Option<String>,
    /// Hex secp256k1 private key used to sign anchor transactions.
    pub admin_private_key: Option<String>,
    /// Expected chain id; queried from the node when absent.
    pub chain_id: Option<u64>,
    /// Deadline for every individual RPC call, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Attempts per ledger operation before giving up.
    pub max_attempts: u32,
    /// Base delay of the exponential backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Upper bound on waiting for a transaction receipt, in milliseconds.
    pub receipt_timeout_ms: u64,
    /// Receipt polling interval, in milliseconds.
    pub receipt_poll_ms: u64,
    /// Gas limit attached to `storeHash` transactions.
    pub gas_limit: u64,
    /// Problem found while assembling these settings; forces `Disabled`.
    #[serde(skip)]
    pub config_error: Option<String>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            node_url: None,
            contract_address: None,
            admin_address: None,
            admin_private_key: None,
            chain_id: None,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_MS,
            receipt_timeout_ms: DEFAULT_RECEIPT_TIMEOUT_MS,
            receipt_poll_ms: DEFAULT_RECEIPT_POLL_MS,
            gas_limit: DEFAULT_GAS_LIMIT,
            config_error: None,
        }
    }
}

impl fmt::Debug for LedgerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerSettings")
            .field("node_url", &self.node_url)
            .field("contract_address", &self.contract_address)
            .field("admin_address", &self.admin_address)
            .field(
                "admin_private_key",
                &self.admin_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("chain_id", &self.chain_id)
            .field("rpc_timeout_ms", &self.rpc_timeout_ms)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

struct ValidatedSettings {
    node_url: String,
    contract: Address,
    admin: AdminKey,
}

impl LedgerSettings {
    fn validate(&self) -> Result<ValidatedSettings, String> {
        if let Some(err) = &self.config_error {
            return Err(err.clone());
        }
        let node_url = non_empty(&self.node_url).ok_or("ledger node url not configured")?;
        let contract = non_empty(&self.contract_address)
            .ok_or("ledger contract address not configured")?;
        let admin_address =
            non_empty(&self.admin_address).ok_or("ledger admin address not configured")?;
        let admin_key =
            non_empty(&self.admin_private_key).ok_or("ledger admin private key not configured")?;

        let contract = Address::parse(contract)
            .map_err(|err| format!("invalid ledger contract address: {err}"))?;
        let admin_address = Address::parse(admin_address)
            .map_err(|err| format!("invalid ledger admin address: {err}"))?;
        let admin =
            AdminKey::from_hex(admin_key).map_err(|err| format!("invalid admin key: {err}"))?;
        if admin.address() != admin_address {
            return Err(format!(
                "admin private key controls {}, not the configured admin address {admin_address}",
                admin.address()
            ));
        }
        if !(node_url.starts_with("http://") || node_url.starts_with("https://")) {
            return Err(format!("ledger node url must be http(s): {node_url}"));
        }
        Ok(ValidatedSettings {
            node_url: node_url.to_string(),
            contract,
            admin,
        })
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms.max(1))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Proof that a digest was recorded on the ledger.  Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReference {
    /// `0x`-prefixed transaction hash (empty when recovered without log indexing).
    pub transaction_id: String,
    /// Block that included the anchor transaction.
    pub block_number: u64,
    /// Unix seconds recorded alongside the digest.
    pub anchored_at: u64,
}

/// Result of a read-only ledger lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorVerification {
    /// Whether the digest is known to the contract.
    pub exists: bool,
    /// Unix seconds stored with the digest, when it exists.
    pub anchored_at: Option<u64>,
}

/// One `HashStored` event reconstructed from the ledger's log index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorEvent {
    /// Digest that was anchored.
    pub digest: ContentDigest,
    /// Transaction that emitted the event.
    pub transaction_id: Option<String>,
    /// Block containing the event.
    pub block_number: Option<u64>,
    /// Timestamp argument of the event.
    pub anchored_at: u64,
    /// Account that submitted the transaction.
    pub sender: Option<String>,
}

/// Connectivity snapshot of the ledger node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHealth {
    /// Whether the node answered.
    pub reachable: bool,
    /// Latest block number reported by the node.
    pub chain_height: Option<u64>,
    /// Network id reported by the node.
    pub network_id: Option<u64>,
    /// Node the anchor is configured against.
    pub node_url: Option<String>,
    /// Why the ledger is unreachable or disabled.
    pub reason: Option<String>,
}

/// Wire shape of the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Whether the node answered.
    pub connected: bool,
    /// Latest block number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_height: Option<u64>,
    /// Network id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_id: Option<u64>,
    /// Configured node URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_url: Option<String>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<LedgerHealth> for HealthResponse {
    fn from(health: LedgerHealth) -> Self {
        Self {
            connected: health.reachable,
            chain_height: health.chain_height,
            network_id: health.network_id,
            node_url: health.node_url,
            error: health.reason,
        }
    }
}

/// Operating state chosen at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerState {
    /// Fully configured and reachable at startup.
    Enabled,
    /// Misconfigured or unreachable; ledger calls fail fast.
    Disabled {
        /// Why the anchor is disabled.
        reason: String,
    },
}

/// Failures of ledger operations.  None of them is fatal to a record write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnchorError {
    #[error("ledger unavailable: {0}")]
    /// The anchor is disabled.
    Unavailable(String),
    #[error("ledger transient failure after {attempts} attempt(s): {last_error}")]
    /// Network failures persisted through every retry.
    TransientFailure {
        /// Attempts made.
        attempts: u32,
        /// Last error observed.
        last_error: String,
    },
    #[error("ledger rejected anchor transaction {0}")]
    /// The transaction was mined but reverted.
    Rejected(String),
    #[error("ledger protocol error: {0}")]
    /// Non-retryable RPC or encoding failure.
    Protocol(String),
    #[error("anchoring deferred: {0}")]
    /// The job was parked in the dead-letter outbox without being attempted.
    Deferred(String),
}

impl AnchorError {
    fn transient(err: impl fmt::Display) -> Self {
        Self::TransientFailure {
            attempts: 1,
            last_error: err.to_string(),
        }
    }
}

impl From<RpcError> for AnchorError {
    fn from(err: RpcError) -> Self {
        if err.is_transient() {
            Self::transient(err)
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

impl From<tx::TxError> for AnchorError {
    fn from(err: tx::TxError) -> Self {
        Self::Protocol(err.to_string())
    }
}

struct EnabledLedger {
    rpc: RpcClient,
    contract: Address,
    admin: AdminKey,
    chain_id: u64,
}

enum Backend {
    Enabled(EnabledLedger),
    Disabled {
        reason: String,
        node_url: Option<String>,
    },
}

/// A signed `storeHash` transaction that has been broadcast but not yet confirmed.
#[derive(Debug, Clone)]
struct InflightTx {
    hash: String,
    raw_hex: String,
    nonce: u64,
    anchored_at: u64,
}

/// Digest anchoring service.
pub struct LedgerAnchor {
    backend: Backend,
    settings: LedgerSettings,
    index: Mutex<HashMap<ContentDigest, AnchorReference>>,
    inflight: Mutex<HashMap<ContentDigest, InflightTx>>,
    submit_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for LedgerAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerAnchor")
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish()
    }
}

impl LedgerAnchor {
    /// Validates settings and probes the node.  Never fails: problems yield `Disabled`.
    pub async fn connect(settings: LedgerSettings) -> Self {
        let validated = match settings.validate() {
            Ok(validated) => validated,
            Err(reason) => {
                warn!(evt = "LEDGER_DISABLED", %reason, "ledger anchoring disabled");
                let node_url = settings.node_url.clone();
                return Self::with_backend(Backend::Disabled { reason, node_url }, settings);
            }
        };
        let rpc = match RpcClient::new(validated.node_url.clone(), settings.rpc_timeout()) {
            Ok(rpc) => rpc,
            Err(err) => {
                let reason = err.to_string();
                warn!(evt = "LEDGER_DISABLED", %reason, "ledger anchoring disabled");
                return Self::with_backend(
                    Backend::Disabled {
                        reason,
                        node_url: Some(validated.node_url),
                    },
                    settings,
                );
            }
        };
        let chain_id = match rpc.chain_id().await {
            Ok(chain_id) => chain_id,
            Err(err) => {
                let reason = format!("connectivity check failed: {err}");
                warn!(evt = "LEDGER_DISABLED", %reason, node = %validated.node_url, "ledger anchoring disabled");
                return Self::with_backend(
                    Backend::Disabled {
                        reason,
                        node_url: Some(validated.node_url),
                    },
                    settings,
                );
            }
        };
        if let Some(expected) = settings.chain_id {
            if expected != chain_id {
                let reason = format!("chain id mismatch: configured {expected}, node {chain_id}");
                warn!(evt = "LEDGER_DISABLED", %reason, "ledger anchoring disabled");
                return Self::with_backend(
                    Backend::Disabled {
                        reason,
                        node_url: Some(validated.node_url),
                    },
                    settings,
                );
            }
        }
        info!(
            evt = "LEDGER_ENABLED",
            node = %validated.node_url,
            chain_id,
            contract = %validated.contract,
            admin = %validated.admin.address(),
            "ledger anchoring enabled"
        );
        Self::with_backend(
            Backend::Enabled(EnabledLedger {
                rpc,
                contract: validated.contract,
                admin: validated.admin,
                chain_id,
            }),
            settings,
        )
    }

    /// Builds an anchor that is permanently disabled.
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self::with_backend(
            Backend::Disabled {
                reason: reason.into(),
                node_url: None,
            },
            LedgerSettings::default(),
        )
    }

    fn with_backend(backend: Backend, settings: LedgerSettings) -> Self {
        Self {
            backend,
            settings,
            index: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            submit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current operating state.
    pub fn state(&self) -> LedgerState {
        match &self.backend {
            Backend::Enabled(_) => LedgerState::Enabled,
            Backend::Disabled { reason, .. } => LedgerState::Disabled {
                reason: reason.clone(),
            },
        }
    }

    /// Whether the anchor is `Enabled`.
    pub fn is_enabled(&self) -> bool {
        matches!(self.backend, Backend::Enabled(_))
    }

    /// Seeds the local anchor index, typically from persisted records at startup.
    pub fn remember(&self, digest: ContentDigest, reference: AnchorReference) {
        if let Ok(mut index) = self.index.lock() {
            index.entry(digest).or_insert(reference);
        }
    }

    /// Locally known anchor for `digest`, if any.
    pub fn known_anchor(&self, digest: &ContentDigest) -> Option<AnchorReference> {
        self.index
            .lock()
            .ok()
            .and_then(|index| index.get(digest).cloned())
    }

    fn enabled(&self) -> Result<&EnabledLedger, AnchorError> {
        match &self.backend {
            Backend::Enabled(ledger) => Ok(ledger),
            Backend::Disabled { reason, .. } => Err(AnchorError::Unavailable(reason.clone())),
        }
    }

    /// Anchors `digest`, or returns the existing reference if it is already anchored.
    pub async fn anchor(&self, digest: &ContentDigest) -> Result<AnchorReference, AnchorError> {
        let ledger = self.enabled()?;
        if let Some(existing) = self.known_anchor(digest) {
            debug!(evt = "ANCHOR_CACHED", %digest, "digest already anchored locally");
            return Ok(existing);
        }

        let _guard = self.submit_lock.lock().await;
        if let Some(existing) = self.known_anchor(digest) {
            return Ok(existing);
        }

        let reference = self
            .with_retry("anchor", |attempt| async move {
                if let Some(existing) = self.remote_reference(ledger, digest).await? {
                    if attempt > 1 {
                        info!(evt = "ANCHOR_LANDED", %digest, "earlier attempt was mined");
                    } else {
                        info!(evt = "ANCHOR_EXISTS", %digest, "digest already anchored on ledger");
                    }
                    return Ok(existing);
                }
                self.submit(ledger, digest).await
            })
            .await?;
        self.clear_inflight(digest);
        self.remember(*digest, reference.clone());
        Ok(reference)
    }

    /// Broadcasts the anchor transaction for `digest` and waits for it.
    ///
    /// The signed transaction is kept until it confirms or is dropped, so a
    /// retry after a receipt timeout re-polls and rebroadcasts the same
    /// transaction (same nonce, same hash) instead of signing a second one.
    async fn submit(
        &self,
        ledger: &EnabledLedger,
        digest: &ContentDigest,
    ) -> Result<AnchorReference, AnchorError> {
        let pending = match self.inflight_tx(digest) {
            Some(pending) => {
                if let Some(receipt) = ledger.rpc.transaction_receipt(&pending.hash).await? {
                    return self.finish(ledger, digest, &pending, receipt).await;
                }
                self.rebroadcast(ledger, digest, &pending).await?;
                pending
            }
            None => {
                let pending = self.sign_store_hash(ledger, digest).await?;
                self.track_inflight(*digest, pending.clone());
                info!(
                    evt = "ANCHOR_SUBMIT",
                    %digest,
                    tx = %pending.hash,
                    nonce = pending.nonce,
                    "submitting anchor transaction"
                );
                let reported = match ledger.rpc.send_raw_transaction(&pending.raw_hex).await {
                    Ok(reported) => reported,
                    Err(err) => {
                        if !err.is_transient() {
                            self.clear_inflight(digest);
                        }
                        return Err(err.into());
                    }
                };
                if reported != pending.hash {
                    warn!(evt = "ANCHOR_HASH_DIFF", local = %pending.hash, node = %reported, "node reported a different tx hash");
                }
                pending
            }
        };
        let receipt = self.wait_for_receipt(ledger, &pending.hash).await?;
        self.finish(ledger, digest, &pending, receipt).await
    }

    async fn sign_store_hash(
        &self,
        ledger: &EnabledLedger,
        digest: &ContentDigest,
    ) -> Result<InflightTx, AnchorError> {
        let admin = ledger.admin.address().to_string();
        let nonce = ledger.rpc.pending_nonce(&admin).await?;
        let gas_price = ledger.rpc.gas_price().await?;
        let priority = ledger.rpc.max_priority_fee(DEFAULT_PRIORITY_FEE).await?;
        let anchored_at = now_secs();
        let tx = Eip1559Tx {
            chain_id: ledger.chain_id,
            nonce,
            max_priority_fee_per_gas: priority,
            max_fee_per_gas: gas_price.saturating_mul(2).saturating_add(priority),
            gas_limit: self.settings.gas_limit,
            to: ledger.contract,
            value: 0,
            input: tx::encode_store_hash(digest.as_bytes(), anchored_at),
        };
        let signed = tx.sign(&ledger.admin)?;
        Ok(InflightTx {
            raw_hex: signed.raw_hex(),
            hash: signed.hash,
            nonce,
            anchored_at,
        })
    }

    async fn rebroadcast(
        &self,
        ledger: &EnabledLedger,
        digest: &ContentDigest,
        pending: &InflightTx,
    ) -> Result<(), AnchorError> {
        let err = match ledger.rpc.send_raw_transaction(&pending.raw_hex).await {
            Ok(_) => {
                debug!(evt = "ANCHOR_REBROADCAST", %digest, tx = %pending.hash, "anchor transaction rebroadcast");
                return Ok(());
            }
            Err(err) => err,
        };
        // Nodes reject duplicates of pooled transactions; that is only fatal
        // for this transaction once its nonce was used by another one.
        let admin = ledger.admin.address().to_string();
        let confirmed = ledger.rpc.confirmed_nonce(&admin).await?;
        if confirmed > pending.nonce {
            warn!(evt = "ANCHOR_TX_DROPPED", %digest, tx = %pending.hash, nonce = pending.nonce, "anchor nonce consumed by another transaction");
            self.clear_inflight(digest);
            return Err(AnchorError::transient(format!(
                "anchor transaction {} dropped: {err}",
                pending.hash
            )));
        }
        debug!(evt = "ANCHOR_REBROADCAST_REFUSED", %digest, tx = %pending.hash, error = %err, "node refused rebroadcast, still waiting");
        Ok(())
    }

    async fn finish(
        &self,
        ledger: &EnabledLedger,
        digest: &ContentDigest,
        pending: &InflightTx,
        receipt: rpc::TxReceipt,
    ) -> Result<AnchorReference, AnchorError> {
        self.clear_inflight(digest);
        if !receipt.success {
            // A revert usually means someone else anchored the digest first.
            if let Some(existing) = self.remote_reference(ledger, digest).await? {
                return Ok(existing);
            }
            return Err(AnchorError::Rejected(receipt.transaction_hash));
        }
        info!(
            evt = "ANCHOR_CONFIRMED",
            %digest,
            tx = %receipt.transaction_hash,
            block = receipt.block_number,
            "anchor transaction confirmed"
        );
        Ok(AnchorReference {
            transaction_id: receipt.transaction_hash,
            block_number: receipt.block_number,
            anchored_at: pending.anchored_at,
        })
    }

    fn inflight_tx(&self, digest: &ContentDigest) -> Option<InflightTx> {
        self.inflight
            .lock()
            .ok()
            .and_then(|inflight| inflight.get(digest).cloned())
    }

    fn track_inflight(&self, digest: ContentDigest, pending: InflightTx) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.insert(digest, pending);
        }
    }

    fn clear_inflight(&self, digest: &ContentDigest) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(digest);
        }
    }

    async fn wait_for_receipt(
        &self,
        ledger: &EnabledLedger,
        hash: &str,
    ) -> Result<rpc::TxReceipt, AnchorError> {
        let deadline = Instant::now() + Duration::from_millis(self.settings.receipt_timeout_ms);
        let poll = Duration::from_millis(self.settings.receipt_poll_ms.max(10));
        loop {
            if let Some(receipt) = ledger.rpc.transaction_receipt(hash).await? {
                return Ok(receipt);
            }
            if Instant::now() >= deadline {
                return Err(AnchorError::transient(format!(
                    "no receipt for {hash} within {}ms",
                    self.settings.receipt_timeout_ms
                )));
            }
            time::sleep(poll).await;
        }
    }

    async fn remote_reference(
        &self,
        ledger: &EnabledLedger,
        digest: &ContentDigest,
    ) -> Result<Option<AnchorReference>, AnchorError> {
        let verification = self.query(ledger, digest).await?;
        if !verification.exists {
            return Ok(None);
        }
        let anchored_at = verification.anchored_at.unwrap_or_default();
        let events = self.fetch_events(ledger, digest).await.unwrap_or_default();
        let reference = events
            .into_iter()
            .next()
            .map(|event| AnchorReference {
                transaction_id: event.transaction_id.unwrap_or_default(),
                block_number: event.block_number.unwrap_or_default(),
                anchored_at: event.anchored_at,
            })
            .unwrap_or(AnchorReference {
                transaction_id: String::new(),
                block_number: 0,
                anchored_at,
            });
        Ok(Some(reference))
    }

    async fn query(
        &self,
        ledger: &EnabledLedger,
        digest: &ContentDigest,
    ) -> Result<AnchorVerification, AnchorError> {
        let data = tx::encode_verify_hash(digest.as_bytes());
        let raw = ledger
            .rpc
            .eth_call(&ledger.contract.to_string(), &data)
            .await?;
        let (exists, timestamp) = tx::decode_verify_result(&raw)?;
        Ok(AnchorVerification {
            exists,
            anchored_at: exists.then_some(timestamp),
        })
    }

    /// Read-only lookup.  Unknown digests yield `exists = false`.
    pub async fn verify(&self, digest: &ContentDigest) -> Result<AnchorVerification, AnchorError> {
        let ledger = self.enabled()?;
        self.with_retry("verify", |_| self.query(ledger, digest))
            .await
    }

    /// Probes the node.  Never fails; problems are reported in `reason`.
    pub async fn check_health(&self) -> LedgerHealth {
        let ledger = match &self.backend {
            Backend::Enabled(ledger) => ledger,
            Backend::Disabled { reason, node_url } => {
                return LedgerHealth {
                    reachable: false,
                    chain_height: None,
                    network_id: None,
                    node_url: node_url.clone(),
                    reason: Some(reason.clone()),
                }
            }
        };
        let node_url = Some(ledger.rpc.url().to_string());
        match ledger.rpc.block_number().await {
            Ok(height) => LedgerHealth {
                reachable: true,
                chain_height: Some(height),
                network_id: ledger.rpc.network_id().await.ok().or(Some(ledger.chain_id)),
                node_url,
                reason: None,
            },
            Err(err) => LedgerHealth {
                reachable: false,
                chain_height: None,
                network_id: None,
                node_url,
                reason: Some(err.to_string()),
            },
        }
    }

    /// Best-effort `HashStored` history for `digest`; empty when unavailable.
    pub async fn audit_trail(&self, digest: &ContentDigest) -> Vec<AnchorEvent> {
        let Ok(ledger) = self.enabled() else {
            return Vec::new();
        };
        match self.fetch_events(ledger, digest).await {
            Ok(events) => events,
            Err(err) => {
                debug!(evt = "TRAIL_UNAVAILABLE", %digest, error = %err, "ledger log query failed");
                Vec::new()
            }
        }
    }

    async fn fetch_events(
        &self,
        ledger: &EnabledLedger,
        digest: &ContentDigest,
    ) -> Result<Vec<AnchorEvent>, AnchorError> {
        let topics = vec![
            Value::String(format!("0x{}", hex::encode(*tx::HASH_STORED_TOPIC))),
            Value::String(format!("0x{digest}")),
        ];
        let logs = ledger
            .rpc
            .get_logs(&ledger.contract.to_string(), topics)
            .await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let data = rpc::decode_hex_prefixed(&log.data)?;
            let anchored_at = if data.len() >= 32 {
                tx::word_to_u64(&data[..32])?
            } else {
                0
            };
            let sender = log.topics.get(2).and_then(|topic| {
                let raw = topic.strip_prefix("0x")?;
                (raw.len() == 64).then(|| format!("0x{}", &raw[24..]))
            });
            events.push(AnchorEvent {
                digest: *digest,
                transaction_id: log.transaction_hash,
                block_number: log.block_number,
                anchored_at,
                sender,
            });
        }
        events.sort_by_key(|event| (event.block_number, event.anchored_at));
        Ok(events)
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut attempt_fn: F) -> Result<T, AnchorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AnchorError>>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(AnchorError::TransientFailure { last_error, .. }) => {
                    if attempt >= max_attempts {
                        warn!(evt = "LEDGER_GIVE_UP", op, attempts = attempt, error = %last_error, "ledger operation failed");
                        return Err(AnchorError::TransientFailure {
                            attempts: attempt,
                            last_error,
                        });
                    }
                    let delay = backoff_delay(self.settings.retry_base_delay_ms, attempt);
                    debug!(evt = "LEDGER_RETRY", op, attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "retrying ledger operation");
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Builds the JSON body of the health endpoint.
pub fn health_json(health: &LedgerHealth) -> Value {
    serde_json::to_value(HealthResponse::from(health.clone())).unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::digest;

    #[test]
    fn missing_settings_name_the_gap() {
        let settings = LedgerSettings::default();
        let err = settings.validate().err().unwrap();
        assert!(err.contains("node url"));

        let settings = LedgerSettings {
            node_url: Some("http://127.0.0.1:8545".into()),
            contract_address: Some("0x1234".into()),
            admin_address: Some("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".into()),
            admin_private_key: Some(
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".into(),
            ),
            ..LedgerSettings::default()
        };
        assert!(settings.validate().err().unwrap().contains("contract address"));
    }

    #[test]
    fn admin_address_must_match_key() {
        let settings = LedgerSettings {
            node_url: Some("http://127.0.0.1:8545".into()),
            contract_address: Some("0x5fbdb2315678afecb367f032d93f642f64180aa3".into()),
            admin_address: Some("0x0000000000000000000000000000000000000001".into()),
            admin_private_key: Some(
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".into(),
            ),
            ..LedgerSettings::default()
        };
        assert!(settings.validate().err().unwrap().contains("admin private key controls"));
    }

    #[test]
    fn settings_debug_redacts_key() {
        let settings = LedgerSettings {
            admin_private_key: Some("deadbeef".into()),
            ..LedgerSettings::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("deadbeef"));
    }

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(backoff_delay(250, 1), Duration::from_millis(250));
        assert_eq!(backoff_delay(250, 2), Duration::from_millis(500));
        assert_eq!(backoff_delay(250, 40), Duration::from_millis(MAX_RETRY_DELAY_MS));
    }

    #[tokio::test]
    async fn unconfigured_ledger_degrades() {
        let anchor = LedgerAnchor::connect(LedgerSettings::default()).await;
        assert!(!anchor.is_enabled());
        let health = anchor.check_health().await;
        assert!(!health.reachable);
        assert!(health.reason.is_some());

        let d = digest(&serde_json::json!({"a": 1})).unwrap();
        assert!(matches!(
            anchor.anchor(&d).await,
            Err(AnchorError::Unavailable(_))
        ));
        assert!(matches!(
            anchor.verify(&d).await,
            Err(AnchorError::Unavailable(_))
        ));
        assert!(anchor.audit_trail(&d).await.is_empty());

        let body = health_json(&health);
        assert_eq!(body["connected"], Value::Bool(false));
        assert!(body.get("error").is_some());
        assert!(body.get("chainHeight").is_none());
    }

    #[tokio::test]
    async fn unreachable_node_disables_at_startup() {
        let settings = LedgerSettings {
            node_url: Some("http://127.0.0.1:9".into()),
            contract_address: Some("0x5fbdb2315678afecb367f032d93f642f64180aa3".into()),
            admin_address: Some("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".into()),
            admin_private_key: Some(
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".into(),
            ),
            rpc_timeout_ms: 500,
            ..LedgerSettings::default()
        };
        let anchor = LedgerAnchor::connect(settings).await;
        match anchor.state() {
            LedgerState::Disabled { reason } => assert!(reason.contains("connectivity")),
            LedgerState::Enabled => panic!("unreachable node must not enable the ledger"),
        }
        let health = anchor.check_health().await;
        assert_eq!(health.node_url.as_deref(), Some("http://127.0.0.1:9"));
    }

    #[tokio::test]
    async fn local_index_short_circuits() {
        let anchor = LedgerAnchor::disabled("test");
        let d = digest(&serde_json::json!({"b": 2})).unwrap();
        let reference = AnchorReference {
            transaction_id: "0xabc".into(),
            block_number: 7,
            anchored_at: 1_700_000_000,
        };
        anchor.remember(d, reference.clone());
        anchor.remember(
            d,
            AnchorReference {
                transaction_id: "0xdef".into(),
                block_number: 8,
                anchored_at: 1,
            },
        );
        assert_eq!(anchor.known_anchor(&d), Some(reference));
    }

    #[tokio::test]
    async fn receipt_timeout_keeps_one_transaction_per_digest() {
        use crate::devnet::{spawn_devnet, DevnetConfig, DEFAULT_CHAIN_ID};

        let mut cfg = DevnetConfig::new("127.0.0.1:0".parse().unwrap(), DEFAULT_CHAIN_ID);
        cfg.automine = false;
        let node = spawn_devnet(cfg).await.unwrap();
        let anchor = LedgerAnchor::connect(LedgerSettings {
            node_url: Some(node.url()),
            contract_address: Some(node.contract().to_string()),
            admin_address: Some("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".into()),
            admin_private_key: Some(
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".into(),
            ),
            max_attempts: 3,
            retry_base_delay_ms: 10,
            receipt_timeout_ms: 100,
            receipt_poll_ms: 20,
            ..LedgerSettings::default()
        })
        .await;
        assert!(anchor.is_enabled());

        let d = digest(&serde_json::json!({"slow": "block"})).unwrap();
        match anchor.anchor(&d).await {
            Err(AnchorError::TransientFailure { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected a receipt timeout, got {other:?}"),
        }
        assert_eq!(node.transaction_count().unwrap(), 1);

        // A later job for the same digest re-polls the pooled transaction.
        let pooled = anchor.inflight_tx(&d).unwrap();
        match anchor.anchor(&d).await {
            Err(AnchorError::TransientFailure { .. }) => {}
            other => panic!("expected a receipt timeout, got {other:?}"),
        }
        assert_eq!(node.transaction_count().unwrap(), 1);
        assert_eq!(anchor.inflight_tx(&d).unwrap().nonce, pooled.nonce);

        assert_eq!(node.mine().unwrap(), 1);
        let reference = anchor.anchor(&d).await.unwrap();
        assert_eq!(reference.transaction_id, pooled.hash);
        assert_eq!(node.transaction_count().unwrap(), 1);
        assert!(anchor.inflight_tx(&d).is_none());
    }
}
