//! Runtime configuration: optional JSON file, then `MEDLEDGER_*` environment overrides.

use crate::crypto::{CryptoBox, CryptoError, EncryptionKey, PasswordCost};
use crate::ledger::LedgerSettings;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Encryption key, 32 raw chars or 64 hex chars.
pub const ENV_ENCRYPTION_KEY: &str = "MEDLEDGER_ENCRYPTION_KEY";
/// Ledger JSON-RPC endpoint.
pub const ENV_LEDGER_NODE_URL: &str = "MEDLEDGER_LEDGER_NODE_URL";
/// Anchor contract address.
pub const ENV_LEDGER_CONTRACT: &str = "MEDLEDGER_LEDGER_CONTRACT";
/// Admin account address.
pub const ENV_LEDGER_ADMIN_ADDRESS: &str = "MEDLEDGER_LEDGER_ADMIN_ADDRESS";
/// Admin private key.
pub const ENV_LEDGER_ADMIN_KEY: &str = "MEDLEDGER_LEDGER_ADMIN_KEY";
/// Expected chain id.
pub const ENV_LEDGER_CHAIN_ID: &str = "MEDLEDGER_LEDGER_CHAIN_ID";
/// Per-call RPC timeout in milliseconds.
pub const ENV_RPC_TIMEOUT_MS: &str = "MEDLEDGER_RPC_TIMEOUT_MS";
/// Attempts per ledger operation.
pub const ENV_ANCHOR_RETRIES: &str = "MEDLEDGER_ANCHOR_RETRIES";
/// Audit log directory.
pub const ENV_AUDIT_DIR: &str = "MEDLEDGER_AUDIT_DIR";
/// Credential hashing profile (`low`, `default`, `high`).
pub const ENV_PASSWORD_COST: &str = "MEDLEDGER_PASSWORD_COST";

/// Configuration failures.  All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    /// Config file unreadable.
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    /// Config file is not valid JSON for [`Config`].
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },
    #[error("encryption key not configured (set {ENV_ENCRYPTION_KEY})")]
    /// No encryption key anywhere.
    MissingKey,
    #[error(transparent)]
    /// The key is present but unusable.
    Crypto(#[from] CryptoError),
    #[error("invalid value for {name}: {value}")]
    /// A non-ledger setting could not be parsed.
    InvalidValue {
        /// Setting name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Process configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Record encryption key.
    pub encryption_key: Option<String>,
    /// Ledger settings; absent means anchoring is disabled.  A malformed
    /// section loads as settings carrying `config_error`, like a malformed
    /// environment override.
    #[serde(deserialize_with = "lenient_ledger")]
    pub ledger: Option<LedgerSettings>,
    /// Audit segment directory.
    pub audit_dir: PathBuf,
    /// Record document directory.
    pub data_dir: PathBuf,
    /// Dead-letter outbox for anchor jobs.
    pub dead_letter_path: PathBuf,
    /// Credential hashing profile name.
    pub password_cost: String,
    /// Anchor queue capacity.
    pub anchor_queue_capacity: usize,
    /// Attempts per queued anchor job, on top of the ledger's own retries.
    pub anchor_job_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encryption_key: None,
            ledger: None,
            audit_dir: PathBuf::from("audit"),
            data_dir: PathBuf::from("records"),
            dead_letter_path: PathBuf::from("anchor_dead_letters.jsonl"),
            password_cost: "default".to_string(),
            anchor_queue_capacity: 256,
            anchor_job_attempts: 3,
        }
    }
}

fn lenient_ledger<'de, D>(deserializer: D) -> Result<Option<LedgerSettings>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|value| !value.is_null()) else {
        return Ok(None);
    };
    match serde_json::from_value::<LedgerSettings>(raw.clone()) {
        Ok(settings) => Ok(Some(settings)),
        Err(err) => Ok(Some(LedgerSettings {
            node_url: raw
                .get("node_url")
                .and_then(Value::as_str)
                .map(str::to_string),
            config_error: Some(format!("invalid ledger section: {err}")),
            ..LedgerSettings::default()
        })),
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .field("ledger", &self.ledger)
            .field("audit_dir", &self.audit_dir)
            .field("data_dir", &self.data_dir)
            .field("dead_letter_path", &self.dead_letter_path)
            .field("password_cost", &self.password_cost)
            .finish()
    }
}

impl Config {
    /// Reads `path` (if given) and applies the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parses a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(key) = get(ENV_ENCRYPTION_KEY) {
            self.encryption_key = Some(key);
        }
        if let Some(dir) = get(ENV_AUDIT_DIR) {
            self.audit_dir = PathBuf::from(dir);
        }
        if let Some(cost) = get(ENV_PASSWORD_COST) {
            self.password_cost = cost;
        }

        let ledger_vars = [
            ENV_LEDGER_NODE_URL,
            ENV_LEDGER_CONTRACT,
            ENV_LEDGER_ADMIN_ADDRESS,
            ENV_LEDGER_ADMIN_KEY,
            ENV_LEDGER_CHAIN_ID,
            ENV_RPC_TIMEOUT_MS,
            ENV_ANCHOR_RETRIES,
        ];
        if self.ledger.is_none() && ledger_vars.iter().all(|name| get(name).is_none()) {
            return;
        }
        let ledger = self.ledger.get_or_insert_with(LedgerSettings::default);
        if let Some(url) = get(ENV_LEDGER_NODE_URL) {
            ledger.node_url = Some(url);
        }
        if let Some(contract) = get(ENV_LEDGER_CONTRACT) {
            ledger.contract_address = Some(contract);
        }
        if let Some(admin) = get(ENV_LEDGER_ADMIN_ADDRESS) {
            ledger.admin_address = Some(admin);
        }
        if let Some(key) = get(ENV_LEDGER_ADMIN_KEY) {
            ledger.admin_private_key = Some(key);
        }
        if let Some(raw) = get(ENV_LEDGER_CHAIN_ID) {
            match raw.trim().parse::<u64>() {
                Ok(id) => ledger.chain_id = Some(id),
                Err(_) => ledger.config_error = Some(format!("invalid {ENV_LEDGER_CHAIN_ID}: {raw}")),
            }
        }
        if let Some(raw) = get(ENV_RPC_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => ledger.rpc_timeout_ms = ms,
                _ => ledger.config_error = Some(format!("invalid {ENV_RPC_TIMEOUT_MS}: {raw}")),
            }
        }
        if let Some(raw) = get(ENV_ANCHOR_RETRIES) {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => ledger.max_attempts = n,
                _ => ledger.config_error = Some(format!("invalid {ENV_ANCHOR_RETRIES}: {raw}")),
            }
        }
    }

    /// Builds the record cipher.  Missing or malformed keys are fatal.
    pub fn crypto_box(&self) -> Result<CryptoBox, ConfigError> {
        let raw = self
            .encryption_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingKey)?;
        Ok(CryptoBox::with_key(EncryptionKey::from_config_str(raw)?))
    }

    /// Ledger settings, defaulting to an unconfigured (disabled) ledger.
    pub fn ledger_settings(&self) -> LedgerSettings {
        self.ledger.clone().unwrap_or_default()
    }

    /// Credential hashing profile.
    pub fn password_cost(&self) -> Result<PasswordCost, ConfigError> {
        PasswordCost::from_name(&self.password_cost).ok_or_else(|| ConfigError::InvalidValue {
            name: ENV_PASSWORD_COST,
            value: self.password_cost.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| map.get(name).cloned()
    }

    fn temp_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("medledger_config_{name}_{nanos}.json"))
    }

    #[test]
    fn missing_key_is_fatal() {
        let config = Config::default();
        assert!(matches!(config.crypto_box(), Err(ConfigError::MissingKey)));
    }

    #[test]
    fn short_key_is_fatal() {
        let mut config = Config::default();
        config.apply_env(lookup(&[(ENV_ENCRYPTION_KEY, "too-short")]));
        assert!(matches!(
            config.crypto_box(),
            Err(ConfigError::Crypto(CryptoError::KeyConfiguration(_)))
        ));
    }

    #[test]
    fn env_overrides_file() {
        let path = temp_path("override");
        fs::write(
            &path,
            r#"{"encryption_key":"0123456789abcdef0123456789abcdef","ledger":{"node_url":"http://file:8545","max_attempts":5},"audit_dir":"/var/audit"}"#,
        )
        .unwrap();
        let mut config = Config::from_file(&path).unwrap();
        config.apply_env(lookup(&[
            (ENV_LEDGER_NODE_URL, "http://env:8545"),
            (ENV_AUDIT_DIR, "/tmp/audit"),
        ]));
        let ledger = config.ledger_settings();
        assert_eq!(ledger.node_url.as_deref(), Some("http://env:8545"));
        assert_eq!(ledger.max_attempts, 5);
        assert_eq!(ledger.rpc_timeout_ms, 8_000);
        assert_eq!(config.audit_dir, PathBuf::from("/tmp/audit"));
        assert!(config.crypto_box().is_ok());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn no_ledger_vars_means_no_ledger() {
        let mut config = Config::default();
        config.apply_env(lookup(&[(ENV_PASSWORD_COST, "low")]));
        assert!(config.ledger.is_none());
        assert_eq!(config.password_cost().unwrap(), PasswordCost::LOW);
    }

    #[test]
    fn malformed_ledger_numbers_disable_instead_of_failing() {
        let mut config = Config::default();
        config.apply_env(lookup(&[(ENV_LEDGER_CHAIN_ID, "mainnet")]));
        let ledger = config.ledger_settings();
        assert!(ledger
            .config_error
            .as_deref()
            .unwrap()
            .contains(ENV_LEDGER_CHAIN_ID));
    }

    #[test]
    fn malformed_ledger_section_disables_instead_of_failing() {
        let path = temp_path("ledger_types");
        fs::write(
            &path,
            r#"{"encryption_key":"0123456789abcdef0123456789abcdef","ledger":{"node_url":"http://file:8545","chain_id":"abc"},"audit_dir":"/var/audit"}"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.audit_dir, PathBuf::from("/var/audit"));
        let ledger = config.ledger_settings();
        assert!(ledger
            .config_error
            .as_deref()
            .unwrap()
            .contains("invalid ledger section"));
        assert_eq!(ledger.node_url.as_deref(), Some("http://file:8545"));
        assert_eq!(ledger.chain_id, None);

        fs::write(&path, r#"{"ledger":null}"#).unwrap();
        assert!(Config::from_file(&path).unwrap().ledger.is_none());
        let _ = fs::remove_file(path);
    }

    #[tokio::test]
    async fn malformed_ledger_section_connects_disabled() {
        let config: Config =
            serde_json::from_str(r#"{"ledger":{"node_url":"http://127.0.0.1:8545","max_attempts":-1}}"#)
                .unwrap();
        let anchor = crate::ledger::LedgerAnchor::connect(config.ledger_settings()).await;
        match anchor.state() {
            crate::ledger::LedgerState::Disabled { reason } => {
                assert!(reason.contains("invalid ledger section"))
            }
            crate::ledger::LedgerState::Enabled => panic!("malformed ledger section enabled anchoring"),
        }
    }

    #[test]
    fn debug_redacts_key() {
        let mut config = Config::default();
        config.encryption_key = Some("0123456789abcdef0123456789abcdef".into());
        assert!(!format!("{config:?}").contains("0123456789abcdef"));
    }

    #[test]
    fn bad_file_reports_path() {
        let path = temp_path("bad");
        fs::write(&path, "{not json").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
        let _ = fs::remove_file(path);
    }
}
