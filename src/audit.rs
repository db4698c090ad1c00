//! Append-only audit trail of integrity-relevant actions.
//!
//! Every entry passes through [`sanitize_details`] inside [`AuditSink::record`]
//! so secrets never reach storage, whatever the caller put in `details`.

use crate::crypto::generate_secure_token;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::error;

/// Days audit segments must be kept (7 years).
pub const RETENTION_DAYS: i64 = 2557;

/// Replacement written for denied detail values.
pub const REDACTED: &str = "[REDACTED]";

/// Normalized detail keys that are always redacted.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "plaintext",
    "password",
    "passwordhash",
    "key",
    "encryptionkey",
    "privatekey",
    "adminkey",
    "apikey",
    "secret",
    "token",
    "credential",
    "credentials",
    "authorization",
    "mnemonic",
    "seed",
    "ssn",
];

const SENSITIVE_SUFFIXES: &[&str] = &["password", "privatekey", "secret", "token", "apikey"];

/// Normalized names whose last word is `key` but which hold no secret.
const NON_SECRET_KEY_NAMES: &[&str] = &["publickey", "idempotencykey"];

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A payload was encrypted for storage.
    Encrypt,
    /// A stored payload was decrypted.
    Decrypt,
    /// A record was created.
    RecordCreate,
    /// A new record version was written.
    RecordUpdate,
    /// A record was soft-deleted.
    RecordDelete,
    /// A record's integrity was verified.
    VerifyRecord,
    /// A digest was submitted for anchoring.
    Anchor,
    /// A dead-lettered anchor job was replayed.
    AnchorReplay,
}

impl AuditAction {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::RecordCreate => "record_create",
            Self::RecordUpdate => "record_update",
            Self::RecordDelete => "record_delete",
            Self::VerifyRecord => "verify_record",
            Self::Anchor => "anchor",
            Self::AnchorReplay => "anchor_replay",
        }
    }
}

/// How it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Completed normally.
    Success,
    /// Completed without the ledger.
    Degraded,
    /// Stored and recomputed content disagree.
    Mismatch,
    /// The referenced resource does not exist.
    NotFound,
    /// The operation failed.
    Failure,
}

/// Severity attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine.
    Info,
    /// Needs attention.
    Warning,
    /// Possible tampering.
    Critical,
}

impl From<AuditOutcome> for Severity {
    fn from(outcome: AuditOutcome) -> Self {
        match outcome {
            AuditOutcome::Success | AuditOutcome::NotFound => Severity::Info,
            AuditOutcome::Degraded | AuditOutcome::Failure => Severity::Warning,
            AuditOutcome::Mismatch => Severity::Critical,
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unique entry id.
    pub id: String,
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Who performed it.
    pub actor_id: String,
    /// What was done.
    pub action: AuditAction,
    /// Record id, digest or other resource reference.
    pub resource_ref: String,
    /// Result of the action.
    pub outcome: AuditOutcome,
    /// Severity, derived from the outcome unless overridden.
    pub severity: Severity,
    /// Free-form context; sanitized before persistence.
    #[serde(default, rename = "sanitizedDetails")]
    pub details: Map<String, Value>,
}

impl AuditEntry {
    /// New entry stamped now, with severity derived from `outcome`.
    pub fn new(
        actor_id: impl Into<String>,
        action: AuditAction,
        resource_ref: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: format!("audit-{}", generate_secure_token(16)),
            timestamp: Utc::now(),
            actor_id: actor_id.into(),
            action,
            resource_ref: resource_ref.into(),
            outcome,
            severity: Severity::from(outcome),
            details: Map::new(),
        }
    }

    /// Adds a detail field.
    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Overrides the severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// UTC day the entry belongs to.
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Audit persistence failures.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    /// Underlying storage failed.
    Io(#[from] io::Error),
    #[error("audit encoding error: {0}")]
    /// Entry could not be serialized or parsed.
    Encoding(String),
    #[error("audit sink lock poisoned")]
    /// A writer panicked while holding the sink lock.
    Poisoned,
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Appends `entry` durably after sanitizing it.
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Records `entry`, logging failures at error level before returning them.
pub fn record_logged(sink: &dyn AuditSink, entry: AuditEntry) -> Result<(), AuditError> {
    let action = entry.action.as_str();
    let resource = entry.resource_ref.clone();
    sink.record(entry).map_err(|err| {
        error!(evt = "AUDIT_WRITE_FAILED", action, resource = %resource, error = %err, "audit entry not persisted");
        err
    })
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Last word of a camelCase, snake_case or kebab-case key, lower-cased.
fn last_word(key: &str) -> String {
    let mut word = String::new();
    let mut prev_lower = false;
    for c in key.chars() {
        if !c.is_ascii_alphanumeric() {
            word.clear();
            prev_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_lower {
            word.clear();
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        word.push(c.to_ascii_lowercase());
    }
    word
}

/// Whether a detail key names sensitive material.
///
/// Any key whose last word is `key` (`sessionKey`, `master_key`) counts,
/// except the few names in [`NON_SECRET_KEY_NAMES`].
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = normalize_key(key);
    SENSITIVE_FIELDS.contains(&normalized.as_str())
        || SENSITIVE_SUFFIXES
            .iter()
            .any(|suffix| normalized.ends_with(suffix))
        || (last_word(key) == "key" && !NON_SECRET_KEY_NAMES.contains(&normalized.as_str()))
}

/// Redacts denied keys at any depth.
pub fn sanitize_details(details: Map<String, Value>) -> Map<String, Value> {
    details
        .into_iter()
        .map(|(key, value)| {
            if is_sensitive_key(&key) {
                (key, Value::String(REDACTED.to_string()))
            } else {
                (key, sanitize_value(value))
            }
        })
        .collect()
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_details(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

fn sanitize(mut entry: AuditEntry) -> AuditEntry {
    entry.details = sanitize_details(std::mem::take(&mut entry.details));
    entry
}

/// JSON-lines audit log with one segment per UTC day.
#[derive(Debug)]
pub struct FileAuditLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuditLog {
    /// Opens (creating if needed) the audit directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the segment for `day`.
    pub fn segment_path(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("audit-{}.jsonl", day.format("%Y-%m-%d")))
    }

    /// All entries written on `day`; a missing segment reads as empty.
    pub fn read_day(&self, day: NaiveDate) -> Result<Vec<AuditEntry>, AuditError> {
        let path = self.segment_path(day);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|err| {
                AuditError::Encoding(format!("{}:{}: {err}", path.display(), idx + 1))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Days that have a segment on disk, oldest first.
    pub fn segments(&self) -> Result<Vec<(NaiveDate, PathBuf)>, AuditError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(day) = name
                .strip_prefix("audit-")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
                .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
            else {
                continue;
            };
            out.push((day, path));
        }
        out.sort();
        Ok(out)
    }

    /// Segments older than the retention window relative to `today`.  Nothing is deleted.
    pub fn expired_segments(&self, today: NaiveDate) -> Result<Vec<PathBuf>, AuditError> {
        let cutoff = today - ChronoDuration::days(RETENTION_DAYS);
        Ok(self
            .segments()?
            .into_iter()
            .filter(|(day, _)| *day < cutoff)
            .map(|(_, path)| path)
            .collect())
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let entry = sanitize(entry);
        let mut line =
            serde_json::to_vec(&entry).map_err(|err| AuditError::Encoding(err.to_string()))?;
        line.push(b'\n');
        let path = self.segment_path(entry.day());
        let _guard = self.write_lock.lock().map_err(|_| AuditError::Poisoned)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }
}

/// In-memory sink for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded entries.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Entries for one action.
    pub fn by_action(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.action == action)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let entry = sanitize(entry);
        self.entries
            .write()
            .map_err(|_| AuditError::Poisoned)?
            .push(entry);
        Ok(())
    }
}
