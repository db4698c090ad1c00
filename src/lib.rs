#![deny(missing_docs)]

//! # medledger
//!
//! Integrity core for medical records.  Record bodies are sealed with
//! AES-256-GCM, fingerprinted with a canonical SHA-256 digest, and the digest
//! is anchored on an EVM ledger contract so that later tampering with either
//! the ciphertext or the stored digest is detectable.  Every sensitive step
//! lands in a sanitized, append-only audit trail.
//!
//! ## Pieces
//!
//! * [`crypto`]: `CryptoBox` authenticated encryption, secure tokens and
//!   Argon2id credential hashing.
//! * [`canonical`]: order-independent content digests.
//! * [`ledger`]: `LedgerAnchor`, a retrying JSON-RPC client for the
//!   `storeHash`/`verifyHash` contract that degrades to a disabled state
//!   instead of failing callers.
//! * [`anchor_queue`]: background anchoring with a dead-letter outbox.
//! * [`verifier`]: `IntegrityVerifier`, which re-derives digests and
//!   cross-checks them against the ledger.
//! * [`audit`]: `AuditSink` implementations with daily JSONL segments.
//! * [`service`]: record lifecycle wiring the above together.
//! * [`devnet`]: an in-process JSON-RPC node hosting the anchor contract,
//!   used by the CLI and tests.
//!
//! ## Usage
//!
//! ```rust
//! use medledger::{canonical, CryptoBox};
//! use serde_json::json;
//!
//! let crypto = CryptoBox::new(&[7u8; 32]).unwrap();
//! let record = json!({"patient": "p-1", "diagnosis": "flu"});
//! let sealed = crypto.encrypt_json(&record).unwrap();
//! assert_eq!(crypto.decrypt_json(&sealed).unwrap(), record);
//!
//! let reordered = json!({"diagnosis": "flu", "patient": "p-1"});
//! assert_eq!(
//!     canonical::digest(&record).unwrap(),
//!     canonical::digest(&reordered).unwrap()
//! );
//! ```

pub mod anchor_queue;
pub mod audit;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod devnet;
pub mod envelope;
pub mod ledger;
pub mod service;
pub mod store;
pub mod verifier;

pub use anchor_queue::{AnchorJob, AnchorQueue, AnchorQueueConfig, AnchorQueueError, Enqueued};
pub use audit::{
    AuditAction, AuditEntry, AuditError, AuditOutcome, AuditSink, FileAuditLog, MemoryAuditSink,
    Severity,
};
pub use canonical::{CanonicalError, ContentDigest};
pub use config::{Config, ConfigError};
pub use crypto::{
    CredentialHasher, CryptoBox, CryptoError, EncryptedPayload, EncryptionKey, PasswordCost,
};
pub use devnet::{spawn_devnet, DevnetConfig, DevnetHandle};
pub use envelope::{AnchorStatus, MedicalRecordEnvelope, RecordVersion, StoredRecordFields};
pub use ledger::{
    AnchorError, AnchorEvent, AnchorReference, AnchorVerification, LedgerAnchor, LedgerHealth,
    LedgerSettings, LedgerState,
};
pub use service::{
    anchor_digest, seal_document, AnchorReceipt, RecordIntegrityService, ServiceError,
    WriteReceipt,
};
pub use store::{FileRecordStore, MemoryRecordStore, RecordStore, StoreError};
pub use verifier::{
    AnchorCheck, IntegrityVerifier, VerificationOutcome, VerificationReport, VerifyResponse,
};
