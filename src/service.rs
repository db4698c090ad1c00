//! Record lifecycle with encryption, hashing, anchoring and auditing wired together.

use crate::anchor_queue::{
    anchor_audit_entry, apply_anchor_result, AnchorJob, AnchorQueue, AnchorQueueConfig, AnchorQueueError, Enqueued,
    ReplaySummary, QUEUE_FULL,
};
use crate::audit::{
    record_logged, AuditAction, AuditEntry, AuditError, AuditOutcome, AuditSink, FileAuditLog,
};
use crate::canonical::{self, CanonicalError, ContentDigest};
use crate::config::{Config, ConfigError};
use crate::crypto::{generate_secure_token, CryptoBox, CryptoError, EncryptedPayload};
use crate::envelope::{
    AnchorStatus, EnvelopeError, MedicalRecordEnvelope, RecordVersion, StoredRecordFields,
};
use crate::ledger::{AnchorError, AnchorEvent, AnchorReference, LedgerAnchor, LedgerHealth};
use crate::store::{FileRecordStore, RecordStore, StoreError};
use crate::verifier::{IntegrityVerifier, VerificationReport, VerifyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Service failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("record {0} not found")]
    /// No such record or version.
    NotFound(String),
    #[error("record {0} is deleted")]
    /// The record was soft-deleted.
    Deleted(String),
    #[error("invalid record: {0}")]
    /// Record fields must be a JSON object.
    InvalidRecord(String),
    #[error(transparent)]
    /// Encryption or decryption failed.
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    /// Content could not be canonicalized.
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    /// Storage failed.
    Store(StoreError),
    #[error(transparent)]
    /// An audit entry could not be persisted.
    Audit(#[from] AuditError),
    #[error(transparent)]
    /// Manual anchoring failed.
    Anchor(#[from] AnchorError),
    #[error(transparent)]
    /// Anchor queue failure.
    Queue(#[from] AnchorQueueError),
    #[error(transparent)]
    /// Verification failed hard.
    Verify(#[from] VerifyError),
    #[error(transparent)]
    /// Startup configuration failed.
    Config(#[from] ConfigError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Envelope(EnvelopeError::Deleted(id)) => Self::Deleted(id),
            StoreError::Envelope(EnvelopeError::UnknownVersion(v)) => {
                Self::NotFound(format!("version {v}"))
            }
            other => Self::Store(other),
        }
    }
}

/// Result of a create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    /// Record id.
    pub record_id: String,
    /// Stored integrity fields of the written version.
    pub stored: StoredRecordFields,
    /// Anchoring status right after the write.
    pub anchor_status: AnchorStatus,
}

/// Result of a manual anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    /// Transaction id.
    pub transaction_id: String,
    /// Block number.
    pub block_ref: u64,
    /// Ledger timestamp, unix seconds.
    pub timestamp: u64,
}

/// One line of a record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Stored integrity fields.
    #[serde(flatten)]
    pub fields: StoredRecordFields,
    /// Anchoring status.
    pub anchor_status: AnchorStatus,
    /// Write time.
    pub created_at: DateTime<Utc>,
    /// Writer.
    pub created_by: String,
}

/// Medical record service.
pub struct RecordIntegrityService {
    crypto: Arc<CryptoBox>,
    store: Arc<dyn RecordStore>,
    ledger: Arc<LedgerAnchor>,
    audit: Arc<dyn AuditSink>,
    verifier: IntegrityVerifier,
    queue: AnchorQueue,
}

impl RecordIntegrityService {
    /// Wires the service and spawns the anchor worker on the current runtime.
    pub fn new(
        crypto: Arc<CryptoBox>,
        store: Arc<dyn RecordStore>,
        ledger: Arc<LedgerAnchor>,
        audit: Arc<dyn AuditSink>,
        queue_config: AnchorQueueConfig,
    ) -> Self {
        hydrate_anchor_index(&*store, &ledger);
        let verifier = IntegrityVerifier::new(
            crypto.clone(),
            store.clone(),
            ledger.clone(),
            audit.clone(),
        );
        let queue = AnchorQueue::spawn(ledger.clone(), store.clone(), audit.clone(), queue_config);
        Self {
            crypto,
            store,
            ledger,
            audit,
            verifier,
            queue,
        }
    }

    /// Builds file-backed storage and audit plus the ledger from `config`.
    pub async fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let crypto = Arc::new(config.crypto_box()?);
        let store: Arc<dyn RecordStore> = Arc::new(FileRecordStore::open(&config.data_dir)?);
        let audit: Arc<dyn AuditSink> = Arc::new(FileAuditLog::open(&config.audit_dir)?);
        let ledger = Arc::new(LedgerAnchor::connect(config.ledger_settings()).await);
        let queue_config = AnchorQueueConfig {
            capacity: config.anchor_queue_capacity,
            job_attempts: config.anchor_job_attempts,
            dead_letter_path: Some(config.dead_letter_path.clone()),
            ..AnchorQueueConfig::default()
        };
        Ok(Self::new(crypto, store, ledger, audit, queue_config))
    }

    /// Ledger anchor in use.
    pub fn ledger(&self) -> &LedgerAnchor {
        &self.ledger
    }

    /// Creates a record under a fresh id.
    pub fn create_record(
        &self,
        kind: &str,
        fields: &Value,
        actor: &str,
    ) -> Result<WriteReceipt, ServiceError> {
        let id = format!("rec-{}", generate_secure_token(12));
        self.create_record_with_id(&id, kind, fields, actor)
    }

    /// Creates a record under a caller-chosen id.
    pub fn create_record_with_id(
        &self,
        id: &str,
        kind: &str,
        fields: &Value,
        actor: &str,
    ) -> Result<WriteReceipt, ServiceError> {
        let (payload, digest) = self.seal(id, fields, actor)?;
        let envelope =
            MedicalRecordEnvelope::new(id, kind, RecordVersion::new(1, payload, digest, actor));
        let inserted = self.store.insert(envelope);
        let outcome = if inserted.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let logged = record_logged(
            &*self.audit,
            AuditEntry::new(actor, AuditAction::RecordCreate, id, outcome)
                .detail("kind", kind)
                .detail("digest", digest.to_hex()),
        );
        inserted?;
        info!(evt = "RECORD_CREATE", record = id, %digest, "record stored");
        // A persisted version is always scheduled, even when its audit line failed.
        let receipt = self.schedule_anchor(id, 1, digest, actor)?;
        logged?;
        Ok(receipt)
    }

    /// Writes a new version of an existing record.
    pub fn update_record(
        &self,
        id: &str,
        fields: &Value,
        actor: &str,
    ) -> Result<WriteReceipt, ServiceError> {
        let existing = self.load(id)?;
        if existing.is_deleted() {
            return Err(ServiceError::Deleted(id.to_string()));
        }
        let (payload, digest) = self.seal(id, fields, actor)?;
        let mut version = 0;
        let updated = self.store.update(id, &mut |env| {
            version = env.push_version(payload.clone(), digest, actor)?;
            Ok(())
        });
        let outcome = if updated.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let logged = record_logged(
            &*self.audit,
            AuditEntry::new(actor, AuditAction::RecordUpdate, id, outcome)
                .detail("version", version)
                .detail("digest", digest.to_hex()),
        );
        updated?;
        info!(evt = "RECORD_UPDATE", record = id, version, %digest, "record version stored");
        let receipt = self.schedule_anchor(id, version, digest, actor)?;
        logged?;
        Ok(receipt)
    }

    /// Soft-deletes a record.  Its versions stay verifiable.
    pub fn delete_record(&self, id: &str, actor: &str) -> Result<(), ServiceError> {
        let deleted = self.store.update(id, &mut |env| env.soft_delete(actor));
        let outcome = match &deleted {
            Ok(_) => AuditOutcome::Success,
            Err(StoreError::NotFound(_)) => AuditOutcome::NotFound,
            Err(_) => AuditOutcome::Failure,
        };
        record_logged(
            &*self.audit,
            AuditEntry::new(actor, AuditAction::RecordDelete, id, outcome),
        )?;
        deleted?;
        Ok(())
    }

    /// Decrypts the current version.
    pub fn read_record(&self, id: &str, actor: &str) -> Result<Value, ServiceError> {
        let envelope = self.load(id)?;
        if envelope.is_deleted() {
            return Err(ServiceError::Deleted(id.to_string()));
        }
        self.open(id, envelope.current(), actor)
    }

    /// Decrypts a historical version.
    pub fn read_version(&self, id: &str, version: u32, actor: &str) -> Result<Value, ServiceError> {
        let envelope = self.load(id)?;
        let target = envelope
            .version(version)
            .ok_or_else(|| ServiceError::NotFound(format!("{id} version {version}")))?;
        self.open(id, target, actor)
    }

    /// Version history, oldest first.
    pub fn history(&self, id: &str) -> Result<Vec<HistoryEntry>, ServiceError> {
        let envelope = self.load(id)?;
        Ok(envelope
            .versions()
            .map(|v| HistoryEntry {
                fields: v.stored_fields(),
                anchor_status: v.anchor_status,
                created_at: v.created_at,
                created_by: v.created_by.clone(),
            })
            .collect())
    }

    /// Anchors the current version now, bypassing the queue.
    pub async fn anchor_record(&self, id: &str, actor: &str) -> Result<AnchorReceipt, ServiceError> {
        let envelope = self.load(id)?;
        let current = envelope.current();
        let digest = current.digest;
        let job = AnchorJob::new(id, current.version, digest, actor);
        let result = self.ledger.anchor(&digest).await;
        apply_anchor_result(&*self.store, &*self.audit, &job, &result);
        let reference = result?;
        Ok(AnchorReceipt {
            transaction_id: reference.transaction_id,
            block_ref: reference.block_number,
            timestamp: reference.anchored_at,
        })
    }

    /// Verifies the current version.
    pub async fn verify_record(
        &self,
        id: &str,
        actor: &str,
    ) -> Result<VerificationReport, ServiceError> {
        self.verifier
            .verify_record(id, actor)
            .await
            .map_err(not_found_to_service)
    }

    /// Verifies a historical version.
    pub async fn verify_version(
        &self,
        id: &str,
        version: u32,
        actor: &str,
    ) -> Result<VerificationReport, ServiceError> {
        self.verifier
            .verify_version(id, version, actor)
            .await
            .map_err(not_found_to_service)
    }

    /// Ledger connectivity.
    pub async fn health(&self) -> LedgerHealth {
        self.ledger.check_health().await
    }

    /// Ledger events for the current version's digest.
    pub async fn audit_trail(&self, id: &str) -> Result<Vec<AnchorEvent>, ServiceError> {
        let envelope = self.load(id)?;
        Ok(self.ledger.audit_trail(&envelope.current().digest).await)
    }

    /// Re-enqueues dead-lettered anchor jobs.
    pub fn replay_dead_letters(
        &self,
        state_path: Option<&Path>,
    ) -> Result<ReplaySummary, ServiceError> {
        let summary = self.queue.replay_dead_letters(state_path)?;
        let _ = record_logged(
            &*self.audit,
            AuditEntry::new("system", AuditAction::AnchorReplay, "dead-letters", AuditOutcome::Success)
                .detail("enqueued", summary.enqueued)
                .detail("skipped", summary.skipped)
                .detail("deferred", summary.deferred),
        );
        Ok(summary)
    }

    /// Drains queued anchor jobs and stops the worker.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    fn load(&self, id: &str) -> Result<MedicalRecordEnvelope, ServiceError> {
        self.store
            .get(id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    fn seal(
        &self,
        id: &str,
        fields: &Value,
        actor: &str,
    ) -> Result<(EncryptedPayload, ContentDigest), ServiceError> {
        let result = seal_fields(&self.crypto, fields);
        let entry = match &result {
            Ok((_, digest)) => {
                AuditEntry::new(actor, AuditAction::Encrypt, id, AuditOutcome::Success)
                    .detail("digest", digest.to_hex())
            }
            Err(err) => AuditEntry::new(actor, AuditAction::Encrypt, id, AuditOutcome::Failure)
                .detail("error", err.to_string()),
        };
        record_logged(&*self.audit, entry)?;
        result
    }

    fn open(&self, id: &str, version: &RecordVersion, actor: &str) -> Result<Value, ServiceError> {
        let result = self.crypto.decrypt_json(&version.payload);
        let outcome = if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        record_logged(
            &*self.audit,
            AuditEntry::new(actor, AuditAction::Decrypt, id, outcome).detail("version", version.version),
        )?;
        Ok(result?)
    }

    fn schedule_anchor(
        &self,
        id: &str,
        version: u32,
        digest: ContentDigest,
        actor: &str,
    ) -> Result<WriteReceipt, ServiceError> {
        let job = AnchorJob::new(id, version, digest, actor);
        if !self.ledger.is_enabled() {
            let reason = match self.ledger.state() {
                crate::ledger::LedgerState::Disabled { reason } => reason,
                crate::ledger::LedgerState::Enabled => String::new(),
            };
            apply_anchor_result(
                &*self.store,
                &*self.audit,
                &job,
                &Err(AnchorError::Unavailable(reason)),
            );
        } else {
            match self.queue.enqueue(job.clone()) {
                Ok(Enqueued::Queued) => {}
                Ok(Enqueued::DeadLettered) => apply_anchor_result(
                    &*self.store,
                    &*self.audit,
                    &job,
                    &Err(AnchorError::Deferred(format!("{QUEUE_FULL}; awaiting replay"))),
                ),
                Err(err) => {
                    warn!(evt = "ANCHOR_ENQUEUE_FAILED", record = id, error = %err, "anchor job not queued");
                    apply_anchor_result(
                        &*self.store,
                        &*self.audit,
                        &job,
                        &Err(AnchorError::Protocol(err.to_string())),
                    );
                }
            }
        }
        let envelope = self.load(id)?;
        let written = envelope
            .version(version)
            .ok_or_else(|| ServiceError::NotFound(format!("{id} version {version}")))?;
        Ok(WriteReceipt {
            record_id: id.to_string(),
            stored: written.stored_fields(),
            anchor_status: written.anchor_status,
        })
    }
}

fn seal_fields(
    crypto: &CryptoBox,
    fields: &Value,
) -> Result<(EncryptedPayload, ContentDigest), ServiceError> {
    if !fields.is_object() {
        return Err(ServiceError::InvalidRecord(
            "record fields must be a JSON object".into(),
        ));
    }
    let digest = canonical::digest(fields)?;
    let payload = crypto.encrypt_json(fields)?;
    Ok((payload, digest))
}

/// Seals a document that belongs to no record, auditing the encryption under
/// its content digest.
pub fn seal_document(
    crypto: &CryptoBox,
    audit: &dyn AuditSink,
    fields: &Value,
    actor: &str,
) -> Result<EncryptedPayload, ServiceError> {
    let result = seal_fields(crypto, fields);
    let entry = match &result {
        Ok((_, digest)) => {
            AuditEntry::new(actor, AuditAction::Encrypt, digest.to_hex(), AuditOutcome::Success)
                .detail("digest", digest.to_hex())
        }
        Err(err) => AuditEntry::new(actor, AuditAction::Encrypt, "document", AuditOutcome::Failure)
            .detail("error", err.to_string()),
    };
    record_logged(audit, entry)?;
    Ok(result?.0)
}

/// Anchors a bare digest and audits the outcome under the digest's hex form.
pub async fn anchor_digest(
    ledger: &LedgerAnchor,
    audit: &dyn AuditSink,
    digest: &ContentDigest,
    actor: &str,
) -> Result<AnchorReference, ServiceError> {
    let result = ledger.anchor(digest).await;
    if let Err(err) = &result {
        warn!(evt = "ANCHOR_DIGEST_FAILED", %digest, error = %err, "digest not anchored");
    }
    let logged = record_logged(audit, anchor_audit_entry(actor, &digest.to_hex(), &result));
    let reference = result?;
    logged?;
    Ok(reference)
}

fn not_found_to_service(err: VerifyError) -> ServiceError {
    match err {
        VerifyError::NotFound(id) => ServiceError::NotFound(id),
        VerifyError::VersionNotFound { id, version } => {
            ServiceError::NotFound(format!("{id} version {version}"))
        }
        other => ServiceError::Verify(other),
    }
}

fn hydrate_anchor_index(store: &dyn RecordStore, ledger: &LedgerAnchor) {
    let ids = match store.ids() {
        Ok(ids) => ids,
        Err(err) => {
            warn!(evt = "ANCHOR_INDEX_SKIPPED", error = %err, "could not list records");
            return;
        }
    };
    let mut remembered = 0usize;
    for id in ids {
        let Ok(Some(envelope)) = store.get(&id) else {
            continue;
        };
        for version in envelope.versions() {
            if let Some(anchor) = &version.anchor {
                ledger.remember(version.digest, anchor.clone());
                remembered += 1;
            }
        }
    }
    if remembered > 0 {
        info!(evt = "ANCHOR_INDEX_LOADED", remembered, "local anchor index hydrated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::store::MemoryRecordStore;
    use crate::verifier::{AnchorCheck, VerificationOutcome};
    use serde_json::json;

    fn service() -> (RecordIntegrityService, Arc<MemoryAuditSink>, Arc<MemoryRecordStore>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let store = Arc::new(MemoryRecordStore::new());
        let svc = RecordIntegrityService::new(
            Arc::new(CryptoBox::new(&[4u8; 32]).unwrap()),
            store.clone(),
            Arc::new(LedgerAnchor::disabled("ledger not configured")),
            audit.clone(),
            AnchorQueueConfig::default(),
        );
        (svc, audit, store)
    }

    #[tokio::test]
    async fn create_read_round_trip_without_ledger() {
        let (svc, audit, _) = service();
        let body = json!({"diagnosis": "flu"});
        let receipt = svc.create_record("patient", &body, "dr-1").unwrap();
        assert_eq!(receipt.anchor_status, AnchorStatus::Unavailable);
        assert_eq!(receipt.stored.version, 1);
        assert_eq!(receipt.stored.digest, canonical::digest(&body).unwrap().to_hex());
        assert_eq!(svc.read_record(&receipt.record_id, "dr-1").unwrap(), body);

        let actions = audit
            .entries()
            .into_iter()
            .map(|e| e.action)
            .collect::<Vec<_>>();
        assert_eq!(
            actions,
            vec![
                AuditAction::Encrypt,
                AuditAction::RecordCreate,
                AuditAction::Anchor,
                AuditAction::Decrypt
            ]
        );
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn updates_keep_per_version_digests() {
        let (svc, _, _) = service();
        svc.create_record_with_id("p-1", "patient", &json!({"v": 1}), "dr")
            .unwrap();
        let second = svc.update_record("p-1", &json!({"v": 2}), "dr").unwrap();
        assert_eq!(second.stored.version, 2);
        let history = svc.history("p-1").unwrap();
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].fields.digest, history[1].fields.digest);
        assert_eq!(svc.read_version("p-1", 1, "dr").unwrap(), json!({"v": 1}));

        let report = svc.verify_version("p-1", 1, "auditor").await.unwrap();
        assert!(report.local_integrity);
        assert_eq!(report.outcome, VerificationOutcome::Degraded);
        assert_eq!(report.anchor_status, AnchorCheck::Unavailable);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn soft_delete_blocks_reads_and_writes() {
        let (svc, audit, _) = service();
        svc.create_record_with_id("p-2", "patient", &json!({"a": 1}), "dr")
            .unwrap();
        svc.delete_record("p-2", "admin").unwrap();
        assert!(matches!(
            svc.read_record("p-2", "dr"),
            Err(ServiceError::Deleted(_))
        ));
        assert!(matches!(
            svc.update_record("p-2", &json!({"a": 2}), "dr"),
            Err(ServiceError::Deleted(_))
        ));
        assert!(matches!(
            svc.delete_record("p-2", "admin"),
            Err(ServiceError::Deleted(_))
        ));
        assert!(matches!(
            svc.delete_record("nope", "admin"),
            Err(ServiceError::NotFound(_))
        ));
        let report = svc.verify_record("p-2", "auditor").await.unwrap();
        assert!(report.deleted);
        let deletes = audit.by_action(AuditAction::RecordDelete);
        assert_eq!(deletes.len(), 3);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn non_object_fields_rejected_and_audited() {
        let (svc, audit, _) = service();
        let err = svc.create_record("patient", &json!([1, 2]), "dr").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRecord(_)));
        let encrypts = audit.by_action(AuditAction::Encrypt);
        assert_eq!(encrypts.len(), 1);
        assert_eq!(encrypts[0].outcome, AuditOutcome::Failure);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn manual_anchor_on_disabled_ledger_is_typed_failure() {
        let (svc, audit, _) = service();
        svc.create_record_with_id("p-3", "patient", &json!({"a": 1}), "dr")
            .unwrap();
        let err = svc.anchor_record("p-3", "dr").await.unwrap_err();
        assert!(matches!(err, ServiceError::Anchor(AnchorError::Unavailable(_))));
        assert!(matches!(
            svc.anchor_record("missing", "dr").await,
            Err(ServiceError::NotFound(_))
        ));
        assert_eq!(audit.by_action(AuditAction::Anchor).len(), 2);
        assert!(!svc.health().await.reachable);
        assert!(svc.audit_trail("p-3").await.unwrap().is_empty());
        svc.shutdown().await;
    }

    struct RefusingAudit {
        inner: MemoryAuditSink,
        refuse: Vec<AuditAction>,
    }

    impl AuditSink for RefusingAudit {
        fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
            if self.refuse.contains(&entry.action) {
                return Err(AuditError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.record(entry)
        }
    }

    #[tokio::test]
    async fn failed_write_audit_still_schedules_anchor() {
        let audit = Arc::new(RefusingAudit {
            inner: MemoryAuditSink::new(),
            refuse: vec![AuditAction::RecordCreate, AuditAction::RecordUpdate],
        });
        let store = Arc::new(MemoryRecordStore::new());
        let svc = RecordIntegrityService::new(
            Arc::new(CryptoBox::new(&[4u8; 32]).unwrap()),
            store.clone(),
            Arc::new(LedgerAnchor::disabled("ledger not configured")),
            audit.clone(),
            AnchorQueueConfig::default(),
        );

        let err = svc
            .create_record_with_id("p-5", "patient", &json!({"a": 1}), "dr")
            .unwrap_err();
        assert!(matches!(err, ServiceError::Audit(_)));
        let err = svc.update_record("p-5", &json!({"a": 2}), "dr").unwrap_err();
        assert!(matches!(err, ServiceError::Audit(_)));

        let env = store.get("p-5").unwrap().unwrap();
        assert_eq!(env.versions().count(), 2);
        assert!(env
            .versions()
            .all(|v| v.anchor_status == AnchorStatus::Unavailable));
        assert_eq!(audit.inner.by_action(AuditAction::Anchor).len(), 2);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_marks_version_failed_until_replayed() {
        use crate::devnet::{spawn_devnet, DevnetConfig, DEFAULT_CHAIN_ID};
        use crate::ledger::LedgerSettings;

        let node = spawn_devnet(DevnetConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_CHAIN_ID,
        ))
        .await
        .unwrap();
        let ledger = LedgerAnchor::connect(LedgerSettings {
            node_url: Some(node.url()),
            contract_address: Some(node.contract().to_string()),
            admin_address: Some("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".into()),
            admin_private_key: Some(
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".into(),
            ),
            receipt_poll_ms: 20,
            ..LedgerSettings::default()
        })
        .await;
        assert!(ledger.is_enabled());

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let outbox = std::env::temp_dir().join(format!("medledger_service_full_{nanos}.jsonl"));
        let state = outbox.with_extension("state.json");
        let audit = Arc::new(MemoryAuditSink::new());
        let svc = RecordIntegrityService::new(
            Arc::new(CryptoBox::new(&[4u8; 32]).unwrap()),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(ledger),
            audit.clone(),
            AnchorQueueConfig {
                capacity: 1,
                dead_letter_path: Some(outbox.clone()),
                ..AnchorQueueConfig::default()
            },
        );

        // The worker cannot run before the next await, so "a" fills the queue.
        let a = svc
            .create_record_with_id("a", "patient", &json!({"n": 1}), "dr")
            .unwrap();
        assert_eq!(a.anchor_status, AnchorStatus::Pending);
        let b = svc
            .create_record_with_id("b", "patient", &json!({"n": 2}), "dr")
            .unwrap();
        assert_eq!(b.anchor_status, AnchorStatus::Failed);
        let deferred = audit
            .by_action(AuditAction::Anchor)
            .into_iter()
            .filter(|e| e.resource_ref == "b")
            .collect::<Vec<_>>();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].outcome, AuditOutcome::Failure);

        for _ in 0..200 {
            if svc.history("a").unwrap()[0].anchor_status == AnchorStatus::Anchored {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let summary = svc.replay_dead_letters(Some(&state)).unwrap();
        assert_eq!(summary.enqueued, 1);
        assert_eq!(summary.deferred, 0);
        svc.shutdown().await;

        for id in ["a", "b"] {
            assert_eq!(svc.history(id).unwrap()[0].anchor_status, AnchorStatus::Anchored);
        }
        let _ = std::fs::remove_file(outbox);
        let _ = std::fs::remove_file(state);
    }

    #[tokio::test]
    async fn verify_unknown_record_is_not_found() {
        let (svc, _, _) = service();
        assert!(matches!(
            svc.verify_record("ghost", "auditor").await,
            Err(ServiceError::NotFound(_))
        ));
        svc.shutdown().await;
    }
}
