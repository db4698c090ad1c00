//! Integrity verification of stored records.
//!
//! A verification walks `Fetching → Recomputing → CrossChecking → Reported`.
//! Only a missing record is an error; tampering and ledger outages are
//! outcomes carried in the [`VerificationReport`].  Every request, including
//! not-found ones, leaves an audit entry.

use crate::audit::{record_logged, AuditAction, AuditEntry, AuditOutcome, AuditSink, Severity};
use crate::canonical::{self, ContentDigest};
use crate::crypto::CryptoBox;
use crate::envelope::RecordVersion;
use crate::ledger::{AnchorReference, LedgerAnchor};
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Final classification of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// Content and ledger agree.
    Verified,
    /// Content was altered, or the recorded anchor is missing from the ledger
    /// or disagrees with it.
    Mismatch,
    /// Content is intact but the ledger could not be consulted.
    Degraded,
}

/// What the ledger said about the stored digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorCheck {
    /// The digest is on the ledger.
    Verified,
    /// The ledger does not know the digest.
    Absent,
    /// The ledger is disabled or unreachable.
    Unavailable,
}

/// Verification state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPhase {
    /// Loading the record.
    Fetching,
    /// Decrypting and re-hashing.
    Recomputing,
    /// Consulting the ledger.
    CrossChecking,
    /// Report produced.
    Reported,
}

impl VerifyPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Recomputing => "recomputing",
            Self::CrossChecking => "cross_checking",
            Self::Reported => "reported",
        }
    }
}

/// Full verification result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Record id.
    pub record_id: String,
    /// Version verified.
    pub version: u32,
    /// Overall outcome.
    pub outcome: VerificationOutcome,
    /// Whether the recomputed digest equals the stored one.
    pub local_integrity: bool,
    /// Ledger cross-check result.
    pub anchor_status: AnchorCheck,
    /// Digest of the decrypted content; `None` when decryption failed.
    pub computed_digest: Option<ContentDigest>,
    /// Digest stored with the version.
    pub stored_digest: ContentDigest,
    /// Anchor recorded with the version.
    pub anchor_reference: Option<AnchorReference>,
    /// Timestamp the ledger holds for the stored digest.
    pub ledger_anchored_at: Option<u64>,
    /// False when the recorded anchor's timestamp differs from the ledger's.
    pub anchor_reference_consistent: bool,
    /// Whether the record is soft-deleted.
    pub deleted: bool,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

/// Integrity block of [`VerifyResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    /// The ledger holds the stored digest.
    pub exists: bool,
    /// Ledger timestamp.
    pub anchored_at: Option<u64>,
    /// Local content is intact.
    pub integrity_check: bool,
}

/// Wire shape of a verification answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    /// Record id.
    pub record_id: String,
    /// Result.
    pub verification: VerificationSummary,
}

impl From<&VerificationReport> for VerifyResponse {
    fn from(report: &VerificationReport) -> Self {
        Self {
            record_id: report.record_id.clone(),
            verification: VerificationSummary {
                exists: report.anchor_status == AnchorCheck::Verified,
                anchored_at: report.ledger_anchored_at,
                integrity_check: report.local_integrity
                    && report.outcome != VerificationOutcome::Mismatch,
            },
        }
    }
}

/// Hard verification failures.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("record {0} not found")]
    /// No such record.
    NotFound(String),
    #[error("record {id} has no version {version}")]
    /// No such version.
    VersionNotFound {
        /// Record id.
        id: String,
        /// Requested version.
        version: u32,
    },
    #[error("record store error: {0}")]
    /// The store could not be read.
    Store(String),
}

/// Re-derives and cross-checks record digests.
pub struct IntegrityVerifier {
    crypto: Arc<CryptoBox>,
    store: Arc<dyn RecordStore>,
    ledger: Arc<LedgerAnchor>,
    audit: Arc<dyn AuditSink>,
}

impl IntegrityVerifier {
    /// Wires the verifier to its collaborators.
    pub fn new(
        crypto: Arc<CryptoBox>,
        store: Arc<dyn RecordStore>,
        ledger: Arc<LedgerAnchor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            crypto,
            store,
            ledger,
            audit,
        }
    }

    /// Verifies the current version of `id`.
    pub async fn verify_record(
        &self,
        id: &str,
        actor: &str,
    ) -> Result<VerificationReport, VerifyError> {
        self.run(id, None, actor).await
    }

    /// Verifies a historical version of `id`.
    pub async fn verify_version(
        &self,
        id: &str,
        version: u32,
        actor: &str,
    ) -> Result<VerificationReport, VerifyError> {
        self.run(id, Some(version), actor).await
    }

    async fn run(
        &self,
        id: &str,
        version: Option<u32>,
        actor: &str,
    ) -> Result<VerificationReport, VerifyError> {
        phase(id, VerifyPhase::Fetching);
        let envelope = match self.store.get(id) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                self.audit_not_found(id, actor, version);
                return Err(VerifyError::NotFound(id.to_string()));
            }
            Err(err) => {
                let _ = record_logged(
                    &*self.audit,
                    AuditEntry::new(actor, AuditAction::VerifyRecord, id, AuditOutcome::Failure)
                        .detail("error", err.to_string()),
                );
                return Err(VerifyError::Store(err.to_string()));
            }
        };
        let target = match version {
            Some(number) => envelope.version(number),
            None => Some(envelope.current()),
        };
        let Some(target) = target else {
            let number = version.unwrap_or_default();
            self.audit_not_found(id, actor, version);
            return Err(VerifyError::VersionNotFound {
                id: id.to_string(),
                version: number,
            });
        };

        phase(id, VerifyPhase::Recomputing);
        let computed = self.recompute(id, target);
        let local_integrity = computed == Some(target.digest);

        phase(id, VerifyPhase::CrossChecking);
        let (anchor_status, ledger_anchored_at) = self.cross_check(id, &target.digest).await;
        let anchor_reference_consistent = match (&target.anchor, ledger_anchored_at) {
            (Some(recorded), Some(on_ledger)) => recorded.anchored_at == on_ledger,
            _ => true,
        };
        if !anchor_reference_consistent {
            warn!(
                evt = "VERIFY_ANCHOR_TIMESTAMP_DIFF",
                record = id,
                version = target.version,
                recorded = target.anchor.as_ref().map(|a| a.anchored_at),
                ledger = ledger_anchored_at,
                "recorded anchor disagrees with the ledger"
            );
        }

        let outcome = if !local_integrity {
            VerificationOutcome::Mismatch
        } else if target.anchor.is_some() && anchor_status == AnchorCheck::Absent {
            VerificationOutcome::Mismatch
        } else if !anchor_reference_consistent {
            VerificationOutcome::Mismatch
        } else if anchor_status == AnchorCheck::Unavailable {
            VerificationOutcome::Degraded
        } else {
            VerificationOutcome::Verified
        };

        let report = VerificationReport {
            record_id: id.to_string(),
            version: target.version,
            outcome,
            local_integrity,
            anchor_status,
            computed_digest: computed,
            stored_digest: target.digest,
            anchor_reference: target.anchor.clone(),
            ledger_anchored_at,
            anchor_reference_consistent,
            deleted: envelope.is_deleted(),
            checked_at: Utc::now(),
        };
        self.audit_report(&report, actor);
        phase(id, VerifyPhase::Reported);
        Ok(report)
    }

    fn recompute(&self, id: &str, target: &RecordVersion) -> Option<ContentDigest> {
        let value = match self.crypto.decrypt_json(&target.payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(evt = "VERIFY_DECRYPT_FAILED", record = id, version = target.version, error = %err, "stored payload does not decrypt");
                return None;
            }
        };
        match canonical::digest(&value) {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(evt = "VERIFY_HASH_FAILED", record = id, error = %err, "decrypted payload could not be hashed");
                None
            }
        }
    }

    async fn cross_check(&self, id: &str, digest: &ContentDigest) -> (AnchorCheck, Option<u64>) {
        if !self.ledger.is_enabled() {
            return (AnchorCheck::Unavailable, None);
        }
        match self.ledger.verify(digest).await {
            Ok(found) if found.exists => (AnchorCheck::Verified, found.anchored_at),
            Ok(_) => (AnchorCheck::Absent, None),
            Err(err) => {
                warn!(evt = "VERIFY_LEDGER_UNAVAILABLE", record = id, error = %err, "ledger cross-check skipped");
                (AnchorCheck::Unavailable, None)
            }
        }
    }

    fn audit_report(&self, report: &VerificationReport, actor: &str) {
        let outcome = match report.outcome {
            VerificationOutcome::Verified => AuditOutcome::Success,
            VerificationOutcome::Degraded => AuditOutcome::Degraded,
            VerificationOutcome::Mismatch => AuditOutcome::Mismatch,
        };
        let mut entry = AuditEntry::new(actor, AuditAction::VerifyRecord, &report.record_id, outcome)
            .detail("version", report.version)
            .detail("storedDigest", report.stored_digest.to_hex())
            .detail(
                "computedDigest",
                report
                    .computed_digest
                    .map(|d| d.to_hex())
                    .map_or(serde_json::Value::Null, serde_json::Value::String),
            )
            .detail("localIntegrity", report.local_integrity)
            .detail("anchorReferenceConsistent", report.anchor_reference_consistent)
            .detail(
                "anchorStatus",
                serde_json::to_value(report.anchor_status).unwrap_or(serde_json::Value::Null),
            );
        if report.outcome == VerificationOutcome::Mismatch {
            error!(
                evt = "INTEGRITY_MISMATCH",
                record = %report.record_id,
                version = report.version,
                local_integrity = report.local_integrity,
                "record failed integrity verification"
            );
            entry = entry.severity(Severity::Critical);
        }
        let _ = record_logged(&*self.audit, entry);
    }

    fn audit_not_found(&self, id: &str, actor: &str, version: Option<u32>) {
        let mut entry = AuditEntry::new(actor, AuditAction::VerifyRecord, id, AuditOutcome::NotFound);
        if let Some(version) = version {
            entry = entry.detail("version", version);
        }
        let _ = record_logged(&*self.audit, entry);
    }
}

fn phase(id: &str, phase: VerifyPhase) {
    debug!(evt = "VERIFY_PHASE", record = id, phase = phase.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::devnet::{spawn_devnet, DevnetConfig, DevnetHandle, DEFAULT_CHAIN_ID};
    use crate::envelope::MedicalRecordEnvelope;
    use crate::ledger::LedgerSettings;
    use crate::store::MemoryRecordStore;
    use serde_json::{json, Value};

    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDR: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    struct Fixture {
        crypto: Arc<CryptoBox>,
        store: Arc<MemoryRecordStore>,
        audit: Arc<MemoryAuditSink>,
        ledger: Arc<LedgerAnchor>,
    }

    impl Fixture {
        fn new(ledger: LedgerAnchor) -> Self {
            Self {
                crypto: Arc::new(CryptoBox::new(&[9u8; 32]).unwrap()),
                store: Arc::new(MemoryRecordStore::new()),
                audit: Arc::new(MemoryAuditSink::new()),
                ledger: Arc::new(ledger),
            }
        }

        fn verifier(&self) -> IntegrityVerifier {
            IntegrityVerifier::new(
                self.crypto.clone(),
                self.store.clone(),
                self.ledger.clone(),
                self.audit.clone(),
            )
        }

        fn put(&self, id: &str, body: &Value, stored_digest: ContentDigest) {
            let version = RecordVersion::new(
                1,
                self.crypto.encrypt_json(body).unwrap(),
                stored_digest,
                "dr",
            );
            self.store
                .insert(MedicalRecordEnvelope::new(id, "patient", version))
                .unwrap();
        }
    }

    async fn enabled_ledger(node: &DevnetHandle) -> LedgerAnchor {
        LedgerAnchor::connect(LedgerSettings {
            node_url: Some(node.url()),
            contract_address: Some(node.contract().to_string()),
            admin_address: Some(DEV_ADDR.into()),
            admin_private_key: Some(DEV_KEY.into()),
            receipt_poll_ms: 20,
            ..LedgerSettings::default()
        })
        .await
    }

    #[tokio::test]
    async fn disabled_ledger_degrades_but_keeps_local_integrity() {
        let fx = Fixture::new(LedgerAnchor::disabled("not configured"));
        let body = json!({"diagnosis": "flu"});
        fx.put("r1", &body, canonical::digest(&body).unwrap());

        let report = fx.verifier().verify_record("r1", "auditor").await.unwrap();
        assert_eq!(report.outcome, VerificationOutcome::Degraded);
        assert!(report.local_integrity);
        assert_eq!(report.anchor_status, AnchorCheck::Unavailable);

        let response = VerifyResponse::from(&report);
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["recordId"], json!("r1"));
        assert_eq!(wire["verification"]["integrityCheck"], json!(true));
        assert_eq!(wire["verification"]["exists"], json!(false));

        let entries = fx.audit.by_action(AuditAction::VerifyRecord);
        assert_eq!(entries[0].outcome, AuditOutcome::Degraded);
    }

    #[tokio::test]
    async fn corrupted_digest_is_reported_not_thrown() {
        let fx = Fixture::new(LedgerAnchor::disabled("not configured"));
        let body = json!({"diagnosis": "flu"});
        let tampered = canonical::digest(&json!({"diagnosis": "cold"})).unwrap();
        fx.put("r1", &body, tampered);

        let report = fx.verifier().verify_record("r1", "auditor").await.unwrap();
        assert_eq!(report.outcome, VerificationOutcome::Mismatch);
        assert!(!report.local_integrity);
        assert_eq!(report.computed_digest, Some(canonical::digest(&body).unwrap()));

        let entries = fx.audit.by_action(AuditAction::VerifyRecord);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Critical);
        assert_eq!(entries[0].outcome, AuditOutcome::Mismatch);
    }

    #[tokio::test]
    async fn undecryptable_payload_is_a_mismatch() {
        let fx = Fixture::new(LedgerAnchor::disabled("not configured"));
        let body = json!({"a": 1});
        let other = CryptoBox::new(&[1u8; 32]).unwrap();
        let version = RecordVersion::new(
            1,
            other.encrypt_json(&body).unwrap(),
            canonical::digest(&body).unwrap(),
            "dr",
        );
        fx.store
            .insert(MedicalRecordEnvelope::new("r9", "patient", version))
            .unwrap();
        let report = fx.verifier().verify_record("r9", "auditor").await.unwrap();
        assert_eq!(report.outcome, VerificationOutcome::Mismatch);
        assert_eq!(report.computed_digest, None);
    }

    #[tokio::test]
    async fn unknown_record_is_not_found_and_audited() {
        let fx = Fixture::new(LedgerAnchor::disabled("not configured"));
        let err = fx.verifier().verify_record("ghost", "auditor").await.unwrap_err();
        assert!(matches!(err, VerifyError::NotFound(_)));
        let body = json!({"a": 1});
        fx.put("r1", &body, canonical::digest(&body).unwrap());
        let err = fx.verifier().verify_version("r1", 4, "auditor").await.unwrap_err();
        assert!(matches!(err, VerifyError::VersionNotFound { version: 4, .. }));
        let entries = fx.audit.by_action(AuditAction::VerifyRecord);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.outcome == AuditOutcome::NotFound));
    }

    #[tokio::test]
    async fn anchored_record_verifies_against_ledger() {
        let node = spawn_devnet(DevnetConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_CHAIN_ID,
        ))
        .await
        .unwrap();
        let fx = Fixture::new(enabled_ledger(&node).await);
        let body = json!({"diagnosis": "flu", "severity": 2});
        let d = canonical::digest(&body).unwrap();
        fx.put("r1", &body, d);
        let reference = fx.ledger.anchor(&d).await.unwrap();
        fx.store
            .update("r1", &mut |env| env.set_anchor(1, reference.clone()))
            .unwrap();

        let report = fx.verifier().verify_record("r1", "auditor").await.unwrap();
        assert_eq!(report.outcome, VerificationOutcome::Verified);
        assert_eq!(report.anchor_status, AnchorCheck::Verified);
        assert_eq!(report.ledger_anchored_at, Some(reference.anchored_at));
        assert!(report.anchor_reference_consistent);

        let other = json!({"diagnosis": "none"});
        fx.put("r2", &other, canonical::digest(&other).unwrap());
        let report = fx.verifier().verify_record("r2", "auditor").await.unwrap();
        assert_eq!(report.outcome, VerificationOutcome::Verified);
        assert_eq!(report.anchor_status, AnchorCheck::Absent);
    }

    #[tokio::test]
    async fn recorded_anchor_missing_from_ledger_is_a_mismatch() {
        let node = spawn_devnet(DevnetConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_CHAIN_ID,
        ))
        .await
        .unwrap();
        let fx = Fixture::new(enabled_ledger(&node).await);
        let body = json!({"diagnosis": "flu"});
        fx.put("r1", &body, canonical::digest(&body).unwrap());
        let forged = AnchorReference {
            transaction_id: "0xdeadbeef".into(),
            block_number: 1,
            anchored_at: 1,
        };
        fx.store
            .update("r1", &mut |env| env.set_anchor(1, forged.clone()))
            .unwrap();
        let report = fx.verifier().verify_record("r1", "auditor").await.unwrap();
        assert!(report.local_integrity);
        assert_eq!(report.anchor_status, AnchorCheck::Absent);
        assert_eq!(report.outcome, VerificationOutcome::Mismatch);
    }

    #[tokio::test]
    async fn recorded_anchor_time_must_match_ledger() {
        let node = spawn_devnet(DevnetConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_CHAIN_ID,
        ))
        .await
        .unwrap();
        let fx = Fixture::new(enabled_ledger(&node).await);
        let body = json!({"diagnosis": "flu", "ward": 3});
        let d = canonical::digest(&body).unwrap();
        fx.put("r1", &body, d);
        let genuine = fx.ledger.anchor(&d).await.unwrap();
        let backdated = AnchorReference {
            anchored_at: genuine.anchored_at - 86_400,
            ..genuine.clone()
        };
        fx.store
            .update("r1", &mut |env| env.set_anchor(1, backdated.clone()))
            .unwrap();

        let report = fx.verifier().verify_record("r1", "auditor").await.unwrap();
        assert!(report.local_integrity);
        assert_eq!(report.anchor_status, AnchorCheck::Verified);
        assert_eq!(report.ledger_anchored_at, Some(genuine.anchored_at));
        assert!(!report.anchor_reference_consistent);
        assert_eq!(report.outcome, VerificationOutcome::Mismatch);

        let entries = fx.audit.by_action(AuditAction::VerifyRecord);
        assert_eq!(entries[0].severity, Severity::Critical);
        assert_eq!(entries[0].details["anchorReferenceConsistent"], json!(false));
    }
}
