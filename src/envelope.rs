//! Stored form of a medical record: encrypted versions plus integrity metadata.

use crate::canonical::ContentDigest;
use crate::crypto::EncryptedPayload;
use crate::ledger::AnchorReference;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Anchoring progress of one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    /// Queued, not yet confirmed.
    Pending,
    /// Confirmed on the ledger.
    Anchored,
    /// Gave up after retries.
    Failed,
    /// Ledger disabled when the version was written.
    Unavailable,
}

/// Envelope state violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("record {0} is deleted")]
    /// Writes are refused after soft delete.
    Deleted(String),
    #[error("record has no version {0}")]
    /// The version number does not exist.
    UnknownVersion(u32),
    #[error("version {0} already carries a different anchor")]
    /// Anchor references are set once.
    AnchorAlreadySet(u32),
}

/// One immutable version of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    /// Version number, starting at 1.
    pub version: u32,
    /// Encrypted canonical content.
    pub payload: EncryptedPayload,
    /// Digest of the plaintext canonical content.
    pub digest: ContentDigest,
    /// Ledger anchor, once confirmed.
    pub anchor: Option<AnchorReference>,
    /// Anchoring progress.
    pub anchor_status: AnchorStatus,
    /// Last anchoring failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_error: Option<String>,
    /// Write time.
    pub created_at: DateTime<Utc>,
    /// Writer.
    pub created_by: String,
}

impl RecordVersion {
    /// Version `number` with anchoring still pending.
    pub fn new(
        version: u32,
        payload: EncryptedPayload,
        digest: ContentDigest,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            version,
            payload,
            digest,
            anchor: None,
            anchor_status: AnchorStatus::Pending,
            anchor_error: None,
            created_at: Utc::now(),
            created_by: created_by.into(),
        }
    }

    /// Wire form of this version's integrity fields.
    pub fn stored_fields(&self) -> StoredRecordFields {
        StoredRecordFields {
            ciphertext: self.payload.to_text(),
            digest: self.digest.to_hex(),
            anchor_tx_ref: self
                .anchor
                .as_ref()
                .map(|anchor| anchor.transaction_id.clone())
                .filter(|tx| !tx.is_empty()),
            anchor_block_ref: self.anchor.as_ref().map(|anchor| anchor.block_number),
            version: self.version,
        }
    }
}

/// Integrity fields persisted alongside each record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecordFields {
    /// `iv:tag:data` hex.
    pub ciphertext: String,
    /// 64 hex chars.
    pub digest: String,
    /// Anchor transaction id.
    pub anchor_tx_ref: Option<String>,
    /// Anchor block number.
    pub anchor_block_ref: Option<u64>,
    /// Version number.
    pub version: u32,
}

/// A record with its full version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalRecordEnvelope {
    id: String,
    kind: String,
    head: RecordVersion,
    #[serde(default)]
    history: Vec<RecordVersion>,
    #[serde(default)]
    deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    deleted_by: Option<String>,
}

impl MedicalRecordEnvelope {
    /// New record whose first version is `first`.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, first: RecordVersion) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            head: first,
            history: Vec::new(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    /// Record id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record type, e.g. `patient`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Latest version.
    pub fn current(&self) -> &RecordVersion {
        &self.head
    }

    /// Version `number`, if it exists.
    pub fn version(&self, number: u32) -> Option<&RecordVersion> {
        if self.head.version == number {
            return Some(&self.head);
        }
        self.history.iter().find(|v| v.version == number)
    }

    fn version_mut(&mut self, number: u32) -> Result<&mut RecordVersion, EnvelopeError> {
        if self.head.version == number {
            return Ok(&mut self.head);
        }
        self.history
            .iter_mut()
            .find(|v| v.version == number)
            .ok_or(EnvelopeError::UnknownVersion(number))
    }

    /// All versions, oldest first.
    pub fn versions(&self) -> impl Iterator<Item = &RecordVersion> {
        self.history.iter().chain(std::iter::once(&self.head))
    }

    /// Appends a new version and returns its number.
    pub fn push_version(
        &mut self,
        payload: EncryptedPayload,
        digest: ContentDigest,
        actor: impl Into<String>,
    ) -> Result<u32, EnvelopeError> {
        if self.is_deleted() {
            return Err(EnvelopeError::Deleted(self.id.clone()));
        }
        let number = self.head.version.saturating_add(1);
        let next = RecordVersion::new(number, payload, digest, actor);
        let previous = std::mem::replace(&mut self.head, next);
        self.history.push(previous);
        Ok(number)
    }

    /// Records the confirmed anchor of `version`.  Re-setting the same reference is a no-op.
    pub fn set_anchor(
        &mut self,
        version: u32,
        reference: AnchorReference,
    ) -> Result<(), EnvelopeError> {
        let entry = self.version_mut(version)?;
        match &entry.anchor {
            Some(existing) if *existing == reference => {}
            Some(_) => return Err(EnvelopeError::AnchorAlreadySet(version)),
            None => entry.anchor = Some(reference),
        }
        entry.anchor_status = AnchorStatus::Anchored;
        entry.anchor_error = None;
        Ok(())
    }

    /// Updates the anchoring status of an unanchored version.  Anchored versions stay anchored.
    pub fn set_anchor_status(
        &mut self,
        version: u32,
        status: AnchorStatus,
        error: Option<String>,
    ) -> Result<(), EnvelopeError> {
        let entry = self.version_mut(version)?;
        if entry.anchor.is_some() {
            return Ok(());
        }
        entry.anchor_status = status;
        entry.anchor_error = error;
        Ok(())
    }

    /// Marks the record deleted.  Versions are retained.
    pub fn soft_delete(&mut self, actor: impl Into<String>) -> Result<(), EnvelopeError> {
        if self.is_deleted() {
            return Err(EnvelopeError::Deleted(self.id.clone()));
        }
        self.deleted_at = Some(Utc::now());
        self.deleted_by = Some(actor.into());
        Ok(())
    }

    /// Whether the record was soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Deletion time.
    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::digest;
    use crate::crypto::CryptoBox;
    use serde_json::json;

    fn version(n: u32, body: serde_json::Value) -> RecordVersion {
        let crypto = CryptoBox::new(&[3u8; 32]).unwrap();
        RecordVersion::new(
            n,
            crypto.encrypt_json(&body).unwrap(),
            digest(&body).unwrap(),
            "dr-house",
        )
    }

    fn reference(tx: &str) -> AnchorReference {
        AnchorReference {
            transaction_id: tx.into(),
            block_number: 4,
            anchored_at: 1_700_000_000,
        }
    }

    #[test]
    fn versions_accumulate_in_order() {
        let mut env = MedicalRecordEnvelope::new("r1", "patient", version(1, json!({"v": 1})));
        let second = version(2, json!({"v": 2}));
        let n = env
            .push_version(second.payload.clone(), second.digest, "nurse")
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(env.current().version, 2);
        assert_eq!(env.current().anchor_status, AnchorStatus::Pending);
        assert_eq!(
            env.versions().map(|v| v.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(env.version(1).is_some());
        assert!(env.version(3).is_none());
    }

    #[test]
    fn anchor_is_set_once() {
        let mut env = MedicalRecordEnvelope::new("r1", "patient", version(1, json!({"v": 1})));
        env.set_anchor(1, reference("0xaa")).unwrap();
        env.set_anchor(1, reference("0xaa")).unwrap();
        assert_eq!(
            env.set_anchor(1, reference("0xbb")),
            Err(EnvelopeError::AnchorAlreadySet(1))
        );
        env.set_anchor_status(1, AnchorStatus::Failed, Some("late failure".into()))
            .unwrap();
        assert_eq!(env.current().anchor_status, AnchorStatus::Anchored);
        assert_eq!(
            env.set_anchor(9, reference("0xaa")),
            Err(EnvelopeError::UnknownVersion(9))
        );
    }

    #[test]
    fn deleted_records_refuse_writes() {
        let mut env = MedicalRecordEnvelope::new("r1", "patient", version(1, json!({"v": 1})));
        env.soft_delete("admin").unwrap();
        assert!(env.is_deleted());
        let next = version(2, json!({"v": 2}));
        assert_eq!(
            env.push_version(next.payload, next.digest, "x"),
            Err(EnvelopeError::Deleted("r1".into()))
        );
        assert!(env.soft_delete("admin").is_err());
        assert_eq!(env.versions().count(), 1);
    }

    #[test]
    fn stored_fields_use_wire_names() {
        let mut env = MedicalRecordEnvelope::new("r1", "patient", version(1, json!({"v": 1})));
        let fields = serde_json::to_value(env.current().stored_fields()).unwrap();
        assert_eq!(fields["anchorTxRef"], serde_json::Value::Null);
        assert_eq!(fields["version"], json!(1));
        assert_eq!(fields["digest"].as_str().unwrap().len(), 64);

        env.set_anchor(1, reference("0xaa")).unwrap();
        let fields = serde_json::to_value(env.current().stored_fields()).unwrap();
        assert_eq!(fields["anchorTxRef"], json!("0xaa"));
        assert_eq!(fields["anchorBlockRef"], json!(4));
        assert_eq!(fields["ciphertext"].as_str().unwrap().split(':').count(), 3);
    }

    #[test]
    fn envelope_serde_round_trip() {
        let env = MedicalRecordEnvelope::new("r1", "patient", version(1, json!({"v": 1})));
        let text = serde_json::to_string(&env).unwrap();
        let back: MedicalRecordEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }
}
