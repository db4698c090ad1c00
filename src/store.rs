//! Persistence of record envelopes.

use crate::envelope::{EnvelopeError, MedicalRecordEnvelope};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    /// No record with that id.
    NotFound(String),
    #[error("record {0} already exists")]
    /// Insert collided with an existing id.
    AlreadyExists(String),
    #[error("invalid record id: {0}")]
    /// Ids are limited to `[A-Za-z0-9_-]`, 1 to 128 chars.
    InvalidId(String),
    #[error("store io error: {0}")]
    /// Filesystem failure.
    Io(#[from] io::Error),
    #[error("store encoding error: {0}")]
    /// Document could not be (de)serialized.
    Encoding(String),
    #[error(transparent)]
    /// The mutation violated an envelope invariant.
    Envelope(#[from] EnvelopeError),
    #[error("store lock poisoned")]
    /// A writer panicked while holding the store lock.
    Poisoned,
}

/// Envelope storage.  `update` is an atomic read-modify-write.
pub trait RecordStore: Send + Sync {
    /// Stores a new envelope; fails if the id is taken.
    fn insert(&self, envelope: MedicalRecordEnvelope) -> Result<(), StoreError>;

    /// Loads an envelope.
    fn get(&self, id: &str) -> Result<Option<MedicalRecordEnvelope>, StoreError>;

    /// Applies `mutate` to the stored envelope and persists the result.
    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut MedicalRecordEnvelope) -> Result<(), EnvelopeError>,
    ) -> Result<MedicalRecordEnvelope, StoreError>;

    /// All record ids, sorted.
    fn ids(&self) -> Result<Vec<String>, StoreError>;
}

/// Rejects ids that are not safe as file names.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// Map-backed store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, MedicalRecordEnvelope>>,
}

impl MemoryRecordStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&self, envelope: MedicalRecordEnvelope) -> Result<(), StoreError> {
        validate_id(envelope.id())?;
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        if records.contains_key(envelope.id()) {
            return Err(StoreError::AlreadyExists(envelope.id().to_string()));
        }
        records.insert(envelope.id().to_string(), envelope);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<MedicalRecordEnvelope>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(id).cloned())
    }

    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut MedicalRecordEnvelope) -> Result<(), EnvelopeError>,
    ) -> Result<MedicalRecordEnvelope, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let stored = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut working = stored.clone();
        mutate(&mut working)?;
        *stored = working.clone();
        Ok(working)
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.keys().cloned().collect())
    }
}

/// One pretty JSON document per record, written via tmp file and rename.
#[derive(Debug)]
pub struct FileRecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    /// Opens (creating if needed) the record directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read(&self, id: &str) -> Result<Option<MedicalRecordEnvelope>, StoreError> {
        validate_id(id)?;
        let bytes = match fs::read(self.path_for(id)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Encoding(format!("{id}: {err}")))
    }

    fn write(&self, envelope: &MedicalRecordEnvelope) -> Result<(), StoreError> {
        let path = self.path_for(envelope.id());
        let tmp_path = self.dir.join(format!("{}.json.tmp", envelope.id()));
        let contents = serde_json::to_vec_pretty(envelope)
            .map_err(|err| StoreError::Encoding(err.to_string()))?;
        write_atomic(&tmp_path, &path, &contents)
    }
}

fn write_atomic(tmp_path: &Path, path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    fs::write(tmp_path, contents)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

impl RecordStore for FileRecordStore {
    fn insert(&self, envelope: MedicalRecordEnvelope) -> Result<(), StoreError> {
        validate_id(envelope.id())?;
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        if self.path_for(envelope.id()).exists() {
            return Err(StoreError::AlreadyExists(envelope.id().to_string()));
        }
        self.write(&envelope)
    }

    fn get(&self, id: &str) -> Result<Option<MedicalRecordEnvelope>, StoreError> {
        self.read(id)
    }

    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut MedicalRecordEnvelope) -> Result<(), EnvelopeError>,
    ) -> Result<MedicalRecordEnvelope, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut envelope = self
            .read(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(&mut envelope)?;
        self.write(&envelope)?;
        Ok(envelope)
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_id(stem).is_ok() {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::digest;
    use crate::crypto::CryptoBox;
    use crate::envelope::{AnchorStatus, RecordVersion};
    use serde_json::json;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("medledger_store_{name}_{nanos}"))
    }

    fn envelope(id: &str) -> MedicalRecordEnvelope {
        let body = json!({"diagnosis": "flu"});
        let crypto = CryptoBox::new(&[5u8; 32]).unwrap();
        let version = RecordVersion::new(
            1,
            crypto.encrypt_json(&body).unwrap(),
            digest(&body).unwrap(),
            "dr",
        );
        MedicalRecordEnvelope::new(id, "patient", version)
    }

    fn exercise(store: &dyn RecordStore) {
        store.insert(envelope("p-1")).unwrap();
        assert!(matches!(
            store.insert(envelope("p-1")),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.insert(envelope("../etc")),
            Err(StoreError::InvalidId(_))
        ));
        store.insert(envelope("p-0")).unwrap();
        assert_eq!(store.ids().unwrap(), vec!["p-0".to_string(), "p-1".to_string()]);

        let updated = store
            .update("p-1", &mut |env| {
                env.set_anchor_status(1, AnchorStatus::Unavailable, Some("off".into()))
            })
            .unwrap();
        assert_eq!(updated.current().anchor_status, AnchorStatus::Unavailable);
        let loaded = store.get("p-1").unwrap().unwrap();
        assert_eq!(loaded, updated);

        let failed = store.update("p-1", &mut |env| env.set_anchor_status(7, AnchorStatus::Failed, None));
        assert!(matches!(failed, Err(StoreError::Envelope(EnvelopeError::UnknownVersion(7)))));
        assert_eq!(store.get("p-1").unwrap().unwrap(), updated);

        assert!(matches!(
            store.update("missing", &mut |_| Ok(())),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryRecordStore::new());
    }

    #[test]
    fn file_store_contract() {
        let dir = temp_dir("contract");
        let store = FileRecordStore::open(&dir).unwrap();
        exercise(&store);
        assert!(!dir.join("p-1.json.tmp").exists());
        let reopened = FileRecordStore::open(&dir).unwrap();
        assert_eq!(reopened.ids().unwrap().len(), 2);
        let _ = fs::remove_dir_all(dir);
    }
}
