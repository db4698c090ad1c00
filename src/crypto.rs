//! Authenticated encryption of record payloads and credential hashing.
//!
//! Record payloads are sealed with AES-256-GCM using a 128-bit random IV drawn
//! from the OS CSPRNG on every call and a fixed associated-data tag that binds
//! ciphertexts to this application.  The stored textual form is
//! `hex(iv):hex(tag):hex(ciphertext)`.
//!
//! Credential hashing is independent of record encryption and uses Argon2id
//! PHC strings with a configurable cost.

use aes_gcm::{
    aead::{consts::U16, AeadInPlace, KeyInit},
    aes::Aes256,
    AesGcm, Nonce, Tag,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a record encryption key in bytes (256 bits).
pub const KEY_LENGTH: usize = 32;
/// Length of the per-call initialization vector in bytes (128 bits).
pub const IV_LENGTH: usize = 16;
/// Length of the AES-GCM authentication tag in bytes (128 bits).
pub const TAG_LENGTH: usize = 16;
/// Associated data bound into every record ciphertext.
pub const RECORD_AAD: &[u8] = b"medledger-record-v1";

type RecordCipher = AesGcm<Aes256, U16>;

/// Errors raised by the encryption and credential primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be exactly {KEY_LENGTH} bytes, got {0}")]
    /// The configured key is not 256 bits long.
    KeyConfiguration(usize),
    #[error("authentication failure: payload cannot be decrypted")]
    /// Tag verification failed (corruption, tampering or wrong key).
    AuthenticationFailure,
    #[error("encryption failed")]
    /// The AEAD rejected the input (plaintext too large).
    Encryption,
    #[error("malformed payload: {0}")]
    /// Textual payload did not parse as `iv:tag:data`.
    MalformedPayload(String),
    #[error("decrypted payload is not valid JSON: {0}")]
    /// A JSON payload decrypted but did not parse.
    InvalidJson(String),
    #[error("password hashing failed: {0}")]
    /// Argon2 parameter or hashing failure.
    PasswordHash(String),
}

/// 256-bit record key.  Zeroed on drop and redacted in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LENGTH],
}

impl EncryptionKey {
    /// Builds a key from raw bytes, rejecting anything that is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LENGTH {
            return Err(CryptoError::KeyConfiguration(bytes.len()));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Parses a configured key: either 32 raw characters or 64 hex characters.
    pub fn from_config_str(value: &str) -> Result<Self, CryptoError> {
        if value.len() == KEY_LENGTH * 2 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            let decoded =
                hex::decode(value).map_err(|_| CryptoError::KeyConfiguration(value.len()))?;
            return Self::from_slice(&decoded);
        }
        Self::from_slice(value.as_bytes())
    }

    /// Draws a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.bytes
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Opaque container produced by a single encryption call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EncryptedPayload {
    /// Random IV used for this call.
    pub iv: [u8; IV_LENGTH],
    /// AES-GCM authentication tag.
    pub tag: [u8; TAG_LENGTH],
    /// Ciphertext bytes (same length as the plaintext).
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Encodes the payload as `hex(iv):hex(tag):hex(ciphertext)`.
    pub fn to_text(&self) -> String {
        format!(
            "{}:{}:{}",
            hex::encode(self.iv),
            hex::encode(self.tag),
            hex::encode(&self.ciphertext)
        )
    }

    /// Parses the textual `iv:tag:data` form.
    pub fn from_text(text: &str) -> Result<Self, CryptoError> {
        let parts = text.trim().split(':').collect::<Vec<_>>();
        let [iv_hex, tag_hex, data_hex] = parts.as_slice() else {
            return Err(CryptoError::MalformedPayload(format!(
                "expected 3 fields, found {}",
                parts.len()
            )));
        };
        let iv = decode_fixed::<IV_LENGTH>(iv_hex, "iv")?;
        let tag = decode_fixed::<TAG_LENGTH>(tag_hex, "tag")?;
        let ciphertext = hex::decode(data_hex)
            .map_err(|err| CryptoError::MalformedPayload(format!("ciphertext: {err}")))?;
        Ok(Self {
            iv,
            tag,
            ciphertext,
        })
    }
}

impl fmt::Display for EncryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for EncryptedPayload {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}

impl From<EncryptedPayload> for String {
    fn from(payload: EncryptedPayload) -> Self {
        payload.to_text()
    }
}

impl TryFrom<String> for EncryptedPayload {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_text(&value)
    }
}

fn decode_fixed<const N: usize>(input: &str, field: &str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(input)
        .map_err(|err| CryptoError::MalformedPayload(format!("{field}: {err}")))?;
    if bytes.len() != N {
        return Err(CryptoError::MalformedPayload(format!(
            "{field}: expected {N} bytes, found {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Record encryption primitive holding the process-wide immutable key.
#[derive(Clone)]
pub struct CryptoBox {
    key: EncryptionKey,
}

impl fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoBox").field("key", &self.key).finish()
    }
}

impl CryptoBox {
    /// Builds a box from raw key bytes; fails unless the key is 256 bits.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            key: EncryptionKey::from_slice(key)?,
        })
    }

    /// Builds a box from an already validated key.
    pub fn with_key(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Seals `plaintext` under a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        let cipher = RecordCipher::new_from_slice(self.key.as_bytes())
            .map_err(|_| CryptoError::KeyConfiguration(KEY_LENGTH))?;
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), RECORD_AAD, &mut buffer)
            .map_err(|_| CryptoError::Encryption)?;
        let mut tag_bytes = [0u8; TAG_LENGTH];
        tag_bytes.copy_from_slice(tag.as_slice());
        Ok(EncryptedPayload {
            iv,
            tag: tag_bytes,
            ciphertext: buffer,
        })
    }

    /// Opens a payload.  Any tag mismatch yields `AuthenticationFailure` and no bytes.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        let cipher = RecordCipher::new_from_slice(self.key.as_bytes())
            .map_err(|_| CryptoError::KeyConfiguration(KEY_LENGTH))?;
        let mut buffer = payload.ciphertext.clone();
        match cipher.decrypt_in_place_detached(
            Nonce::<U16>::from_slice(&payload.iv),
            RECORD_AAD,
            &mut buffer,
            Tag::from_slice(&payload.tag),
        ) {
            Ok(()) => Ok(buffer),
            Err(_) => {
                buffer.zeroize();
                Err(CryptoError::AuthenticationFailure)
            }
        }
    }

    /// Encrypts the canonical serialization of a JSON value.
    pub fn encrypt_json(&self, value: &Value) -> Result<EncryptedPayload, CryptoError> {
        let bytes = crate::canonical::canonical_bytes(value)
            .map_err(|err| CryptoError::InvalidJson(err.to_string()))?;
        self.encrypt(&bytes)
    }

    /// Decrypts a payload and parses it back into JSON.
    pub fn decrypt_json(&self, payload: &EncryptedPayload) -> Result<Value, CryptoError> {
        let mut bytes = self.decrypt(payload)?;
        let parsed =
            serde_json::from_slice(&bytes).map_err(|err| CryptoError::InvalidJson(err.to_string()));
        bytes.zeroize();
        parsed
    }
}

/// Encrypts `plaintext` under a caller-held key.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    CryptoBox::new(key)?.encrypt(plaintext)
}

/// Decrypts `payload` under a caller-held key.
pub fn decrypt(payload: &EncryptedPayload, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    CryptoBox::new(key)?.decrypt(payload)
}

/// Hex token drawn from the OS CSPRNG, `bytes` long before encoding.
pub fn generate_secure_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Argon2id cost profile for credential hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordCost {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl PasswordCost {
    /// Cheap profile for tests and development machines.
    pub const LOW: Self = Self {
        memory_kib: 8 * 1024,
        iterations: 1,
        parallelism: 1,
    };
    /// Default production profile (OWASP Argon2id baseline).
    pub const DEFAULT: Self = Self {
        memory_kib: 19 * 1024,
        iterations: 2,
        parallelism: 1,
    };
    /// Heavier profile for high-value credentials.
    pub const HIGH: Self = Self {
        memory_kib: 64 * 1024,
        iterations: 3,
        parallelism: 1,
    };

    /// Maps `low|default|high` to a profile.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::LOW),
            "default" | "" => Some(Self::DEFAULT),
            "high" => Some(Self::HIGH),
            _ => None,
        }
    }
}

impl Default for PasswordCost {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Salted adaptive hashing for stored credentials.
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    cost: PasswordCost,
}

impl CredentialHasher {
    /// Builds a hasher with the given cost profile.
    pub fn new(cost: PasswordCost) -> Self {
        Self { cost }
    }

    fn argon2(&self) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(
            self.cost.memory_kib,
            self.cost.iterations,
            self.cost.parallelism,
            None,
        )
        .map_err(|err| CryptoError::PasswordHash(err.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Hashes `password` into a PHC string with a random salt.
    pub fn hash_password(&self, password: &str) -> Result<String, CryptoError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| CryptoError::PasswordHash(err.to_string()))?;
        Ok(hash.to_string())
    }

    /// Checks `password` against a stored PHC string; malformed hashes verify as false.
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self::new(PasswordCost::DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const TEST_KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn rejects_short_and_long_keys() {
        assert!(matches!(
            CryptoBox::new(b"too-short"),
            Err(CryptoError::KeyConfiguration(9))
        ));
        assert!(matches!(
            CryptoBox::new(&[0u8; 33]),
            Err(CryptoError::KeyConfiguration(33))
        ));
        assert!(CryptoBox::new(TEST_KEY).is_ok());
    }

    #[test]
    fn config_key_accepts_raw_and_hex() {
        let raw = EncryptionKey::from_config_str("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(raw.as_bytes(), TEST_KEY);
        let hexed = EncryptionKey::from_config_str(&"ab".repeat(32)).unwrap();
        assert_eq!(hexed.as_bytes(), &[0xab; 32]);
        assert!(EncryptionKey::from_config_str("short").is_err());
    }

    #[test]
    fn key_debug_is_redacted() {
        let boxed = CryptoBox::new(TEST_KEY).unwrap();
        let rendered = format!("{boxed:?}");
        assert!(!rendered.contains("0123456789"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn diagnosis_round_trip() {
        let boxed = CryptoBox::new(TEST_KEY).unwrap();
        let record = json!({"diagnosis": "flu"});
        let sealed = boxed.encrypt_json(&record).unwrap();
        assert_eq!(boxed.decrypt_json(&sealed).unwrap(), record);
    }

    #[test]
    fn repeated_encryption_differs() {
        let boxed = CryptoBox::new(TEST_KEY).unwrap();
        let a = boxed.encrypt(b"same plaintext").unwrap();
        let b = boxed.encrypt(b"same plaintext").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = encrypt(b"secret", TEST_KEY).unwrap();
        let other = [7u8; 32];
        assert!(matches!(
            decrypt(&sealed, &other),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn text_form_round_trips_and_rejects_garbage() {
        let boxed = CryptoBox::new(TEST_KEY).unwrap();
        let sealed = boxed.encrypt(b"payload").unwrap();
        let text = sealed.to_text();
        assert_eq!(text.split(':').count(), 3);
        let parsed: EncryptedPayload = text.parse().unwrap();
        assert_eq!(boxed.decrypt(&parsed).unwrap(), b"payload");

        assert!(EncryptedPayload::from_text("abcd").is_err());
        assert!(EncryptedPayload::from_text("00:00:00").is_err());
        assert!(EncryptedPayload::from_text(&format!("{}:zz:00", "00".repeat(16))).is_err());
    }

    #[test]
    fn payload_serializes_as_string() {
        let boxed = CryptoBox::new(TEST_KEY).unwrap();
        let sealed = boxed.encrypt(b"x").unwrap();
        let encoded = serde_json::to_value(&sealed).unwrap();
        assert_eq!(encoded, Value::String(sealed.to_text()));
        let decoded: EncryptedPayload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, sealed);
    }

    #[test]
    fn password_hash_verifies() {
        let hasher = CredentialHasher::new(PasswordCost::LOW);
        let hash = hasher.hash_password("correct-horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify_password("correct-horse", &hash));
        assert!(!hasher.verify_password("wrong-horse", &hash));
        assert!(!hasher.verify_password("correct-horse", "not-a-phc-string"));
        assert_ne!(hash, hasher.hash_password("correct-horse").unwrap());
    }

    #[test]
    fn secure_token_has_expected_length() {
        let token = generate_secure_token(16);
        assert_eq!(token.len(), 32);
        assert_ne!(token, generate_secure_token(16));
    }

    proptest! {
        #[test]
        fn prop_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..512)) {
            let boxed = CryptoBox::new(TEST_KEY).unwrap();
            let sealed = boxed.encrypt(&plaintext).unwrap();
            prop_assert_eq!(boxed.decrypt(&sealed).unwrap(), plaintext);
        }

        #[test]
        fn prop_bit_flip_detected(
            plaintext in proptest::collection::vec(any::<u8>(), 1..128),
            target in 0usize..3,
            index in any::<usize>(),
            bit in 0u8..8,
        ) {
            let boxed = CryptoBox::new(TEST_KEY).unwrap();
            let mut sealed = boxed.encrypt(&plaintext).unwrap();
            match target {
                0 => {
                    let i = index % sealed.ciphertext.len();
                    sealed.ciphertext[i] ^= 1 << bit;
                }
                1 => sealed.tag[index % TAG_LENGTH] ^= 1 << bit,
                _ => sealed.iv[index % IV_LENGTH] ^= 1 << bit,
            }
            prop_assert!(matches!(
                boxed.decrypt(&sealed),
                Err(CryptoError::AuthenticationFailure)
            ));
        }
    }
}
