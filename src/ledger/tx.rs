//! EIP-1559 transaction encoding, admin key handling and the anchor contract ABI.
//!
//! The anchor contract exposes:
//!
//! ```text
//! function storeHash(bytes32 hash, uint256 timestamp)
//! function verifyHash(bytes32 hash) view returns (bool exists, uint256 timestamp)
//! event HashStored(bytes32 indexed hash, uint256 timestamp, address indexed sender)
//! ```

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use once_cell::sync::Lazy;
use rlp::{Rlp, RlpStream};
use sha3::{Digest, Keccak256};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

/// Solidity signature of the anchoring call.
pub const STORE_HASH_SIGNATURE: &str = "storeHash(bytes32,uint256)";
/// Solidity signature of the read-only lookup.
pub const VERIFY_HASH_SIGNATURE: &str = "verifyHash(bytes32)";
/// Solidity signature of the anchoring event.
pub const HASH_STORED_EVENT: &str = "HashStored(bytes32,uint256,address)";

/// Four-byte selector for `storeHash`.
pub static STORE_HASH_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| selector(STORE_HASH_SIGNATURE));
/// Four-byte selector for `verifyHash`.
pub static VERIFY_HASH_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| selector(VERIFY_HASH_SIGNATURE));
/// Topic zero of `HashStored` logs.
pub static HASH_STORED_TOPIC: Lazy<[u8; 32]> =
    Lazy::new(|| keccak256(HASH_STORED_EVENT.as_bytes()));

/// Errors raised while building, signing or decoding ledger transactions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("invalid address: {0}")]
    /// Not a `0x`-prefixed 20-byte hex address.
    InvalidAddress(String),
    #[error("invalid private key: {0}")]
    /// Private key was not 32 bytes of hex or not a valid scalar.
    InvalidKey(String),
    #[error("signing failed: {0}")]
    /// ECDSA signing failed.
    Signing(String),
    #[error("invalid transaction: {0}")]
    /// RLP or field level decoding failure.
    Decode(String),
    #[error("invalid abi data: {0}")]
    /// Call data or return data did not match the anchor contract ABI.
    Abi(String),
}

/// 20-byte account or contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Parses `0x` + 40 hex characters (any case).
    pub fn parse(value: &str) -> Result<Self, TxError> {
        let normalized = normalize_address(value)
            .ok_or_else(|| TxError::InvalidAddress(value.trim().to_string()))?;
        let bytes = hex::decode(&normalized[2..])
            .map_err(|err| TxError::InvalidAddress(err.to_string()))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Derives the account address controlled by a verifying key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Self(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Lower-cases a `0x` + 40 hex address, or returns `None` when malformed.
pub fn normalize_address(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if !(trimmed.starts_with("0x") || trimmed.starts_with("0X")) {
        return None;
    }
    if trimmed.len() != 42 {
        return None;
    }
    let raw = &trimmed[2..];
    if !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", raw.to_ascii_lowercase()))
}

/// secp256k1 key used to sign anchor transactions.  `Debug` never prints the scalar.
#[derive(Clone)]
pub struct AdminKey {
    signing: SigningKey,
    address: Address,
}

impl AdminKey {
    /// Parses a 32-byte hex private key (optional `0x` prefix).
    pub fn from_hex(value: &str) -> Result<Self, TxError> {
        let trimmed = value.trim();
        let raw = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if raw.len() != 64 {
            return Err(TxError::InvalidKey(format!(
                "expected 64 hex chars, found {}",
                raw.len()
            )));
        }
        let mut bytes = hex::decode(raw).map_err(|err| TxError::InvalidKey(err.to_string()))?;
        let signing = SigningKey::from_slice(&bytes);
        bytes.zeroize();
        let signing = signing.map_err(|err| TxError::InvalidKey(err.to_string()))?;
        Ok(Self::from_signing_key(signing))
    }

    /// Wraps an existing signing key.
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let address = Address::from_verifying_key(signing.verifying_key());
        Self { signing, address }
    }

    /// Address controlled by this key.
    pub fn address(&self) -> Address {
        self.address
    }

    fn sign_prehash(&self, hash: &[u8; 32]) -> Result<(Signature, RecoveryId), TxError> {
        self.signing
            .sign_prehash_recoverable(hash)
            .map_err(|err| TxError::Signing(err.to_string()))
    }
}

impl fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminKey")
            .field("address", &self.address.to_string())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Unsigned EIP-1559 (type 0x02) transaction with an empty access list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip1559Tx {
    /// Chain id the transaction is bound to.
    pub chain_id: u64,
    /// Sender account nonce.
    pub nonce: u64,
    /// Priority fee per gas in wei.
    pub max_priority_fee_per_gas: u128,
    /// Fee cap per gas in wei.
    pub max_fee_per_gas: u128,
    /// Gas limit.
    pub gas_limit: u64,
    /// Destination contract.
    pub to: Address,
    /// Value transferred in wei.
    pub value: u128,
    /// Contract call data.
    pub input: Vec<u8>,
}

/// Signed transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone)]
pub struct SignedTx {
    /// Typed-envelope bytes (`0x02 || rlp(...)`).
    pub raw: Vec<u8>,
    /// Keccak hash of `raw`, `0x`-prefixed.
    pub hash: String,
}

impl SignedTx {
    /// `0x`-prefixed hex of the raw envelope.
    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.raw))
    }
}

impl Eip1559Tx {
    fn append_unsigned_fields(&self, stream: &mut RlpStream) {
        stream.append(&self.chain_id);
        stream.append(&self.nonce);
        stream.append(&self.max_priority_fee_per_gas);
        stream.append(&self.max_fee_per_gas);
        stream.append(&self.gas_limit);
        let to: &[u8] = &self.to.0;
        stream.append(&to);
        stream.append(&self.value);
        stream.append(&self.input.as_slice());
        stream.append_raw(&[0xc0], 1);
    }

    /// Keccak hash the sender signs.
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut stream = RlpStream::new_list(9);
        self.append_unsigned_fields(&mut stream);
        let encoded = stream.out();
        let mut payload = Vec::with_capacity(1 + encoded.len());
        payload.push(0x02);
        payload.extend_from_slice(encoded.as_ref());
        keccak256(&payload)
    }

    /// Signs the transaction with the admin key.
    pub fn sign(&self, key: &AdminKey) -> Result<SignedTx, TxError> {
        let (signature, recid) = key.sign_prehash(&self.signing_hash())?;
        let sig_bytes = signature.to_bytes();
        let r = trim_leading_zeros(&sig_bytes[..32]);
        let s = trim_leading_zeros(&sig_bytes[32..]);

        let mut stream = RlpStream::new_list(12);
        self.append_unsigned_fields(&mut stream);
        stream.append(&u64::from(recid.to_byte()));
        stream.append(&r.as_slice());
        stream.append(&s.as_slice());
        let encoded = stream.out();

        let mut raw = Vec::with_capacity(1 + encoded.len());
        raw.push(0x02);
        raw.extend_from_slice(encoded.as_ref());
        let hash = format!("0x{}", hex::encode(keccak256(&raw)));
        Ok(SignedTx { raw, hash })
    }
}

/// Decoded and signature-checked EIP-1559 transaction.
#[derive(Debug, Clone)]
pub struct RecoveredTx {
    /// Transaction body.
    pub tx: Eip1559Tx,
    /// Address recovered from the signature.
    pub from: Address,
    /// `0x`-prefixed transaction hash.
    pub hash: String,
}

/// Decodes a typed transaction envelope and recovers its sender.
pub fn decode_signed_tx(raw: &[u8]) -> Result<RecoveredTx, TxError> {
    if raw.is_empty() {
        return Err(TxError::Decode("empty raw transaction".into()));
    }
    if raw[0] != 0x02 {
        return Err(TxError::Decode(
            "only EIP-1559 (type 0x02) transactions are supported".into(),
        ));
    }
    let rlp = Rlp::new(&raw[1..]);
    if !rlp.is_list() {
        return Err(TxError::Decode(
            "typed transaction payload is not an RLP list".into(),
        ));
    }
    let items = rlp
        .item_count()
        .map_err(|err| TxError::Decode(format!("invalid rlp item count: {err}")))?;
    if items != 12 {
        return Err(TxError::Decode(format!(
            "expected 12 rlp fields for type-2 tx, found {items}"
        )));
    }

    let to_bytes = rlp_bytes(&rlp, 5)?;
    if to_bytes.len() != 20 {
        return Err(TxError::Decode(
            "contract creation transactions are not supported".into(),
        ));
    }
    let mut to = [0u8; 20];
    to.copy_from_slice(to_bytes);

    let tx = Eip1559Tx {
        chain_id: rlp_u64(&rlp, 0)?,
        nonce: rlp_u64(&rlp, 1)?,
        max_priority_fee_per_gas: rlp_u128(&rlp, 2)?,
        max_fee_per_gas: rlp_u128(&rlp, 3)?,
        gas_limit: rlp_u64(&rlp, 4)?,
        to: Address(to),
        value: rlp_u128(&rlp, 6)?,
        input: rlp_bytes(&rlp, 7)?.to_vec(),
    };
    let access_list = rlp
        .at(8)
        .map_err(|err| TxError::Decode(format!("missing access list: {err}")))?;
    if access_list.item_count().unwrap_or(1) != 0 {
        return Err(TxError::Decode("access lists are not supported".into()));
    }

    let y_parity = rlp_u64(&rlp, 9)?;
    if y_parity > 1 {
        return Err(TxError::Decode("invalid y parity in signature".into()));
    }
    let r = left_pad_32(rlp_bytes(&rlp, 10)?)?;
    let s = left_pad_32(rlp_bytes(&rlp, 11)?)?;
    let signature = Signature::from_scalars(r, s)
        .map_err(|err| TxError::Decode(format!("invalid signature scalars: {err}")))?;
    let recid = RecoveryId::from_byte(y_parity as u8)
        .ok_or_else(|| TxError::Decode("invalid signature recovery id".into()))?;
    let verifying = VerifyingKey::recover_from_prehash(&tx.signing_hash(), &signature, recid)
        .map_err(|err| TxError::Decode(format!("signature recovery failed: {err}")))?;

    Ok(RecoveredTx {
        from: Address::from_verifying_key(&verifying),
        hash: format!("0x{}", hex::encode(keccak256(raw))),
        tx,
    })
}

/// Builds `storeHash(digest, timestamp)` call data.
pub fn encode_store_hash(digest: &[u8; 32], timestamp: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&STORE_HASH_SELECTOR[..]);
    data.extend_from_slice(digest);
    data.extend_from_slice(&u256_word(timestamp));
    data
}

/// Parses `storeHash` call data back into `(digest, timestamp)`.
pub fn decode_store_hash(data: &[u8]) -> Result<([u8; 32], u64), TxError> {
    if data.len() != 4 + 64 || data[..4] != STORE_HASH_SELECTOR[..] {
        return Err(TxError::Abi("call data is not storeHash(bytes32,uint256)".into()));
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&data[4..36]);
    let timestamp = word_to_u64(&data[36..68])?;
    Ok((digest, timestamp))
}

/// Builds `verifyHash(digest)` call data.
pub fn encode_verify_hash(digest: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&VERIFY_HASH_SELECTOR[..]);
    data.extend_from_slice(digest);
    data
}

/// Parses `verifyHash` call data into the queried digest.
pub fn decode_verify_hash_call(data: &[u8]) -> Result<[u8; 32], TxError> {
    if data.len() != 4 + 32 || data[..4] != VERIFY_HASH_SELECTOR[..] {
        return Err(TxError::Abi("call data is not verifyHash(bytes32)".into()));
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&data[4..36]);
    Ok(digest)
}

/// Encodes the `(bool, uint256)` return tuple of `verifyHash`.
pub fn encode_verify_result(exists: bool, timestamp: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&u256_word(u64::from(exists)));
    out.extend_from_slice(&u256_word(timestamp));
    out
}

/// Decodes the `(bool, uint256)` return tuple of `verifyHash`.
pub fn decode_verify_result(data: &[u8]) -> Result<(bool, u64), TxError> {
    if data.is_empty() {
        return Err(TxError::Abi("empty return data (no contract at address?)".into()));
    }
    if data.len() < 64 {
        return Err(TxError::Abi(format!(
            "expected 64 bytes of return data, found {}",
            data.len()
        )));
    }
    let exists = word_to_u64(&data[..32])? != 0;
    let timestamp = word_to_u64(&data[32..64])?;
    Ok((exists, timestamp))
}

/// Left-pads an address into a 32-byte log topic.
pub fn address_topic(address: &Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(&address.0);
    out
}

/// Big-endian 32-byte ABI word for a `u64`.
pub fn u256_word(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

/// Reads a 32-byte ABI word that must fit into a `u64`.
pub fn word_to_u64(word: &[u8]) -> Result<u64, TxError> {
    if word.len() != 32 {
        return Err(TxError::Abi(format!("word must be 32 bytes, got {}", word.len())));
    }
    if word[..24].iter().any(|b| *b != 0) {
        return Err(TxError::Abi("uint256 value exceeds u64".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(buf))
}

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

fn rlp_bytes<'a>(rlp: &Rlp<'a>, index: usize) -> Result<&'a [u8], TxError> {
    rlp.at(index)
        .map_err(|err| TxError::Decode(format!("missing rlp field {index}: {err}")))?
        .data()
        .map_err(|err| TxError::Decode(format!("invalid rlp field {index}: {err}")))
}

fn rlp_u64(rlp: &Rlp<'_>, index: usize) -> Result<u64, TxError> {
    let bytes = rlp_bytes(rlp, index)?;
    if bytes.len() > 8 {
        return Err(TxError::Decode("integer overflow (u64)".into()));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn rlp_u128(rlp: &Rlp<'_>, index: usize) -> Result<u128, TxError> {
    let bytes = rlp_bytes(rlp, index)?;
    if bytes.len() > 16 {
        return Err(TxError::Decode("integer overflow (u128)".into()));
    }
    Ok(bytes.iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
}

fn left_pad_32(bytes: &[u8]) -> Result<[u8; 32], TxError> {
    if bytes.len() > 32 {
        return Err(TxError::Decode("signature component exceeds 32 bytes".into()));
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known development key (hardhat account #0).
    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    #[test]
    fn admin_key_derives_known_address() {
        let key = AdminKey::from_hex(DEV_KEY).unwrap();
        assert_eq!(key.address().to_string(), DEV_ADDRESS);
        assert!(!format!("{key:?}").contains(DEV_KEY));
    }

    #[test]
    fn admin_key_rejects_bad_input() {
        assert!(AdminKey::from_hex("0x1234").is_err());
        assert!(AdminKey::from_hex(&"00".repeat(32)).is_err());
        assert!(AdminKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn normalize_hex_address() {
        let addr = normalize_address("0xAbCdEfabcdefABCDefAbcdefABcdefabCDefAb12");
        assert_eq!(
            addr.as_deref(),
            Some("0xabcdefabcdefabcdefabcdefabcdefabcdefab12")
        );
        assert!(normalize_address("abcdefabcdefabcdefabcdefabcdefabcdefab12").is_none());
        assert!(normalize_address("0x1234").is_none());
    }

    #[test]
    fn known_selectors() {
        assert_eq!(
            hex::encode(keccak256(b"transfer(address,uint256)")).get(..8),
            Some("a9059cbb")
        );
        assert_eq!(STORE_HASH_SELECTOR.len(), 4);
        assert_ne!(*STORE_HASH_SELECTOR, *VERIFY_HASH_SELECTOR);
    }

    #[test]
    fn signed_tx_recovers_sender() {
        let key = AdminKey::from_hex(DEV_KEY).unwrap();
        let digest = [9u8; 32];
        let tx = Eip1559Tx {
            chain_id: 31337,
            nonce: 4,
            max_priority_fee_per_gas: 1_000_000_000,
            max_fee_per_gas: 3_000_000_000,
            gas_limit: 120_000,
            to: Address::parse("0x5fbdb2315678afecb367f032d93f642f64180aa3").unwrap(),
            value: 0,
            input: encode_store_hash(&digest, 1_700_000_000),
        };
        let signed = tx.sign(&key).unwrap();
        assert_eq!(signed.raw[0], 0x02);
        let recovered = decode_signed_tx(&signed.raw).unwrap();
        assert_eq!(recovered.from, key.address());
        assert_eq!(recovered.hash, signed.hash);
        assert_eq!(recovered.tx, tx);
        assert_eq!(
            decode_store_hash(&recovered.tx.input).unwrap(),
            (digest, 1_700_000_000)
        );
    }

    #[test]
    fn tampered_tx_recovers_different_sender() {
        let key = AdminKey::from_hex(DEV_KEY).unwrap();
        let tx = Eip1559Tx {
            chain_id: 1,
            nonce: 0,
            max_priority_fee_per_gas: 1,
            max_fee_per_gas: 2,
            gas_limit: 50_000,
            to: Address([1u8; 20]),
            value: 0,
            input: encode_verify_hash(&[3u8; 32]),
        };
        let mut signed = tx.sign(&key).unwrap();
        let last = signed.raw.len() - 1;
        signed.raw[last] ^= 0x01;
        match decode_signed_tx(&signed.raw) {
            Ok(recovered) => assert_ne!(recovered.from, key.address()),
            Err(_) => {}
        }
    }

    #[test]
    fn verify_result_round_trip() {
        let encoded = encode_verify_result(true, 1_234);
        assert_eq!(decode_verify_result(&encoded).unwrap(), (true, 1_234));
        assert_eq!(
            decode_verify_result(&encode_verify_result(false, 0)).unwrap(),
            (false, 0)
        );
        assert!(decode_verify_result(&[]).is_err());
    }

    #[test]
    fn abi_decoders_reject_foreign_calls() {
        assert!(decode_store_hash(&encode_verify_hash(&[0u8; 32])).is_err());
        assert!(decode_verify_hash_call(&encode_store_hash(&[0u8; 32], 1)).is_err());
        let mut word = [0u8; 32];
        word[0] = 1;
        assert!(word_to_u64(&word).is_err());
    }
}
