//! Canonical serialization and SHA-256 content digests for record fields.
//!
//! The canonical form is compact JSON with object members sorted by key
//! (byte-wise UTF-8 order), arrays in their given order, explicit `null`s kept
//! and absent keys omitted.  Integers are plain base-10; other finite numbers
//! use the shortest round-trip decimal without an exponent, and floats with a
//! zero fractional part are written as the integer they equal.  Strings use
//! JSON escaping with short escapes for `\b \f \n \r \t`, `\u00xx` for other
//! control characters and raw UTF-8 for everything else.  The digest is
//! SHA-256 over those bytes, so any implementation following the rules above
//! recomputes the same value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};
use std::str::FromStr;
use thiserror::Error;

/// Maximum nesting accepted by the canonical encoder.
pub const MAX_DEPTH: usize = 64;

/// Errors produced while canonicalizing a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CanonicalError {
    #[error("record nesting exceeds {MAX_DEPTH} levels")]
    /// The value nests deeper than [`MAX_DEPTH`].
    TooDeep,
    #[error("unsupported number: {0}")]
    /// A number that has no canonical decimal form.
    UnsupportedNumber(String),
    #[error("invalid digest: {0}")]
    /// A textual digest was not 64 hex characters.
    InvalidDigest(String),
}

/// 256-bit SHA-256 digest of a record's canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case 64 character hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses 64 hex characters, with or without a `0x` prefix.
    pub fn from_hex(input: &str) -> Result<Self, CanonicalError> {
        let trimmed = input.trim();
        let raw = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if raw.len() != 64 {
            return Err(CanonicalError::InvalidDigest(format!(
                "expected 64 hex chars, found {}",
                raw.len()
            )));
        }
        let bytes =
            hex::decode(raw).map_err(|err| CanonicalError::InvalidDigest(err.to_string()))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentDigest {
    type Err = CanonicalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.to_hex()
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = CanonicalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

/// Computes the content digest of any JSON value.
pub fn digest(record: &Value) -> Result<ContentDigest, CanonicalError> {
    let bytes = canonical_bytes(record)?;
    Ok(digest_canonical(&bytes))
}

/// Computes the content digest of a record's field map.
pub fn digest_fields(fields: &Map<String, Value>) -> Result<ContentDigest, CanonicalError> {
    let mut out = String::new();
    write_object(&mut out, fields, 0)?;
    Ok(digest_canonical(out.as_bytes()))
}

/// Hashes bytes that are already in canonical form.
pub fn digest_canonical(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentDigest(hasher.finalize().into())
}

/// Returns the canonical serialization of `value` as a string.
pub fn canonical_string(value: &Value) -> Result<String, CanonicalError> {
    let mut out = String::new();
    write_value(&mut out, value, 0)?;
    Ok(out)
}

/// Returns the canonical serialization of `value` as UTF-8 bytes.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    canonical_string(value).map(String::into_bytes)
}

fn write_value(out: &mut String, value: &Value, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::TooDeep);
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => write_number(out, number)?,
        Value::String(text) => write_string(out, text),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(out, item, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map, depth)?,
    }
    Ok(())
}

fn write_object(
    out: &mut String,
    map: &Map<String, Value>,
    depth: usize,
) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::TooDeep);
    }
    let mut keys = map.keys().collect::<Vec<_>>();
    keys.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
    out.push('{');
    for (idx, key) in keys.into_iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, &map[key.as_str()], depth + 1)?;
    }
    out.push('}');
    Ok(())
}

fn write_number(out: &mut String, number: &Number) -> Result<(), CanonicalError> {
    if let Some(v) = number.as_u64() {
        let _ = write!(out, "{v}");
        return Ok(());
    }
    if let Some(v) = number.as_i64() {
        let _ = write!(out, "{v}");
        return Ok(());
    }
    let v = number
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CanonicalError::UnsupportedNumber(number.to_string()))?;
    if v == 0.0 {
        out.push('0');
        return Ok(());
    }
    // `Display` for f64 is the shortest round-trip form and never uses an exponent.
    let _ = write!(out, "{v}");
    Ok(())
}

fn write_string(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn field_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());
    }

    #[test]
    fn canonical_form_is_compact_and_sorted() {
        let value = json!({"z": [3, 1], "a": {"y": null, "b": true}, "m": "x\ny"});
        assert_eq!(
            canonical_string(&value).unwrap(),
            r#"{"a":{"b":true,"y":null},"m":"x\ny","z":[3,1]}"#
        );
    }

    #[test]
    fn known_digest_matches_sha256_of_canonical_text() {
        let value = json!({"b": 2, "a": 1});
        let expected = digest_canonical(br#"{"a":1,"b":2}"#);
        assert_eq!(digest(&value).unwrap(), expected);
        assert_eq!(
            digest_canonical(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn null_differs_from_absent() {
        let with_null = json!({"a": 1, "note": null});
        let absent = json!({"a": 1});
        assert_ne!(digest(&with_null).unwrap(), digest(&absent).unwrap());
    }

    #[test]
    fn numbers_have_one_spelling() {
        assert_eq!(canonical_string(&json!(2.0)).unwrap(), "2");
        assert_eq!(canonical_string(&json!(-0.0)).unwrap(), "0");
        assert_eq!(canonical_string(&json!(38.5)).unwrap(), "38.5");
        assert_eq!(canonical_string(&json!(-7)).unwrap(), "-7");
        assert_eq!(canonical_string(&json!(1e21)).unwrap(), "1000000000000000000000");
        assert_eq!(
            digest(&json!({"t": 2})).unwrap(),
            digest(&json!({"t": 2.0})).unwrap()
        );
    }

    #[test]
    fn control_characters_are_escaped() {
        assert_eq!(
            canonical_string(&json!("a\u{01}\"\\é")).unwrap(),
            "\"a\\u0001\\\"\\\\é\""
        );
    }

    #[test]
    fn digest_fields_matches_value_digest() {
        let value = json!({"diagnosis": "flu", "severity": 2});
        let map = value.as_object().unwrap();
        assert_eq!(digest_fields(map).unwrap(), digest(&value).unwrap());
    }

    #[test]
    fn deep_nesting_rejected() {
        let mut value = json!(1);
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!([value]);
        }
        assert_eq!(digest(&value), Err(CanonicalError::TooDeep));
    }

    #[test]
    fn digest_hex_round_trip() {
        let d = digest(&json!({"a": 1})).unwrap();
        assert_eq!(ContentDigest::from_hex(&d.to_hex()).unwrap(), d);
        assert_eq!(ContentDigest::from_hex(&format!("0x{d}")).unwrap(), d);
        assert!(ContentDigest::from_hex("abc").is_err());
        assert!(ContentDigest::from_hex(&"zz".repeat(32)).is_err());
    }

    proptest! {
        #[test]
        fn prop_insertion_order_irrelevant(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 1..12)
        ) {
            let forward = entries
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect::<Map<String, Value>>();
            let reverse = entries
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect::<Map<String, Value>>();
            prop_assert_eq!(digest_fields(&forward).unwrap(), digest_fields(&reverse).unwrap());
        }

        #[test]
        fn prop_value_change_changes_digest(base in any::<i64>(), delta in 1i64..1000) {
            let a = json!({"value": base});
            let b = json!({"value": base.wrapping_add(delta)});
            prop_assert_ne!(digest(&a).unwrap(), digest(&b).unwrap());
        }
    }
}
