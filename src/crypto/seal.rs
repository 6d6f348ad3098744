/// XChaCha20-Poly1305 sealing of individual record fields.
///
/// Sealing is opt-in and always uses a key the caller supplies. A sealed
/// field is replaced in the record by a map holding the algorithm, the
/// random nonce and the ciphertext, so the record still canonicalizes and
/// the commitment covers the sealed form. The field name is bound in as
/// AAD: a sealed value copied under another name will not open.
use std::collections::BTreeMap;
use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{AnchorError, Result};
use crate::record::{Record, Value};

pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;

/// Marker stored under `sealed` in a sealed field.
pub const ALGORITHM: &str = "xchacha20poly1305";

/// 256-bit sealing key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKey([u8; KEY_LEN]);

impl SealingKey {
    /// Fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex key, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = s.trim().trim_start_matches("0x");
        let mut bytes = hex::decode(raw)
            .map_err(|e| AnchorError::Config(format!("sealing key is not hex: {e}")))?;
        if bytes.len() != KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(AnchorError::Config(format!(
                "sealing key must be {KEY_LEN} bytes, got {len}"
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

/// Encrypt `plaintext`, authenticating `aad`. Returns (nonce, ciphertext_with_tag).
pub fn encrypt(
    key: &SealingKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| AnchorError::Encryption(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| AnchorError::Encryption(e.to_string()))?;

    Ok((nonce, ciphertext))
}

pub fn decrypt(
    key: &SealingKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| AnchorError::Decryption(e.to_string()))?;

    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|e| AnchorError::Decryption(e.to_string()))
}

/// Seal one value under `field`.
pub fn seal_value(key: &SealingKey, field: &str, value: &Value) -> Result<Value> {
    let plaintext =
        serde_json::to_vec(value).map_err(|e| AnchorError::Encryption(e.to_string()))?;
    let (nonce, ciphertext) = encrypt(key, &plaintext, field.as_bytes())?;

    let mut sealed = BTreeMap::new();
    sealed.insert("sealed".to_string(), Value::from(ALGORITHM));
    sealed.insert("nonce".to_string(), Value::from(hex::encode(nonce)));
    sealed.insert("ciphertext".to_string(), Value::from(hex::encode(ciphertext)));
    Ok(Value::Map(sealed))
}

/// Whether `value` has the sealed-field shape.
pub fn is_sealed(value: &Value) -> bool {
    matches!(value, Value::Map(map)
        if matches!(map.get("sealed"), Some(Value::String(alg)) if alg == ALGORITHM))
}

/// Open a value sealed under `field`.
pub fn open_value(key: &SealingKey, field: &str, value: &Value) -> Result<Value> {
    let Value::Map(map) = value else {
        return Err(AnchorError::Decryption(format!("field '{field}' is not sealed")));
    };
    if !is_sealed(value) {
        return Err(AnchorError::Decryption(format!("field '{field}' is not sealed")));
    }

    let hex_part = |name: &str| -> Result<Vec<u8>> {
        match map.get(name) {
            Some(Value::String(s)) => hex::decode(s)
                .map_err(|e| AnchorError::Decryption(format!("field '{field}' {name}: {e}"))),
            _ => Err(AnchorError::Decryption(format!("field '{field}' has no {name}"))),
        }
    };

    let nonce: [u8; NONCE_LEN] = hex_part("nonce")?
        .try_into()
        .map_err(|_| AnchorError::Decryption(format!("field '{field}' has a bad nonce length")))?;
    let ciphertext = hex_part("ciphertext")?;

    let plaintext = decrypt(key, &nonce, &ciphertext, field.as_bytes())?;
    serde_json::from_slice(&plaintext).map_err(|e| AnchorError::Decryption(e.to_string()))
}

/// Replace each named top-level field with its sealed form.
///
/// Every name must be present; already-sealed fields are left alone.
pub fn seal_fields<S: AsRef<str>>(
    record: &mut Record,
    key: &SealingKey,
    fields: &[S],
) -> Result<()> {
    for field in fields {
        let field = field.as_ref();
        let value = record
            .get(field)
            .ok_or_else(|| AnchorError::Encoding(format!("cannot seal missing field '{field}'")))?;
        if is_sealed(value) {
            continue;
        }
        let sealed = seal_value(key, field, value)?;
        record.insert(field, sealed);
    }
    Ok(())
}

/// Plaintext of one sealed top-level field.
pub fn open_field(record: &Record, key: &SealingKey, field: &str) -> Result<Value> {
    let value = record
        .get(field)
        .ok_or_else(|| AnchorError::Decryption(format!("record has no field '{field}'")))?;
    open_value(key, field, value)
}
