/// Canonicalization and hashing utilities.
///
/// A record's canonical form is compact JSON with every map's keys in
/// ascending byte order. The fingerprint committed to the ledger is the
/// SHA-256 of those bytes. Content locators for the tiers that compute
/// their own (local cache, simulation) are CIDv1 over the raw bytes,
/// matching what IPFS assigns a single-block raw-leaf upload.
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use sha2::{Digest, Sha256};

use crate::error::{AnchorError, Result};
use crate::record::{ContentLocator, Fingerprint, Number, Record, Value};

/// Multicodec code for raw binary blocks.
const RAW_CODEC: u64 = 0x55;

/// Serialize a record to its canonical byte form.
///
/// Fails with `Encoding` on values that have no canonical JSON form
/// (non-finite floats).
pub fn canonicalize(record: &Record) -> Result<Vec<u8>> {
    for (key, value) in record.fields() {
        check_encodable(key, value)?;
    }
    serde_json::to_vec(record).map_err(|e| AnchorError::Encoding(e.to_string()))
}

fn check_encodable(path: &str, value: &Value) -> Result<()> {
    match value {
        Value::Number(Number::Float(f)) if !f.is_finite() => Err(AnchorError::Encoding(format!(
            "field '{path}' holds a non-finite number"
        ))),
        Value::List(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| check_encodable(&format!("{path}[{i}]"), item)),
        Value::Map(map) => map
            .iter()
            .try_for_each(|(k, v)| check_encodable(&format!("{path}.{k}"), v)),
        _ => Ok(()),
    }
}

/// SHA-256 fingerprint of arbitrary bytes.
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    Fingerprint::from_bytes(Sha256::digest(data).into())
}

/// Canonicalize a record and fingerprint the result.
pub fn fingerprint_record(record: &Record) -> Result<(Vec<u8>, Fingerprint)> {
    let bytes = canonicalize(record)?;
    let fp = fingerprint(&bytes);
    Ok((bytes, fp))
}

/// Content-derived locator (CIDv1, raw codec, sha2-256) for `data`.
pub fn content_locator(data: &[u8]) -> ContentLocator {
    let digest = Code::Sha2_256.digest(data);
    ContentLocator::new(Cid::new_v1(RAW_CODEC, digest).to_string())
}

/// Compare two byte strings touching every byte regardless of where
/// they first differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
