/// Evidentiary record data model.
///
/// A `Record` is an immutable map of named fields supplied by the caller
/// (e.g. a police report). Once submitted it is identified by a `RecordId`,
/// its canonical bytes live in content-addressed storage under a
/// `ContentLocator`, and its `Fingerprint` is committed to the ledger as
/// part of a `Commitment`. Lifecycle changes after that point are
/// append-only `StatusEvent`s.
pub mod lifecycle;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{AnchorError, Result};

/// A tagged record value.
///
/// Maps are always `BTreeMap`s so iteration (and therefore serialization)
/// is ordered by key regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Numeric record value.
///
/// Integers and floats are kept apart: `5` and `5.0` are different values
/// and canonicalize differently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::Int(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Number::Int(n.into()))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(Number::UInt(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(Number::Float(n))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

/// An evidentiary record: an ordered map of top-level fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse a record from a JSON object.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| AnchorError::Encoding(format!("record is not a JSON object: {e}")))
    }

    /// Build a record from any serializable struct or map.
    ///
    /// Fails with `Encoding` when the value does not serialize to an object
    /// with string keys.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)
            .map_err(|e| AnchorError::Encoding(format!("record is not serializable: {e}")))?;
        serde_json::from_value(json)
            .map_err(|e| AnchorError::Encoding(format!("record is not a JSON object: {e}")))
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Globally unique record identifier, assigned at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a fresh, time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RecordId {
    type Err = AnchorError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AnchorError::Encoding("record id must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle returned by a storage tier (a CID for content-addressed tiers).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentLocator(String);

impl ContentLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 digest of a record's canonical bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| AnchorError::Encoding(format!("invalid fingerprint hex: {e}")))?;
        let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| {
            AnchorError::Encoding(format!("fingerprint must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Compare two fingerprints without short-circuiting on the first
    /// differing byte.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        crate::crypto::hash::constant_time_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Record lifecycle status.
///
/// `Draft` and `Stored` only ever exist inside the orchestrator; every
/// status from `Committed` on is owned by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Draft,
    Stored,
    Committed,
    UnderReview,
    Verified,
    Rejected,
    Closed,
}

impl Status {
    /// Status code as stored by the commitment contract.
    /// `None` for the pre-ledger states.
    pub fn ledger_code(self) -> Option<u8> {
        match self {
            Status::Draft | Status::Stored => None,
            Status::Committed => Some(0),
            Status::UnderReview => Some(1),
            Status::Verified => Some(2),
            Status::Rejected => Some(3),
            Status::Closed => Some(4),
        }
    }

    pub fn from_ledger_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Status::Committed),
            1 => Ok(Status::UnderReview),
            2 => Ok(Status::Verified),
            3 => Ok(Status::Rejected),
            4 => Ok(Status::Closed),
            other => Err(AnchorError::Serialization(format!(
                "unknown ledger status code {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Draft => "draft",
            Status::Stored => "stored",
            Status::Committed => "committed",
            Status::UnderReview => "under_review",
            Status::Verified => "verified",
            Status::Rejected => "rejected",
            Status::Closed => "closed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = AnchorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "draft" => Ok(Status::Draft),
            "stored" => Ok(Status::Stored),
            "committed" => Ok(Status::Committed),
            "under_review" | "underreview" => Ok(Status::UnderReview),
            "verified" => Ok(Status::Verified),
            "rejected" => Ok(Status::Rejected),
            "closed" => Ok(Status::Closed),
            other => Err(AnchorError::Encoding(format!("unknown status '{other}'"))),
        }
    }
}

/// The ledger-anchored commitment for one record. Immutable once confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub record_id: RecordId,
    pub locator: ContentLocator,
    pub fingerprint: Fingerprint,
    pub submitter: Address,
    pub timestamp: DateTime<Utc>,
}

/// One append-only lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub record_id: RecordId,
    pub status: Status,
    pub actor: Address,
    pub timestamp: DateTime<Utc>,
}
