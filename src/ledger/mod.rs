/// Commitment ledger abstraction.
///
/// The ledger is the source of truth for every record once committed: the
/// `Commitment` (locator + fingerprint + submitter) is written exactly once
/// per `RecordId`, and every later lifecycle change is an appended
/// `StatusEvent`. Writes only count once the ledger has confirmed them.
///
/// Implementations:
/// - `evm`: a commitment contract on an EVM chain, over JSON-RPC
/// - `memory`: an in-process ledger for simulation runs and tests
pub mod evm;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use alloy::primitives::Address;

use crate::crypto::identity::Identity;
use crate::error::Result;
use crate::record::{Commitment, ContentLocator, Fingerprint, RecordId, Status, StatusEvent};

/// What the submitter asks the ledger to commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitmentRequest {
    pub record_id: RecordId,
    pub locator: ContentLocator,
    pub fingerprint: Fingerprint,
}

/// Proof that a ledger write was confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Which ledger (e.g., "evm:80002", "memory").
    pub ledger: String,
    /// Transaction hash/ID.
    pub tx_id: String,
    /// Block the write was included in, where the ledger has blocks.
    pub block_number: Option<u64>,
    /// Resource cost actually consumed (gas on EVM ledgers).
    pub gas_used: Option<u64>,
}

/// A committed record as the ledger currently sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub commitment: Commitment,
    /// Most recent confirmed status.
    pub status: Status,
    /// Every confirmed status event, oldest first. The first entry is the
    /// initial `Committed` event.
    pub history: Vec<StatusEvent>,
}

/// Ledger-level events, for audit trails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    CommitmentWritten {
        record_id: RecordId,
        locator: ContentLocator,
        submitter: Address,
        tx_id: String,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        record_id: RecordId,
        status: Status,
        actor: Address,
        tx_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl LedgerEvent {
    pub fn record_id(&self) -> &RecordId {
        match self {
            LedgerEvent::CommitmentWritten { record_id, .. }
            | LedgerEvent::StatusChanged { record_id, .. } => record_id,
        }
    }

    /// The status event this ledger event stands for.
    pub fn as_status_event(&self) -> StatusEvent {
        match self {
            LedgerEvent::CommitmentWritten {
                record_id,
                submitter,
                timestamp,
                ..
            } => StatusEvent {
                record_id: record_id.clone(),
                status: Status::Committed,
                actor: *submitter,
                timestamp: *timestamp,
            },
            LedgerEvent::StatusChanged {
                record_id,
                status,
                actor,
                timestamp,
                ..
            } => StatusEvent {
                record_id: record_id.clone(),
                status: *status,
                actor: *actor,
                timestamp: *timestamp,
            },
        }
    }
}

/// Trait for commitment ledgers.
///
/// State-mutating calls return only after the write is confirmed. Protocol
/// violations (`DuplicateRecordId`, `UnknownRecordId`, `InvalidTransition`)
/// must be propagated as such, never swallowed.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Name of the ledger (e.g., "evm:80002").
    fn name(&self) -> &str;

    /// Write a new commitment, signed by `signer`.
    async fn submit(&self, request: &CommitmentRequest, signer: &dyn Identity)
        -> Result<Confirmation>;

    /// Append a status event, signed by `signer`.
    async fn update_status(
        &self,
        record_id: &RecordId,
        status: Status,
        signer: &dyn Identity,
    ) -> Result<Confirmation>;

    /// Read the commitment and status history. `None` if never committed.
    async fn query(&self, record_id: &RecordId) -> Result<Option<LedgerRecord>>;

    /// Audit trail of ledger events for one record, oldest first.
    async fn events(&self, record_id: &RecordId) -> Result<Vec<LedgerEvent>>;
}
