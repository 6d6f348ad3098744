use thiserror::Error;

use crate::record::{RecordId, Status};
use crate::storage::TierFailure;

#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("Record encoding failed: {0}")]
    Encoding(String),

    #[error("All storage tiers failed: {}", format_attempts(.attempts))]
    StorageUnavailable { attempts: Vec<TierFailure> },

    #[error("Storage tier error: {0}")]
    Storage(String),

    #[error("Ledger unreachable: {0}")]
    Connectivity(String),

    #[error("Transaction {tx_hash} was broadcast but not confirmed in time")]
    ConfirmationTimeout { tx_hash: String },

    #[error("Record {0} already has a commitment")]
    DuplicateRecordId(RecordId),

    #[error("Record {0} has no commitment")]
    UnknownRecordId(RecordId),

    #[error("Status {to} is not reachable from {from}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Connected to chain {actual}, expected chain {expected}")]
    WrongNetwork { expected: u64, actual: u64 },

    #[error("Ledger rejected the operation: {0}")]
    LedgerRejected(String),

    #[error("Submission of record {0} was cancelled")]
    Cancelled(RecordId),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AnchorError {
    /// Whether the same call may succeed later without caller changes.
    ///
    /// Ledger-side retries must re-query before re-submitting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnchorError::StorageUnavailable { .. }
                | AnchorError::Storage(_)
                | AnchorError::Connectivity(_)
                | AnchorError::ConfirmationTimeout { .. }
                | AnchorError::Io(_)
        )
    }
}

fn format_attempts(attempts: &[TierFailure]) -> String {
    if attempts.is_empty() {
        return "no tiers configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.tier, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, AnchorError>;
