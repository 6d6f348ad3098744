/// Record lifecycle state machine.
///
/// ```text
/// Draft ──▶ Stored ──▶ Committed ──▶ { UnderReview, Verified, Rejected } ──▶ Closed
/// ```
///
/// `UnderReview`, `Verified` and `Rejected` are reachable from `Committed`
/// and from each other. `Closed` is terminal. Whether `Rejected` is also
/// terminal is a deployment decision carried by `LifecyclePolicy`.
use serde::{Deserialize, Serialize};

use super::Status;
use crate::error::{AnchorError, Result};

/// Lifecycle rules that differ between deployments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// When set, `Rejected` accepts no further status events.
    #[serde(default)]
    pub rejected_is_final: bool,
}

impl LifecyclePolicy {
    pub fn new(rejected_is_final: bool) -> Self {
        Self { rejected_is_final }
    }

    pub fn is_terminal(&self, status: Status) -> bool {
        match status {
            Status::Closed => true,
            Status::Rejected => self.rejected_is_final,
            _ => false,
        }
    }

    /// Whether `to` is directly reachable from `from`.
    pub fn can_transition(&self, from: Status, to: Status) -> bool {
        use Status::*;

        if self.is_terminal(from) || from == to {
            return false;
        }

        match (from, to) {
            (Draft, Stored) | (Stored, Committed) => true,
            (Committed, UnderReview | Verified | Rejected) => true,
            (UnderReview | Verified | Rejected, UnderReview | Verified | Rejected) => true,
            (UnderReview | Verified | Rejected, Closed) => true,
            _ => false,
        }
    }

    pub fn check(&self, from: Status, to: Status) -> Result<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(AnchorError::InvalidTransition { from, to })
        }
    }
}
