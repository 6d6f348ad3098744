/// Integrity verification for committed records.
///
/// The inverse of submission:
/// 1. Fetch the commitment from the ledger
/// 2. Fetch the payload through the storage tiers by its committed locator
/// 3. Recompute the fingerprint and compare against the committed one
///
/// A payload that no tier can serve is reported as `Unavailable`, never as
/// `Mismatch`. Only bytes that were actually fetched and hash differently
/// count as tampering.
///
/// When the record matches, each attachment it lists is fetched and checked
/// against the fingerprint recorded next to its locator.
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::attachment::{attachments_of, AttachmentRef};
use crate::crypto::hash;
use crate::error::{AnchorError, Result};
use crate::ledger::Ledger;
use crate::record::{ContentLocator, Fingerprint, Record, RecordId};
use crate::storage::TieredStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch,
    Unavailable,
}

/// Outcome of a verification run.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub record_id: RecordId,
    pub verdict: Verdict,
    pub locator: ContentLocator,
    /// Fingerprint committed on the ledger.
    pub expected: Fingerprint,
    /// Fingerprint of the fetched bytes, when any were fetched.
    pub actual: Option<Fingerprint>,
    /// Tier that served the bytes.
    pub tier: Option<String>,
    /// Why the payload could not be fetched.
    pub reason: Option<String>,
    /// Per-file results; only filled in when the record itself matches.
    pub attachments: Vec<AttachmentCheck>,
}

impl Verification {
    /// Record and every attachment matched.
    pub fn all_match(&self) -> bool {
        self.verdict == Verdict::Match
            && self.attachments.iter().all(|a| a.verdict == Verdict::Match)
    }
}

/// Outcome of checking one attachment.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentCheck {
    pub name: String,
    pub locator: ContentLocator,
    pub verdict: Verdict,
    pub tier: Option<String>,
    pub reason: Option<String>,
}

pub struct Verifier {
    storage: Arc<TieredStorage>,
    ledger: Arc<dyn Ledger>,
}

impl Verifier {
    pub fn new(storage: Arc<TieredStorage>, ledger: Arc<dyn Ledger>) -> Self {
        Self { storage, ledger }
    }

    /// Check the stored payload of `record_id` against its commitment.
    ///
    /// Errors only when the commitment itself cannot be read (unknown id,
    /// ledger unreachable). Storage trouble becomes `Verdict::Unavailable`.
    pub async fn verify(&self, record_id: &RecordId) -> Result<Verification> {
        let record = self
            .ledger
            .query(record_id)
            .await?
            .ok_or_else(|| AnchorError::UnknownRecordId(record_id.clone()))?;
        let commitment = record.commitment;

        let retrieved = match self.storage.get(&commitment.locator).await {
            Ok(retrieved) => retrieved,
            Err(e) => {
                warn!(
                    record_id = %record_id,
                    locator = %commitment.locator,
                    error = %e,
                    "Payload unavailable on every tier"
                );
                return Ok(Verification {
                    record_id: record_id.clone(),
                    verdict: Verdict::Unavailable,
                    locator: commitment.locator,
                    expected: commitment.fingerprint,
                    actual: None,
                    tier: None,
                    reason: Some(e.to_string()),
                    attachments: Vec::new(),
                });
            }
        };

        let actual = hash::fingerprint(&retrieved.data);
        let verdict = if actual.matches(&commitment.fingerprint) {
            info!(record_id = %record_id, tier = %retrieved.tier, "Payload matches commitment");
            Verdict::Match
        } else {
            error!(
                record_id = %record_id,
                tier = %retrieved.tier,
                expected = %commitment.fingerprint,
                actual = %actual,
                "Payload does not match commitment"
            );
            Verdict::Mismatch
        };

        let attachments = if verdict == Verdict::Match {
            self.verify_attachments(record_id, &retrieved.data).await
        } else {
            Vec::new()
        };

        Ok(Verification {
            record_id: record_id.clone(),
            verdict,
            locator: commitment.locator,
            expected: commitment.fingerprint,
            actual: Some(actual),
            tier: Some(retrieved.tier),
            reason: None,
            attachments,
        })
    }

    async fn verify_attachments(
        &self,
        record_id: &RecordId,
        payload: &[u8],
    ) -> Vec<AttachmentCheck> {
        let refs = std::str::from_utf8(payload)
            .map_err(|e| AnchorError::Encoding(e.to_string()))
            .and_then(Record::from_json)
            .and_then(|record| attachments_of(&record));
        let refs = match refs {
            Ok(refs) => refs,
            Err(e) => {
                warn!(record_id = %record_id, error = %e, "Attachment list unreadable");
                return Vec::new();
            }
        };

        let mut checks = Vec::with_capacity(refs.len());
        for reference in &refs {
            checks.push(self.verify_attachment(reference).await);
        }
        checks
    }

    /// Fetch one attachment and compare it to its recorded fingerprint.
    pub async fn verify_attachment(&self, reference: &AttachmentRef) -> AttachmentCheck {
        let (verdict, tier, reason) = match self.storage.get(&reference.locator).await {
            Ok(retrieved) => {
                if hash::fingerprint(&retrieved.data).matches(&reference.fingerprint) {
                    (Verdict::Match, Some(retrieved.tier), None)
                } else {
                    error!(
                        name = %reference.name,
                        locator = %reference.locator,
                        tier = %retrieved.tier,
                        "Attachment does not match its fingerprint"
                    );
                    (Verdict::Mismatch, Some(retrieved.tier), None)
                }
            }
            Err(e) => (Verdict::Unavailable, None, Some(e.to_string())),
        };

        AttachmentCheck {
            name: reference.name.clone(),
            locator: reference.locator.clone(),
            verdict,
            tier,
            reason,
        }
    }
}
