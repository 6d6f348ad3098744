/// Anchoring orchestrator.
///
/// Drives one record through the submission flow:
/// 1. Canonicalize and fingerprint the record (`Draft`)
/// 2. Write the canonical bytes through the storage tiers (`Stored`)
/// 3. Pin the locator (best effort)
/// 4. Commit locator + fingerprint to the ledger and wait for confirmation
///    (`Committed`)
///
/// After that, the ledger owns the record. The orchestrator only keeps
/// in-flight submissions that have not reached the ledger yet, plus a
/// read-through status cache that is never treated as authoritative.
///
/// Submissions and status changes for the same `RecordId` are serialized
/// through a per-id lock. Different ids proceed concurrently.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attachment::{self, Attachment, UploadedAttachment};
use crate::config::AnchorConfig;
use crate::crypto::hash;
use crate::crypto::identity::Identity;
use crate::error::{AnchorError, Result};
use crate::ledger::evm::EvmLedger;
use crate::ledger::memory::MemoryLedger;
use crate::ledger::{CommitmentRequest, Confirmation, Ledger, LedgerRecord};
use crate::record::lifecycle::LifecyclePolicy;
use crate::record::{Commitment, ContentLocator, Fingerprint, Record, RecordId, Status, StatusEvent};
use crate::storage::{Placement, TieredStorage};

/// Result of a confirmed submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub record_id: RecordId,
    pub locator: ContentLocator,
    pub fingerprint: Fingerprint,
    /// Storage tier that accepted the payload.
    pub tier: String,
    /// Tier that accepted the pin, if any did.
    pub pinned_on: Option<String>,
    pub confirmation: Confirmation,
}

/// Outcome of [`Anchorer::resume`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resumed {
    /// The remaining stages ran and the ledger confirmed the commitment.
    Submitted(SubmitReceipt),
    /// The commitment had already landed; nothing was re-submitted.
    AlreadyCommitted(RecordStatus),
}

impl Resumed {
    pub fn record_id(&self) -> &RecordId {
        match self {
            Self::Submitted(receipt) => &receipt.record_id,
            Self::AlreadyCommitted(status) => &status.record_id,
        }
    }
}

/// Current view of a record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordStatus {
    pub record_id: RecordId,
    pub status: Status,
    /// `None` while the submission has not reached the ledger.
    pub commitment: Option<Commitment>,
    /// Confirmed status events, oldest first. Empty while pending.
    pub history: Vec<StatusEvent>,
}

impl RecordStatus {
    fn from_ledger(record_id: RecordId, record: LedgerRecord) -> Self {
        Self {
            record_id,
            status: record.status,
            commitment: Some(record.commitment),
            history: record.history,
        }
    }
}

/// A submission that has not been confirmed by the ledger.
#[derive(Debug, Clone)]
struct PendingSubmission {
    canonical: Vec<u8>,
    fingerprint: Fingerprint,
    placement: Option<Placement>,
    pinned_on: Option<String>,
    last_error: Option<String>,
}

impl PendingSubmission {
    fn stage(&self) -> Status {
        if self.placement.is_some() {
            Status::Stored
        } else {
            Status::Draft
        }
    }
}

struct CachedStatus {
    status: RecordStatus,
    fetched_at: Instant,
}

/// The orchestrator. Construct once and share behind an `Arc`.
pub struct Anchorer {
    storage: Arc<TieredStorage>,
    ledger: Arc<dyn Ledger>,
    policy: LifecyclePolicy,
    status_ttl: Duration,
    pending: RwLock<HashMap<RecordId, PendingSubmission>>,
    cache: RwLock<HashMap<RecordId, CachedStatus>>,
    locks: Mutex<HashMap<RecordId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Anchorer {
    pub fn new(
        storage: Arc<TieredStorage>,
        ledger: Arc<dyn Ledger>,
        policy: LifecyclePolicy,
        status_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            ledger,
            policy,
            status_ttl,
            pending: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build the storage chain and ledger client described by `config`.
    pub async fn from_config(config: &AnchorConfig) -> Result<Self> {
        config.validate()?;
        let policy = config.lifecycle.policy();
        let storage = Arc::new(TieredStorage::from_config(&config.storage).await?);

        let ledger: Arc<dyn Ledger> = if config.ledger.simulate {
            warn!("Ledger simulation enabled: commitments are not externally verifiable");
            Arc::new(
                MemoryLedger::new(policy)
                    .with_confirmation_timeout(config.ledger.confirmation_timeout),
            )
        } else {
            Arc::new(EvmLedger::new(config.ledger.clone(), policy)?)
        };

        info!(
            tiers = ?storage.tier_names(),
            ledger = ledger.name(),
            "Anchorer ready"
        );

        Ok(Self::new(storage, ledger, policy, config.lifecycle.status_ttl))
    }

    pub fn storage(&self) -> Arc<TieredStorage> {
        Arc::clone(&self.storage)
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Anchor `record` under a freshly generated id.
    pub async fn submit(&self, record: &Record, signer: &dyn Identity) -> Result<SubmitReceipt> {
        self.submit_with_id(RecordId::generate(), record, signer).await
    }

    /// Anchor `record` under a caller-chosen id.
    pub async fn submit_with_id(
        &self,
        record_id: RecordId,
        record: &Record,
        signer: &dyn Identity,
    ) -> Result<SubmitReceipt> {
        self.submit_cancellable(record_id, record, signer, &CancellationToken::new())
            .await
    }

    /// Anchor `record`, giving up with `Cancelled` if `cancel` fires before
    /// the ledger confirms. A confirmation that is already observed wins
    /// over a concurrent cancellation. A cancelled submission stays pending
    /// and can be finished with [`Anchorer::resume`].
    pub async fn submit_cancellable(
        &self,
        record_id: RecordId,
        record: &Record,
        signer: &dyn Identity,
        cancel: &CancellationToken,
    ) -> Result<SubmitReceipt> {
        let lock = self.lock_for(&record_id);
        let result = {
            let _guard = lock.lock().await;
            self.submit_locked(&record_id, record, signer, cancel).await
        };
        drop(lock);
        self.prune_lock(&record_id);
        result
    }

    async fn submit_locked(
        &self,
        record_id: &RecordId,
        record: &Record,
        signer: &dyn Identity,
        cancel: &CancellationToken,
    ) -> Result<SubmitReceipt> {
        if self.pending_stage(record_id).is_some() {
            return Err(AnchorError::DuplicateRecordId(record_id.clone()));
        }
        if self.ledger.query(record_id).await?.is_some() {
            return Err(AnchorError::DuplicateRecordId(record_id.clone()));
        }
        if cancel.is_cancelled() {
            return Err(AnchorError::Cancelled(record_id.clone()));
        }

        let (canonical, fingerprint) = hash::fingerprint_record(record)?;
        info!(
            record_id = %record_id,
            fingerprint = %fingerprint,
            size = canonical.len(),
            "Starting submission"
        );

        self.pending.write().insert(
            record_id.clone(),
            PendingSubmission {
                canonical,
                fingerprint,
                placement: None,
                pinned_on: None,
                last_error: None,
            },
        );

        self.drive(record_id, signer, cancel).await
    }

    /// Finish a pending submission: store it if it never got that far,
    /// then commit it. Nothing is re-uploaded once the record is `Stored`,
    /// and nothing is re-submitted if the ledger already holds the
    /// commitment (e.g. after `ConfirmationTimeout`).
    pub async fn resume(&self, record_id: &RecordId, signer: &dyn Identity) -> Result<Resumed> {
        let lock = self.lock_for(record_id);
        let result = {
            let _guard = lock.lock().await;
            self.resume_locked(record_id, signer).await
        };
        drop(lock);
        self.prune_lock(record_id);
        result
    }

    async fn resume_locked(&self, record_id: &RecordId, signer: &dyn Identity) -> Result<Resumed> {
        if self.pending_stage(record_id).is_none() {
            return Err(AnchorError::UnknownRecordId(record_id.clone()));
        }
        if let Some(status) = self.settle_stored(record_id).await? {
            return Ok(Resumed::AlreadyCommitted(status));
        }
        self.drive(record_id, signer, &CancellationToken::new())
            .await
            .map(Resumed::Submitted)
    }

    /// Store evidence files through the storage tiers. The returned refs
    /// are meant for [`attachment::attach`] on the record before it is
    /// submitted; nothing touches the ledger here.
    pub async fn upload_attachments(
        &self,
        files: &[Attachment],
    ) -> Result<Vec<UploadedAttachment>> {
        attachment::upload_all(&self.storage, files).await
    }

    /// Re-query the ledger for a record whose submission was left pending
    /// (typically after `ConfirmationTimeout`). If the commitment landed,
    /// the pending entry is dropped and the ledger's view is returned.
    /// `Ok(None)` means the ledger still has no commitment.
    pub async fn reconcile(&self, record_id: &RecordId) -> Result<Option<RecordStatus>> {
        let lock = self.lock_for(record_id);
        let result = {
            let _guard = lock.lock().await;
            self.reconcile_locked(record_id).await
        };
        drop(lock);
        self.prune_lock(record_id);
        result
    }

    async fn reconcile_locked(&self, record_id: &RecordId) -> Result<Option<RecordStatus>> {
        Ok(self
            .ledger
            .query(record_id)
            .await?
            .map(|record| self.adopt(record_id, record)))
    }

    /// Take the ledger's view of a record whose submission is still
    /// pending locally. The ledger wins; the pending entry is dropped.
    fn adopt(&self, record_id: &RecordId, record: LedgerRecord) -> RecordStatus {
        if let Some(pending) = self.pending.write().remove(record_id) {
            if pending.fingerprint.matches(&record.commitment.fingerprint) {
                info!(record_id = %record_id, "Pending submission found on ledger");
            } else {
                warn!(
                    record_id = %record_id,
                    local = %pending.fingerprint,
                    ledger = %record.commitment.fingerprint,
                    "Ledger holds a different commitment for this id; local submission dropped"
                );
            }
        }

        let status = RecordStatus::from_ledger(record_id.clone(), record);
        self.remember(&status);
        status
    }

    /// For a `Stored` submission, ask the ledger whether the commitment
    /// landed anyway and adopt it if so. `None` when there is nothing
    /// pending, or the ledger has no commitment yet.
    async fn settle_stored(&self, record_id: &RecordId) -> Result<Option<RecordStatus>> {
        if self.pending_stage(record_id) != Some(Status::Stored) {
            return Ok(None);
        }
        Ok(self
            .ledger
            .query(record_id)
            .await?
            .map(|record| self.adopt(record_id, record)))
    }

    /// Move a committed record to `status`.
    pub async fn advance(
        &self,
        record_id: &RecordId,
        status: Status,
        signer: &dyn Identity,
    ) -> Result<Confirmation> {
        let lock = self.lock_for(record_id);
        let result = {
            let _guard = lock.lock().await;
            self.advance_locked(record_id, status, signer).await
        };
        drop(lock);
        self.prune_lock(record_id);
        result
    }

    async fn advance_locked(
        &self,
        record_id: &RecordId,
        status: Status,
        signer: &dyn Identity,
    ) -> Result<Confirmation> {
        self.settle_stored(record_id).await?;
        if let Some(stage) = self.pending_stage(record_id) {
            return Err(AnchorError::InvalidTransition {
                from: stage,
                to: status,
            });
        }

        // Cached status is only used to fail fast; the ledger re-checks.
        if let Some(current) = self.cached(record_id).map(|s| s.status) {
            self.policy.check(current, status)?;
        }

        let result = self.ledger.update_status(record_id, status, signer).await;
        self.cache.write().remove(record_id);
        let confirmation = result?;

        info!(
            record_id = %record_id,
            status = %status,
            actor = %signer.address(),
            tx_id = %confirmation.tx_id,
            "Status advanced"
        );
        Ok(confirmation)
    }

    /// Current status and history. A `Stored` submission is checked
    /// against the ledger first, since its commitment may have landed
    /// without a confirmation being observed. Other pending submissions
    /// are answered locally; committed records through the cache,
    /// refreshed from the ledger once stale.
    pub async fn status(&self, record_id: &RecordId) -> Result<RecordStatus> {
        match self.settle_stored(record_id).await {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    record_id = %record_id,
                    error = %e,
                    "Ledger check failed, reporting local stage"
                );
            }
        }

        if let Some(stage) = self.pending_stage(record_id) {
            return Ok(RecordStatus {
                record_id: record_id.clone(),
                status: stage,
                commitment: None,
                history: Vec::new(),
            });
        }

        if let Some(status) = self.cached(record_id) {
            return Ok(status);
        }

        let record = self
            .ledger
            .query(record_id)
            .await?
            .ok_or_else(|| AnchorError::UnknownRecordId(record_id.clone()))?;
        let status = RecordStatus::from_ledger(record_id.clone(), record);
        self.remember(&status);
        Ok(status)
    }

    /// Ids with unfinished submissions, and the error that stopped each.
    pub fn pending(&self) -> Vec<(RecordId, Status, Option<String>)> {
        let mut out: Vec<_> = self
            .pending
            .read()
            .iter()
            .map(|(id, p)| (id.clone(), p.stage(), p.last_error.clone()))
            .collect();
        out.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        out
    }

    fn pending_stage(&self, record_id: &RecordId) -> Option<Status> {
        self.pending.read().get(record_id).map(PendingSubmission::stage)
    }

    fn mark_stored(&self, record_id: &RecordId, placement: &Placement, pinned_on: Option<String>) {
        if let Some(entry) = self.pending.write().get_mut(record_id) {
            entry.placement = Some(placement.clone());
            entry.pinned_on = pinned_on;
        }
        info!(record_id = %record_id, locator = %placement.locator, "Record stored");
    }

    fn cached(&self, record_id: &RecordId) -> Option<RecordStatus> {
        let cache = self.cache.read();
        let entry = cache.get(record_id)?;
        (entry.fetched_at.elapsed() < self.status_ttl).then(|| entry.status.clone())
    }

    fn remember(&self, status: &RecordStatus) {
        self.cache.write().insert(
            status.record_id.clone(),
            CachedStatus {
                status: status.clone(),
                fetched_at: Instant::now(),
            },
        );
    }

    fn lock_for(&self, record_id: &RecordId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(record_id.clone()).or_default())
    }

    fn prune_lock(&self, record_id: &RecordId) {
        let mut locks = self.locks.lock();
        if locks
            .get(record_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(record_id);
        }
    }
}

/// Run `fut` unless `cancel` fires first. If both are ready, the result
/// of `fut` wins.
async fn cancellable<T>(
    record_id: &RecordId,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        result = fut => result,
        _ = cancel.cancelled() => {
            info!(record_id = %record_id, "Submission cancelled");
            Err(AnchorError::Cancelled(record_id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::LocalIdentity;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::StorageBackend;

    const TIER_TIMEOUT: Duration = Duration::from_secs(1);

    struct Harness {
        anchorer: Anchorer,
        primary: Arc<MemoryBackend>,
        ledger: Arc<MemoryLedger>,
        signer: LocalIdentity,
    }

    fn harness() -> Harness {
        let primary = Arc::new(MemoryBackend::new("primary"));
        let storage = TieredStorage::new().with_tier(primary.clone(), TIER_TIMEOUT);
        let ledger = Arc::new(
            MemoryLedger::new(LifecyclePolicy::default())
                .with_confirmation_timeout(Duration::from_millis(50)),
        );
        let anchorer = Anchorer::new(
            Arc::new(storage),
            ledger.clone(),
            LifecyclePolicy::default(),
            Duration::from_secs(60),
        );
        Harness {
            anchorer,
            primary,
            ledger,
            signer: LocalIdentity::random(),
        }
    }

    fn theft() -> Record {
        Record::new().with("type", "theft").with("amount", 500)
    }

    #[tokio::test]
    async fn test_submit_commits_record() {
        let h = harness();
        let receipt = h.anchorer.submit(&theft(), &h.signer).await.unwrap();

        assert_eq!(receipt.tier, "primary");
        assert_eq!(receipt.pinned_on.as_deref(), Some("primary"));
        assert!(h.primary.contains(&receipt.locator));

        let status = h.anchorer.status(&receipt.record_id).await.unwrap();
        assert_eq!(status.status, Status::Committed);
        let commitment = status.commitment.unwrap();
        assert_eq!(commitment.fingerprint, receipt.fingerprint);
        assert_eq!(commitment.submitter, h.signer.address());
        assert_eq!(status.history.len(), 1);
        assert!(h.anchorer.pending().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let h = harness();
        let id: RecordId = "fir-1".parse().unwrap();
        let first = h
            .anchorer
            .submit_with_id(id.clone(), &theft(), &h.signer)
            .await
            .unwrap();

        let other = Record::new().with("type", "fraud");
        let err = h
            .anchorer
            .submit_with_id(id.clone(), &other, &h.signer)
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::DuplicateRecordId(_)));

        let status = h.anchorer.status(&id).await.unwrap();
        assert_eq!(status.commitment.unwrap().fingerprint, first.fingerprint);
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_draft() {
        let h = harness();
        h.primary.set_available(false);
        let id: RecordId = "fir-2".parse().unwrap();

        let err = h
            .anchorer
            .submit_with_id(id.clone(), &theft(), &h.signer)
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::StorageUnavailable { .. }));
        assert_eq!(h.anchorer.status(&id).await.unwrap().status, Status::Draft);

        h.primary.set_available(true);
        let resumed = h.anchorer.resume(&id, &h.signer).await.unwrap();
        assert_eq!(resumed.record_id(), &id);
        assert!(matches!(resumed, Resumed::Submitted(_)));
        assert_eq!(
            h.anchorer.status(&id).await.unwrap().status,
            Status::Committed
        );
    }

    #[tokio::test]
    async fn test_ledger_offline_leaves_stored_and_resume_skips_upload() {
        let h = harness();
        let id: RecordId = "fir-3".parse().unwrap();
        h.ledger.set_offline(true);

        // Offline ledger fails the duplicate pre-check before anything is stored.
        let err = h
            .anchorer
            .submit_with_id(id.clone(), &theft(), &h.signer)
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::Connectivity(_)));
        assert!(h.primary.is_empty());

        // Refuse only the write, after storage succeeded.
        h.ledger.set_offline(false);
        h.ledger.set_faults(crate::ledger::memory::LedgerFaults {
            authorized: Some(Default::default()),
            ..Default::default()
        });
        let err = h
            .anchorer
            .submit_with_id(id.clone(), &theft(), &h.signer)
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::Authorization(_)));
        assert_eq!(h.anchorer.status(&id).await.unwrap().status, Status::Stored);
        assert_eq!(h.primary.len(), 1);

        h.ledger.set_faults(Default::default());
        h.primary.set_available(false);
        h.anchorer.resume(&id, &h.signer).await.unwrap();
        assert_eq!(
            h.anchorer.status(&id).await.unwrap().status,
            Status::Committed
        );
    }

    #[tokio::test]
    async fn test_confirmation_timeout_then_reconcile() {
        let h = harness();
        let id: RecordId = "fir-4".parse().unwrap();
        h.ledger.set_withhold_confirmations(true);

        let err = h
            .anchorer
            .submit_with_id(id.clone(), &theft(), &h.signer)
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::ConfirmationTimeout { .. }));
        assert_eq!(h.anchorer.pending()[0].1, Status::Stored);

        let reconciled = h.anchorer.reconcile(&id).await.unwrap().unwrap();
        assert_eq!(reconciled.status, Status::Committed);
        assert!(h.anchorer.pending().is_empty());
    }

    #[tokio::test]
    async fn test_stored_submission_adopts_landed_commitment() {
        let h = harness();
        h.ledger.set_withhold_confirmations(true);
        let ids: Vec<RecordId> = ["fir-s1", "fir-s2", "fir-s3"]
            .iter()
            .map(|raw| raw.parse().unwrap())
            .collect();
        for id in &ids {
            let err = h
                .anchorer
                .submit_with_id(id.clone(), &theft(), &h.signer)
                .await
                .unwrap_err();
            assert!(matches!(err, AnchorError::ConfirmationTimeout { .. }));
        }
        assert!(h.anchorer.pending().iter().all(|p| p.1 == Status::Stored));
        h.ledger.set_withhold_confirmations(false);

        let status = h.anchorer.status(&ids[0]).await.unwrap();
        assert_eq!(status.status, Status::Committed);
        assert!(status.commitment.is_some());
        h.anchorer
            .advance(&ids[0], Status::UnderReview, &h.signer)
            .await
            .unwrap();

        h.anchorer
            .advance(&ids[1], Status::UnderReview, &h.signer)
            .await
            .unwrap();
        assert_eq!(
            h.anchorer.status(&ids[1]).await.unwrap().status,
            Status::UnderReview
        );

        let resumed = h.anchorer.resume(&ids[2], &h.signer).await.unwrap();
        match resumed {
            Resumed::AlreadyCommitted(status) => assert_eq!(status.status, Status::Committed),
            other => panic!("expected adoption, got {other:?}"),
        }
        assert!(h.anchorer.pending().is_empty());
        assert_eq!(h.primary.len(), 1);
    }

    #[tokio::test]
    async fn test_stored_status_falls_back_when_ledger_offline() {
        let h = harness();
        let id: RecordId = "fir-s4".parse().unwrap();
        h.ledger.set_withhold_confirmations(true);
        h.anchorer
            .submit_with_id(id.clone(), &theft(), &h.signer)
            .await
            .unwrap_err();

        h.ledger.set_offline(true);
        assert_eq!(h.anchorer.status(&id).await.unwrap().status, Status::Stored);
        assert!(matches!(
            h.anchorer.advance(&id, Status::UnderReview, &h.signer).await,
            Err(AnchorError::Connectivity(_))
        ));
        assert_eq!(h.anchorer.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_without_commitment() {
        let h = harness();
        let id: RecordId = "fir-5".parse().unwrap();
        assert!(h.anchorer.reconcile(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advance_and_history() {
        let h = harness();
        let receipt = h.anchorer.submit(&theft(), &h.signer).await.unwrap();
        let id = receipt.record_id;

        h.anchorer
            .advance(&id, Status::UnderReview, &h.signer)
            .await
            .unwrap();
        h.anchorer
            .advance(&id, Status::Verified, &h.signer)
            .await
            .unwrap();

        let status = h.anchorer.status(&id).await.unwrap();
        assert_eq!(status.status, Status::Verified);
        let statuses: Vec<Status> = status.history.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![Status::Committed, Status::UnderReview, Status::Verified]
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_keeps_history() {
        let h = harness();
        let receipt = h.anchorer.submit(&theft(), &h.signer).await.unwrap();
        let id = receipt.record_id;
        h.anchorer
            .advance(&id, Status::Rejected, &h.signer)
            .await
            .unwrap();
        h.anchorer.advance(&id, Status::Closed, &h.signer).await.unwrap();

        let before = h.anchorer.status(&id).await.unwrap();
        let err = h
            .anchorer
            .advance(&id, Status::UnderReview, &h.signer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AnchorError::InvalidTransition {
                from: Status::Closed,
                to: Status::UnderReview
            }
        ));
        let after = h.anchorer.status(&id).await.unwrap();
        assert_eq!(before.history, after.history);
    }

    #[tokio::test]
    async fn test_advance_unknown_and_pending() {
        let h = harness();
        let unknown: RecordId = "nope".parse().unwrap();
        assert!(matches!(
            h.anchorer
                .advance(&unknown, Status::UnderReview, &h.signer)
                .await,
            Err(AnchorError::UnknownRecordId(_))
        ));

        h.primary.set_available(false);
        let id: RecordId = "fir-6".parse().unwrap();
        let _ = h.anchorer.submit_with_id(id.clone(), &theft(), &h.signer).await;
        assert!(matches!(
            h.anchorer.advance(&id, Status::Verified, &h.signer).await,
            Err(AnchorError::InvalidTransition {
                from: Status::Draft,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_storage() {
        let h = harness();
        let id: RecordId = "fir-7".parse().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .anchorer
            .submit_cancellable(id.clone(), &theft(), &h.signer, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::Cancelled(_)));
        assert!(h.primary.is_empty());
        assert!(matches!(
            h.anchorer.status(&id).await,
            Err(AnchorError::UnknownRecordId(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_slow_storage_then_resume() {
        let h = harness();
        h.primary.set_latency(Some(Duration::from_millis(500)));
        let id: RecordId = "fir-8".parse().unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = h
            .anchorer
            .submit_cancellable(id.clone(), &theft(), &h.signer, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::Cancelled(_)));
        assert_eq!(h.anchorer.status(&id).await.unwrap().status, Status::Draft);

        h.primary.set_latency(None);
        h.anchorer.resume(&id, &h.signer).await.unwrap();
        assert_eq!(
            h.anchorer.status(&id).await.unwrap().status,
            Status::Committed
        );
    }

    /// Ledger that fires a cancellation token in the same poll that its
    /// confirmation becomes ready.
    struct CancelOnConfirm {
        inner: MemoryLedger,
        token: CancellationToken,
    }

    #[async_trait::async_trait]
    impl Ledger for CancelOnConfirm {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn submit(
            &self,
            request: &CommitmentRequest,
            signer: &dyn Identity,
        ) -> Result<Confirmation> {
            let confirmation = self.inner.submit(request, signer).await;
            self.token.cancel();
            confirmation
        }

        async fn update_status(
            &self,
            record_id: &RecordId,
            status: Status,
            signer: &dyn Identity,
        ) -> Result<Confirmation> {
            self.inner.update_status(record_id, status, signer).await
        }

        async fn query(&self, record_id: &RecordId) -> Result<Option<LedgerRecord>> {
            self.inner.query(record_id).await
        }

        async fn events(&self, record_id: &RecordId) -> Result<Vec<crate::ledger::LedgerEvent>> {
            self.inner.events(record_id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_after_confirmation_has_no_effect() {
        let token = CancellationToken::new();
        let ledger = Arc::new(CancelOnConfirm {
            inner: MemoryLedger::new(LifecyclePolicy::default()),
            token: token.clone(),
        });
        let storage = TieredStorage::new()
            .with_tier(Arc::new(MemoryBackend::new("primary")), TIER_TIMEOUT);
        let anchorer = Anchorer::new(
            Arc::new(storage),
            ledger,
            LifecyclePolicy::default(),
            Duration::from_secs(60),
        );
        let signer = LocalIdentity::random();
        let id: RecordId = "fir-late-cancel".parse().unwrap();

        let receipt = anchorer
            .submit_cancellable(id.clone(), &theft(), &signer, &token)
            .await
            .unwrap();
        assert!(token.is_cancelled());
        assert_eq!(receipt.record_id, id);
        assert!(anchorer.pending().is_empty());
        assert_eq!(
            anchorer.status(&id).await.unwrap().status,
            Status::Committed
        );
    }

    #[tokio::test]
    async fn test_concurrent_same_id_single_commitment() {
        let h = Arc::new(harness());
        let id: RecordId = "fir-9".parse().unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = Arc::clone(&h);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                h.anchorer.submit_with_id(id, &theft(), &h.signer).await
            }));
        }

        let mut ok = 0;
        let mut dup = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AnchorError::DuplicateRecordId(_)) => dup += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(dup, 7);
        assert_eq!(h.ledger.events(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_locks_are_pruned() {
        let h = harness();
        h.anchorer.submit(&theft(), &h.signer).await.unwrap();
        assert!(h.anchorer.locks.lock().is_empty());
    }
}
