/// In-process commitment ledger.
///
/// Enforces the same protocol as the on-chain contract (first write wins,
/// status changes only for known records and only along the lifecycle),
/// so it doubles as an explicit simulation ledger and as the test double
/// for the orchestrator. Faults can be injected to exercise connectivity,
/// authorization and confirmation-timeout paths.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::info;

use super::{CommitmentRequest, Confirmation, Ledger, LedgerEvent, LedgerRecord};
use crate::crypto::hash;
use crate::crypto::identity::Identity;
use crate::error::{AnchorError, Result};
use crate::record::lifecycle::LifecyclePolicy;
use crate::record::{Commitment, RecordId, Status, StatusEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Failure injection switches.
#[derive(Debug, Clone, Default)]
pub struct LedgerFaults {
    /// Every call fails with `Connectivity`.
    pub offline: bool,
    /// Writes are applied, but confirmation is never observed.
    pub withhold_confirmations: bool,
    /// When set, only these addresses may write.
    pub authorized: Option<HashSet<Address>>,
}

/// In-memory ledger.
pub struct MemoryLedger {
    policy: LifecyclePolicy,
    confirmation_timeout: Duration,
    records: RwLock<HashMap<RecordId, LedgerRecord>>,
    log: RwLock<Vec<LedgerEvent>>,
    events_tx: broadcast::Sender<LedgerEvent>,
    faults: Mutex<LedgerFaults>,
    block: AtomicU64,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(LifecyclePolicy::default())
    }
}

impl MemoryLedger {
    pub fn new(policy: LifecyclePolicy) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            policy,
            confirmation_timeout: Duration::from_secs(5),
            records: RwLock::new(HashMap::new()),
            log: RwLock::new(Vec::new()),
            events_tx,
            faults: Mutex::new(LedgerFaults::default()),
            block: AtomicU64::new(0),
        }
    }

    /// How long a withheld confirmation is waited for before timing out.
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn set_faults(&self, faults: LedgerFaults) {
        *self.faults.lock() = faults;
    }

    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    pub fn set_withhold_confirmations(&self, withhold: bool) {
        self.faults.lock().withhold_confirmations = withhold;
    }

    /// Live feed of every confirmed ledger event.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events_tx.subscribe()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.faults.lock().offline {
            return Err(AnchorError::Connectivity("memory ledger is offline".into()));
        }
        Ok(())
    }

    fn check_authorized(&self, address: Address) -> Result<()> {
        match &self.faults.lock().authorized {
            Some(allowed) if !allowed.contains(&address) => Err(AnchorError::Authorization(
                format!("{address} may not write to this ledger"),
            )),
            _ => Ok(()),
        }
    }

    fn next_tx(&self, seed: &str) -> (String, u64) {
        let block = self.block.fetch_add(1, Ordering::SeqCst) + 1;
        let tx_id = format!(
            "0x{}",
            hash::fingerprint(format!("{seed}:{block}").as_bytes()).to_hex()
        );
        (tx_id, block)
    }

    fn publish(&self, event: LedgerEvent) {
        self.log.write().push(event.clone());
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    /// Report the write, or time out if confirmations are being withheld.
    async fn confirm(&self, tx_id: String, block: u64) -> Result<Confirmation> {
        let withhold = self.faults.lock().withhold_confirmations;
        if withhold {
            tokio::time::sleep(self.confirmation_timeout).await;
            return Err(AnchorError::ConfirmationTimeout { tx_hash: tx_id });
        }
        Ok(Confirmation {
            ledger: self.name().to_string(),
            tx_id,
            block_number: Some(block),
            gas_used: None,
        })
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn name(&self) -> &str {
        "memory"
    }

    async fn submit(
        &self,
        request: &CommitmentRequest,
        signer: &dyn Identity,
    ) -> Result<Confirmation> {
        self.check_reachable()?;
        let submitter = signer.address();
        self.check_authorized(submitter)?;

        let (tx_id, block) = {
            let mut records = self.records.write();
            if records.contains_key(&request.record_id) {
                return Err(AnchorError::DuplicateRecordId(request.record_id.clone()));
            }

            let (tx_id, block) = self.next_tx(request.record_id.as_str());
            let timestamp = Utc::now();
            let commitment = Commitment {
                record_id: request.record_id.clone(),
                locator: request.locator.clone(),
                fingerprint: request.fingerprint,
                submitter,
                timestamp,
            };
            records.insert(
                request.record_id.clone(),
                LedgerRecord {
                    commitment,
                    status: Status::Committed,
                    history: vec![StatusEvent {
                        record_id: request.record_id.clone(),
                        status: Status::Committed,
                        actor: submitter,
                        timestamp,
                    }],
                },
            );

            self.publish(LedgerEvent::CommitmentWritten {
                record_id: request.record_id.clone(),
                locator: request.locator.clone(),
                submitter,
                tx_id: tx_id.clone(),
                timestamp,
            });
            (tx_id, block)
        };

        info!(record_id = %request.record_id, tx_id = %tx_id, "Commitment written");
        self.confirm(tx_id, block).await
    }

    async fn update_status(
        &self,
        record_id: &RecordId,
        status: Status,
        signer: &dyn Identity,
    ) -> Result<Confirmation> {
        self.check_reachable()?;
        let actor = signer.address();
        self.check_authorized(actor)?;

        let (tx_id, block) = {
            let mut records = self.records.write();
            let record = records
                .get_mut(record_id)
                .ok_or_else(|| AnchorError::UnknownRecordId(record_id.clone()))?;

            if status.ledger_code().is_none() {
                return Err(AnchorError::InvalidTransition {
                    from: record.status,
                    to: status,
                });
            }
            self.policy.check(record.status, status)?;

            let (tx_id, block) = self.next_tx(&format!("{record_id}:{status}"));
            let timestamp = Utc::now();
            record.status = status;
            record.history.push(StatusEvent {
                record_id: record_id.clone(),
                status,
                actor,
                timestamp,
            });

            self.publish(LedgerEvent::StatusChanged {
                record_id: record_id.clone(),
                status,
                actor,
                tx_id: tx_id.clone(),
                timestamp,
            });
            (tx_id, block)
        };

        info!(record_id = %record_id, status = %status, tx_id = %tx_id, "Status updated");
        self.confirm(tx_id, block).await
    }

    async fn query(&self, record_id: &RecordId) -> Result<Option<LedgerRecord>> {
        self.check_reachable()?;
        Ok(self.records.read().get(record_id).cloned())
    }

    async fn events(&self, record_id: &RecordId) -> Result<Vec<LedgerEvent>> {
        self.check_reachable()?;
        Ok(self
            .log
            .read()
            .iter()
            .filter(|e| e.record_id() == record_id)
            .cloned()
            .collect())
    }
}
