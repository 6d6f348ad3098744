/// EVM commitment-contract ledger.
///
/// Talks raw JSON-RPC to an EVM node and drives the record registry
/// contract:
///
/// ```text
/// submitFIR(string id, string dataCID, bytes32 dataHash)
/// updateFIRStatus(string id, uint8 status)
/// getFIR(string id) → (dataCID, dataHash, status, timestamp, submitter)
/// event FIRSubmitted(string indexed id, string dataCID, address indexed submitter)
/// event FIRStatusUpdated(string indexed id, uint8 status)
/// ```
///
/// Every write goes through the same path: check the chain id, estimate
/// gas and add the configured margin, sign with the caller's identity,
/// broadcast, then poll for the receipt until enough blocks sit on top of
/// it or the confirmation timeout expires.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{keccak256, Address, Bytes, TxKind, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{CommitmentRequest, Confirmation, Ledger, LedgerEvent, LedgerRecord};
use crate::config::LedgerConfig;
use crate::crypto::identity::Identity;
use crate::error::{AnchorError, Result};
use crate::record::lifecycle::LifecyclePolicy;
use crate::record::{Commitment, ContentLocator, Fingerprint, RecordId, Status, StatusEvent};

sol! {
    interface IRecordRegistry {
        function submitFIR(string firId, string dataCID, bytes32 dataHash) external;
        function updateFIRStatus(string firId, uint8 status) external;
        function getFIR(string firId) external view returns (
            string dataCID,
            bytes32 dataHash,
            uint8 status,
            uint256 timestamp,
            address submitter
        );

        event FIRSubmitted(string indexed firId, string dataCID, address indexed submitter);
        event FIRStatusUpdated(string indexed firId, uint8 status);
    }
}

/// Add a percentage safety margin to a gas estimate.
pub fn with_margin(estimate: u64, margin_percent: u64) -> u64 {
    estimate.saturating_add(estimate.saturating_mul(margin_percent) / 100)
}

/// Contract revert reasons the client maps onto typed errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Revert {
    Duplicate,
    Unknown,
    Transition,
    Unauthorized,
    Other,
}

fn classify_revert(message: &str) -> Revert {
    let m = message.to_ascii_lowercase();
    if m.contains("already exists") || m.contains("already submitted") || m.contains("duplicate")
    {
        Revert::Duplicate
    } else if m.contains("not found") || m.contains("does not exist") || m.contains("unknown fir")
    {
        Revert::Unknown
    } else if m.contains("transition") {
        Revert::Transition
    } else if m.contains("unauthorized")
        || m.contains("not authorized")
        || m.contains("denied")
        || m.contains("permission")
    {
        Revert::Unauthorized
    } else {
        Revert::Other
    }
}

/// Parse a `0x`-prefixed hex quantity.
fn parse_quantity(value: &str) -> Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| AnchorError::Serialization(format!("invalid hex quantity {value:?}: {e}")))
}

fn timestamp_from_secs(secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .ok_or_else(|| AnchorError::Serialization(format!("timestamp {secs} out of range")))
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    block_number: Option<String>,
    status: Option<String>,
    gas_used: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    topics: Vec<B256>,
    data: Bytes,
    block_number: String,
    log_index: String,
    transaction_hash: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    from: Address,
}

/// JSON-RPC client for the record registry contract.
pub struct EvmLedger {
    client: Client,
    config: LedgerConfig,
    contract: Address,
    policy: LifecyclePolicy,
    name: String,
    request_id: AtomicU64,
    network_checked: AtomicBool,
}

impl EvmLedger {
    pub fn new(config: LedgerConfig, policy: LifecyclePolicy) -> Result<Self> {
        let contract = config.contract_address()?;
        let name = format!("evm:{}", config.chain_id);
        Ok(Self {
            client: Client::new(),
            config,
            contract,
            policy,
            name,
            request_id: AtomicU64::new(1),
            network_checked: AtomicBool::new(false),
        })
    }

    /// Send a JSON-RPC request. `Ok(None)` when the node answers `null`.
    async fn rpc_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        });

        let resp = self
            .client
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnchorError::Connectivity(format!("{method}: {e}")))?;

        if !resp.status().is_success() {
            return Err(AnchorError::Connectivity(format!(
                "{method}: HTTP {}",
                resp.status()
            )));
        }

        let resp: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| AnchorError::Serialization(format!("RPC response parse error: {e}")))?;

        if let Some(err) = resp.error {
            let detail = match err.data {
                Some(data) => format!("{} ({data})", err.message),
                None => err.message,
            };
            return Err(AnchorError::LedgerRejected(detail));
        }

        Ok(resp.result.filter(|v| !v.is_null()))
    }

    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let value = self.rpc_request(method, params).await?.ok_or_else(|| {
            AnchorError::Serialization(format!("empty RPC response for {method}"))
        })?;
        serde_json::from_value(value)
            .map_err(|e| AnchorError::Serialization(format!("{method} result: {e}")))
    }

    async fn rpc_call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        match self.rpc_request(method, params).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| AnchorError::Serialization(format!("{method} result: {e}"))),
            None => Ok(None),
        }
    }

    /// Fail with `WrongNetwork` unless the node serves the configured chain.
    pub async fn ensure_network(&self) -> Result<()> {
        if self.network_checked.load(Ordering::Acquire) {
            return Ok(());
        }

        let chain_hex: String = self.rpc_call("eth_chainId", serde_json::json!([])).await?;
        let actual = parse_quantity(&chain_hex)?;
        if actual != self.config.chain_id {
            return Err(AnchorError::WrongNetwork {
                expected: self.config.chain_id,
                actual,
            });
        }

        self.network_checked.store(true, Ordering::Release);
        Ok(())
    }

    async fn call_view(&self, data: Vec<u8>) -> Result<Bytes> {
        let raw: Bytes = self
            .rpc_call(
                "eth_call",
                serde_json::json!([
                    {"to": self.contract, "data": Bytes::from(data)},
                    "latest"
                ]),
            )
            .await?;
        Ok(raw)
    }

    /// Estimate the gas for a call and apply the configured margin.
    async fn estimate_gas(&self, from: Address, data: &Bytes) -> Result<u64> {
        let estimate_hex: String = self
            .rpc_call(
                "eth_estimateGas",
                serde_json::json!([{"from": from, "to": self.contract, "data": data}]),
            )
            .await?;
        let estimate = parse_quantity(&estimate_hex)?;
        let gas_limit = with_margin(estimate, self.config.gas_margin_percent);
        debug!(estimate, gas_limit, "Gas estimated");
        Ok(gas_limit)
    }

    /// Build, sign and broadcast a contract call. Returns the tx hash.
    async fn send_transaction(&self, data: Bytes, signer: &dyn Identity) -> Result<String> {
        let from = signer.address();
        let gas_limit = self.estimate_gas(from, &data).await?;

        let nonce_hex: String = self
            .rpc_call(
                "eth_getTransactionCount",
                serde_json::json!([from, "pending"]),
            )
            .await?;
        let nonce = parse_quantity(&nonce_hex)?;

        let gas_price_hex: String = self.rpc_call("eth_gasPrice", serde_json::json!([])).await?;
        let gas_price = u128::from_str_radix(gas_price_hex.trim_start_matches("0x"), 16)
            .map_err(|e| AnchorError::Serialization(format!("invalid gas price: {e}")))?;

        let tx = TxLegacy {
            chain_id: Some(self.config.chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(self.contract),
            value: U256::ZERO,
            input: data,
        };

        let signature = signer.sign_hash(&tx.signature_hash()).await?;
        let signed = TxEnvelope::Legacy(tx.into_signed(signature));

        let mut raw_tx = Vec::new();
        signed.encode_2718(&mut raw_tx);
        let raw_hex = format!("0x{}", hex::encode(&raw_tx));

        let tx_hash: String = self
            .rpc_call("eth_sendRawTransaction", serde_json::json!([raw_hex]))
            .await?;
        info!(tx_hash = %tx_hash, nonce, gas_limit, "Transaction broadcast");
        Ok(tx_hash)
    }

    /// Wait until `tx_hash` has the configured number of confirmations.
    ///
    /// Transient RPC failures while polling are retried; only the overall
    /// deadline ends the wait, with `ConfirmationTimeout`.
    async fn wait_for_confirmation(&self, tx_hash: &str) -> Result<Confirmation> {
        let deadline = self.config.confirmation_timeout;
        match tokio::time::timeout(deadline, self.poll_confirmation(tx_hash)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tx_hash = %tx_hash, timeout = ?deadline, "Confirmation not observed in time");
                Err(AnchorError::ConfirmationTimeout {
                    tx_hash: tx_hash.to_string(),
                })
            }
        }
    }

    async fn poll_confirmation(&self, tx_hash: &str) -> Result<Confirmation> {
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            interval.tick().await;

            let receipt: Option<RpcReceipt> = match self
                .rpc_call_optional("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
                .await
            {
                Ok(receipt) => receipt,
                Err(AnchorError::Connectivity(e)) => {
                    debug!(tx_hash = %tx_hash, error = %e, "Receipt poll failed, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(receipt) = receipt else {
                debug!(tx_hash = %tx_hash, "Transaction pending");
                continue;
            };
            let Some(block_hex) = receipt.block_number.as_deref() else {
                continue;
            };
            let tx_block = parse_quantity(block_hex)?;

            if receipt.status.as_deref() == Some("0x0") {
                return Err(AnchorError::LedgerRejected(format!(
                    "transaction {tx_hash} reverted in block {tx_block}"
                )));
            }

            let head_hex: String = match self
                .rpc_call("eth_blockNumber", serde_json::json!([]))
                .await
            {
                Ok(head) => head,
                Err(AnchorError::Connectivity(_)) => continue,
                Err(e) => return Err(e),
            };
            let confirmations = parse_quantity(&head_hex)?.saturating_sub(tx_block) + 1;

            debug!(
                tx_hash = %tx_hash,
                confirmations,
                required = self.config.confirmations,
                "Transaction included"
            );

            if confirmations >= self.config.confirmations {
                let gas_used = receipt.gas_used.as_deref().map(parse_quantity).transpose()?;
                info!(tx_hash = %tx_hash, block = tx_block, "Transaction confirmed");
                return Ok(Confirmation {
                    ledger: self.name.clone(),
                    tx_id: tx_hash.to_string(),
                    block_number: Some(tx_block),
                    gas_used,
                });
            }
        }
    }

    /// Network check → estimate → sign → broadcast → confirm.
    async fn transact(&self, data: Vec<u8>, signer: &dyn Identity) -> Result<Confirmation> {
        self.ensure_network().await?;
        let tx_hash = self.send_transaction(Bytes::from(data), signer).await?;
        self.wait_for_confirmation(&tx_hash).await
    }

    async fn logs(&self, topic0: B256, record_id: &RecordId) -> Result<Vec<RpcLog>> {
        let id_topic = keccak256(record_id.as_str().as_bytes());
        self.rpc_call(
            "eth_getLogs",
            serde_json::json!([{
                "address": self.contract,
                "fromBlock": format!("0x{:x}", self.config.from_block),
                "toBlock": "latest",
                "topics": [topic0, id_topic],
            }]),
        )
        .await
    }

    async fn block_timestamp(
        &self,
        block_hex: &str,
        cache: &mut HashMap<String, DateTime<Utc>>,
    ) -> Result<DateTime<Utc>> {
        if let Some(ts) = cache.get(block_hex) {
            return Ok(*ts);
        }
        let block: RpcBlock = self
            .rpc_call(
                "eth_getBlockByNumber",
                serde_json::json!([block_hex, false]),
            )
            .await?;
        let ts = timestamp_from_secs(parse_quantity(&block.timestamp)?)?;
        cache.insert(block_hex.to_string(), ts);
        Ok(ts)
    }

    async fn tx_sender(&self, tx_hash: &str) -> Result<Address> {
        let tx: RpcTransaction = self
            .rpc_call("eth_getTransactionByHash", serde_json::json!([tx_hash]))
            .await?;
        Ok(tx.from)
    }

    /// Map a contract revert onto the typed protocol errors.
    fn map_revert(&self, err: AnchorError, record_id: &RecordId, from: Status, to: Status) -> AnchorError {
        match err {
            AnchorError::LedgerRejected(msg) => match classify_revert(&msg) {
                Revert::Duplicate => AnchorError::DuplicateRecordId(record_id.clone()),
                Revert::Unknown => AnchorError::UnknownRecordId(record_id.clone()),
                Revert::Transition => AnchorError::InvalidTransition { from, to },
                Revert::Unauthorized => AnchorError::Authorization(msg),
                Revert::Other => AnchorError::LedgerRejected(msg),
            },
            other => other,
        }
    }

    async fn fetch(&self, record_id: &RecordId) -> Result<Option<(Commitment, Status)>> {
        let call = IRecordRegistry::getFIRCall {
            firId: record_id.to_string(),
        };
        let raw = match self.call_view(call.abi_encode()).await {
            Ok(raw) => raw,
            Err(AnchorError::LedgerRejected(msg)) if classify_revert(&msg) == Revert::Unknown => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let ret = IRecordRegistry::getFIRCall::abi_decode_returns(&raw, true)
            .map_err(|e| AnchorError::Serialization(format!("getFIR decode: {e}")))?;

        let secs = u64::try_from(ret.timestamp)
            .map_err(|_| AnchorError::Serialization("getFIR timestamp overflow".into()))?;
        if secs == 0 {
            // Unset mapping slot: never committed.
            return Ok(None);
        }

        let commitment = Commitment {
            record_id: record_id.clone(),
            locator: ContentLocator::new(ret.dataCID),
            fingerprint: Fingerprint::from_bytes(ret.dataHash.0),
            submitter: ret.submitter,
            timestamp: timestamp_from_secs(secs)?,
        };
        Ok(Some((commitment, Status::from_ledger_code(ret.status)?)))
    }
}

#[async_trait]
impl Ledger for EvmLedger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        request: &CommitmentRequest,
        signer: &dyn Identity,
    ) -> Result<Confirmation> {
        if self.fetch(&request.record_id).await?.is_some() {
            return Err(AnchorError::DuplicateRecordId(request.record_id.clone()));
        }

        let call = IRecordRegistry::submitFIRCall {
            firId: request.record_id.to_string(),
            dataCID: request.locator.to_string(),
            dataHash: B256::from(*request.fingerprint.as_bytes()),
        };

        self.transact(call.abi_encode(), signer)
            .await
            .map_err(|e| self.map_revert(e, &request.record_id, Status::Stored, Status::Committed))
    }

    async fn update_status(
        &self,
        record_id: &RecordId,
        status: Status,
        signer: &dyn Identity,
    ) -> Result<Confirmation> {
        let (_, current) = self
            .fetch(record_id)
            .await?
            .ok_or_else(|| AnchorError::UnknownRecordId(record_id.clone()))?;

        let code = status.ledger_code().ok_or(AnchorError::InvalidTransition {
            from: current,
            to: status,
        })?;
        self.policy.check(current, status)?;

        let call = IRecordRegistry::updateFIRStatusCall {
            firId: record_id.to_string(),
            status: code,
        };

        self.transact(call.abi_encode(), signer)
            .await
            .map_err(|e| self.map_revert(e, record_id, current, status))
    }

    async fn query(&self, record_id: &RecordId) -> Result<Option<LedgerRecord>> {
        let Some((commitment, status)) = self.fetch(record_id).await? else {
            return Ok(None);
        };

        let mut history: Vec<StatusEvent> = self
            .events(record_id)
            .await?
            .iter()
            .map(LedgerEvent::as_status_event)
            .collect();

        // Log scans can miss history older than `from_block`.
        if history.first().map(|e| e.status) != Some(Status::Committed) {
            history.insert(
                0,
                StatusEvent {
                    record_id: record_id.clone(),
                    status: Status::Committed,
                    actor: commitment.submitter,
                    timestamp: commitment.timestamp,
                },
            );
        }

        Ok(Some(LedgerRecord {
            commitment,
            status,
            history,
        }))
    }

    async fn events(&self, record_id: &RecordId) -> Result<Vec<LedgerEvent>> {
        let mut block_times = HashMap::new();
        let mut ordered: Vec<((u64, u64), LedgerEvent)> = Vec::new();

        for log in self
            .logs(IRecordRegistry::FIRSubmitted::SIGNATURE_HASH, record_id)
            .await?
        {
            let event = IRecordRegistry::FIRSubmitted::decode_raw_log(
                log.topics.iter().copied(),
                &log.data,
                true,
            )
            .map_err(|e| AnchorError::Serialization(format!("FIRSubmitted decode: {e}")))?;
            let timestamp = self.block_timestamp(&log.block_number, &mut block_times).await?;
            ordered.push((
                (parse_quantity(&log.block_number)?, parse_quantity(&log.log_index)?),
                LedgerEvent::CommitmentWritten {
                    record_id: record_id.clone(),
                    locator: ContentLocator::new(event.dataCID),
                    submitter: event.submitter,
                    tx_id: log.transaction_hash,
                    timestamp,
                },
            ));
        }

        for log in self
            .logs(IRecordRegistry::FIRStatusUpdated::SIGNATURE_HASH, record_id)
            .await?
        {
            let event = IRecordRegistry::FIRStatusUpdated::decode_raw_log(
                log.topics.iter().copied(),
                &log.data,
                true,
            )
            .map_err(|e| AnchorError::Serialization(format!("FIRStatusUpdated decode: {e}")))?;
            let timestamp = self.block_timestamp(&log.block_number, &mut block_times).await?;
            let actor = self.tx_sender(&log.transaction_hash).await?;
            ordered.push((
                (parse_quantity(&log.block_number)?, parse_quantity(&log.log_index)?),
                LedgerEvent::StatusChanged {
                    record_id: record_id.clone(),
                    status: Status::from_ledger_code(event.status)?,
                    actor,
                    tx_id: log.transaction_hash,
                    timestamp,
                },
            ));
        }

        ordered.sort_by_key(|(position, _)| *position);
        Ok(ordered.into_iter().map(|(_, event)| event).collect())
    }
}
