/// Submitting identity and transaction signing.
///
/// The ledger client needs an address to attribute commitments and status
/// events to, and a way to sign transaction hashes. Both come from an
/// externally supplied `Identity`; the anchoring core never generates,
/// stores or logs key material itself.
use std::fmt;

use alloy::primitives::{eip191_hash_message, Address, Signature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use async_trait::async_trait;

use crate::error::{AnchorError, Result};

/// Identity/signing provider (wallet, KMS, hardware signer...).
#[async_trait]
pub trait Identity: Send + Sync {
    /// Address that ledger writes are attributed to.
    fn address(&self) -> Address;

    /// Sign a 32-byte prehash (e.g. a transaction signature hash).
    async fn sign_hash(&self, hash: &B256) -> Result<Signature>;

    /// Sign an arbitrary payload using EIP-191 personal-message hashing.
    async fn sign(&self, payload: &[u8]) -> Result<Signature> {
        self.sign_hash(&eip191_hash_message(payload)).await
    }
}

/// Identity backed by an in-process secp256k1 key handed over by the caller.
pub struct LocalIdentity {
    signer: PrivateKeySigner,
}

impl LocalIdentity {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    /// Parse a hex-encoded private key (with or without `0x`).
    pub fn from_hex(private_key_hex: &str) -> Result<Self> {
        let signer: PrivateKeySigner = private_key_hex
            .trim()
            .parse()
            .map_err(|e| AnchorError::Authorization(format!("invalid private key: {e}")))?;
        Ok(Self { signer })
    }

    /// Fresh throwaway identity, for simulation runs and tests.
    pub fn random() -> Self {
        Self {
            signer: PrivateKeySigner::random(),
        }
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("address", &self.signer.address())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Identity for LocalIdentity {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature> {
        self.signer
            .sign_hash(hash)
            .await
            .map_err(|e| AnchorError::Authorization(format!("signing failed: {e}")))
    }
}
