//! Nonce lifecycle: the replay-protection gate in front of settlement.
//!
//! A nonce record moves through `pending` (reserved, settlement in flight)
//! to `confirmed` (settled, long-lived tombstone) or is deleted when
//! settlement fails so the client can retry.
//!
//! Failure policy: reads fail *open* (the chain rejects an actual replay on
//! settlement), reservation fails *closed* (without exclusivity we must not
//! settle), confirmation failures are logged but not fatal because on-chain
//! state is canonical.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chain::{ChainId, VmFamily};
use crate::proto::{PaymentEnvelope, PaymentPayload, SettlementReceipt};
use crate::store::kv::{Kv, KvError};
use crate::timestamp::UnixTimestamp;

/// TTL for a reserved-but-unsettled nonce.
pub const PENDING_TTL: Duration = Duration::from_secs(3600);

/// TTL for a confirmed nonce tombstone: seven days.
pub const CONFIRMED_TTL: Duration = Duration::from_secs(604_800);

const NONCE_PREFIX: &str = "x402:nonce:";

/// Lifecycle state of a nonce record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonceStatus {
    /// Reserved; a settlement attempt is in flight.
    Pending,
    /// Settled on-chain; any reuse is a replay.
    Confirmed,
}

impl std::fmt::Display for NonceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// The value stored under a nonce key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    /// Lifecycle state.
    pub status: NonceStatus,
    /// When the record was written, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Network the payment targets.
    pub network: ChainId,
    /// Payer identity.
    pub payer: String,
    /// Route the payment was made for.
    pub route: String,
    /// Virtual machine family of the payment.
    pub vm: VmFamily,
    /// Settlement data, present once confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement: Option<SettlementReceipt>,
}

impl NonceRecord {
    /// Builds a pending record for a reservation.
    #[must_use]
    pub fn pending(network: ChainId, payer: &str, route: &str, vm: VmFamily) -> Self {
        Self {
            status: NonceStatus::Pending,
            timestamp: UnixTimestamp::now().as_secs(),
            network,
            payer: payer.to_owned(),
            route: route.to_owned(),
            vm,
            settlement: None,
        }
    }

    /// Turns a record into its confirmed form, attaching settlement data.
    #[must_use]
    pub fn confirmed(mut self, settlement: SettlementReceipt) -> Self {
        self.status = NonceStatus::Confirmed;
        self.timestamp = UnixTimestamp::now().as_secs();
        self.settlement = Some(settlement);
        self
    }
}

/// Derives the store key for an envelope's nonce.
///
/// EVM payments use the authorization nonce directly. SVM payments hash the
/// transaction blob so resubmitting an identical partial signature maps to
/// the same key.
#[must_use]
pub fn nonce_key(envelope: &PaymentEnvelope) -> Option<String> {
    match &envelope.payload {
        PaymentPayload::Evm(evm) => {
            let nonce = evm.authorization.nonce.trim();
            (!nonce.is_empty()).then(|| nonce.to_ascii_lowercase())
        }
        PaymentPayload::Svm(svm) => {
            let digest = Sha256::digest(svm.transaction.as_bytes());
            Some(format!("svm:{}", hex::encode(digest)))
        }
    }
}

/// The nonce lifecycle over the key-value contract.
#[derive(Clone)]
pub struct NonceLedger {
    kv: Arc<dyn Kv>,
}

impl std::fmt::Debug for NonceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLedger").finish_non_exhaustive()
    }
}

impl NonceLedger {
    /// Creates a ledger over the given store.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn key(nonce_key: &str) -> String {
        format!("{NONCE_PREFIX}{nonce_key}")
    }

    /// Reads the status of a nonce, failing open: a store failure reads as
    /// "unseen" and is left for on-chain checks to catch.
    pub async fn status(&self, nonce_key: &str) -> Option<NonceStatus> {
        match self.kv.get(&Self::key(nonce_key)).await {
            Ok(Some(raw)) => match serde_json::from_str::<NonceRecord>(&raw) {
                Ok(record) => Some(record.status),
                Err(err) => {
                    tracing::warn!(nonce = nonce_key, %err, "unparseable nonce record");
                    // An unreadable record still proves the nonce was seen.
                    Some(NonceStatus::Pending)
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(nonce = nonce_key, %err, "nonce read failed, continuing");
                None
            }
        }
    }

    /// Reserves a nonce for settlement. Returns true iff the caller
    /// acquired exclusivity; a store failure fails closed.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] when the store is unreachable; callers must
    /// reject the payment in that case.
    pub async fn reserve(&self, nonce_key: &str, record: &NonceRecord) -> Result<bool, KvError> {
        let value = serde_json::to_string(record).expect("nonce record serializes");
        self.kv
            .set_if_absent(&Self::key(nonce_key), &value, PENDING_TTL)
            .await
    }

    /// Rewrites a nonce as confirmed with the long tombstone TTL. Store
    /// failures are logged only; the chain already holds the truth.
    pub async fn confirm(&self, nonce_key: &str, record: &NonceRecord) {
        let value = serde_json::to_string(record).expect("nonce record serializes");
        if let Err(err) = self.kv.set(&Self::key(nonce_key), &value, CONFIRMED_TTL).await {
            tracing::warn!(nonce = nonce_key, %err, "nonce confirmation write failed");
        }
    }

    /// Deletes a reservation after a failed settlement so the client can
    /// retry with the same authorization.
    pub async fn release(&self, nonce_key: &str) {
        if let Err(err) = self.kv.del(&Self::key(nonce_key)).await {
            tracing::warn!(nonce = nonce_key, %err, "nonce release failed");
        }
    }
}
