//! Idempotent retry support keyed by client payment identifiers.
//!
//! A record is written only after successful settlement. On a hit the
//! pipeline re-emits the cached receipt header verbatim and proceeds to the
//! backend without settling again.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proto::SettlementReceipt;
use crate::store::kv::Kv;
use crate::timestamp::UnixTimestamp;

const IDEMPOTENCY_PREFIX: &str = "x402:idempotency:";

/// TTL of an idempotency record.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(3600);

/// Cached outcome of a settled payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// When the settlement completed, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Route the payment was made for. Replays targeting another route do
    /// not match the cache.
    pub route: String,
    /// The exact receipt header emitted for the settlement.
    pub receipt_header: String,
    /// Settlement summary backing the receipt.
    pub settlement: SettlementReceipt,
}

impl IdempotencyRecord {
    /// Builds a record for a settlement that just completed.
    #[must_use]
    pub fn new(route: &str, receipt_header: &str, settlement: SettlementReceipt) -> Self {
        Self {
            timestamp: UnixTimestamp::now().as_secs(),
            route: route.to_owned(),
            receipt_header: receipt_header.to_owned(),
            settlement,
        }
    }
}

/// The idempotency cache over the key-value contract.
#[derive(Clone)]
pub struct IdempotencyCache {
    kv: Arc<dyn Kv>,
}

impl std::fmt::Debug for IdempotencyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyCache").finish_non_exhaustive()
    }
}

impl IdempotencyCache {
    /// Creates a cache over the given store.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn key(payment_id: &str) -> String {
        format!("{IDEMPOTENCY_PREFIX}{payment_id}")
    }

    /// Looks up a prior settlement. Store failures read as a miss.
    pub async fn get(&self, payment_id: &str) -> Option<IdempotencyRecord> {
        match self.kv.get(&Self::key(payment_id)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .map_err(|err| {
                    tracing::warn!(payment_id, %err, "unparseable idempotency record");
                })
                .ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(payment_id, %err, "idempotency read failed, continuing");
                None
            }
        }
    }

    /// Caches a settled payment. Write failures are logged only; losing the
    /// cache costs a duplicate-settlement attempt that the nonce tombstone
    /// then rejects.
    pub async fn put(&self, payment_id: &str, record: &IdempotencyRecord) {
        let value = serde_json::to_string(record).expect("idempotency record serializes");
        if let Err(err) = self
            .kv
            .set(&Self::key(payment_id), &value, IDEMPOTENCY_TTL)
            .await
        {
            tracing::warn!(payment_id, %err, "idempotency write failed");
        }
    }
}
