//! Per-(payer, route) credit counters.
//!
//! Credits compensate payers for backend failures without on-chain refunds:
//! a payer whose paid request hit a failing backend earns the right to one
//! later request with no new settlement.
//!
//! Both operations are server-side atomic, so concurrent consumption and
//! issuance can interleave freely without the counter leaving `[0, cap]`.
//! The payer string must come from the verifier, never from request
//! metadata.

use std::sync::Arc;
use std::time::Duration;

use crate::config::CreditPolicy;
use crate::store::kv::{Kv, KvError};

const CREDIT_PREFIX: &str = "x402:credit:";

/// Credit counters over the key-value contract.
#[derive(Clone)]
pub struct CreditLedger {
    kv: Arc<dyn Kv>,
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger").finish_non_exhaustive()
    }
}

impl CreditLedger {
    /// Creates a ledger over the given store.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn key(payer: &str, route: &str) -> String {
        format!("{CREDIT_PREFIX}{}:{route}", payer.to_lowercase())
    }

    /// Consumes one credit if any is outstanding. A store failure reads as
    /// "no credit" so the request falls through to on-chain settlement.
    pub async fn consume(&self, payer: &str, route: &str) -> bool {
        match self.kv.decr_if_positive(&Self::key(payer, route)).await {
            Ok(consumed) => consumed,
            Err(err) => {
                tracing::warn!(payer, route, %err, "credit consume failed, settling instead");
                false
            }
        }
    }

    /// Issues one credit up to the policy cap, refreshing the TTL either
    /// way. Returns the resulting count.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] when the store is unreachable; issuance is
    /// best-effort and callers only log the failure.
    pub async fn issue(
        &self,
        payer: &str,
        route: &str,
        policy: &CreditPolicy,
    ) -> Result<i64, KvError> {
        self.kv
            .incr_capped(
                &Self::key(payer, route),
                i64::from(policy.max_credits_per_payer),
                Duration::from_secs(policy.credit_ttl_secs),
            )
            .await
    }

    /// Reads the current counter without modifying it. Used by tests and
    /// diagnostics.
    pub async fn balance(&self, payer: &str, route: &str) -> Result<i64, KvError> {
        Ok(self
            .kv
            .get(&Self::key(payer, route))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }
}
