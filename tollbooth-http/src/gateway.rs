//! Shared per-process gateway state.
//!
//! One [`Gateway`] is built at startup from the loaded configuration and
//! handed (as an `Arc`) to every protected route's
//! [`PaymentGate`](crate::layer::PaymentGate). It owns the active-network
//! registry, one payment provider per network, and the three stateful
//! policies over the key-value store.

use std::collections::HashMap;
use std::sync::Arc;

use tollbooth::ChainId;
use tollbooth::networks::NetworkRegistry;
use tollbooth::provider::PaymentProvider;
use tollbooth::store::{CreditLedger, IdempotencyCache, Kv, NonceLedger};

/// Everything the request pipeline needs, wired once at startup.
pub struct Gateway {
    /// The active-network view.
    pub registry: NetworkRegistry,
    /// Replay protection.
    pub nonces: NonceLedger,
    /// Idempotent-retry cache.
    pub idempotency: IdempotencyCache,
    /// Credit counters.
    pub credits: CreditLedger,
    /// Master switch for the credit subsystem.
    pub credit_enabled: bool,
    providers: HashMap<ChainId, Arc<dyn PaymentProvider>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("networks", &self.registry.len())
            .field("providers", &self.providers.len())
            .field("credit_enabled", &self.credit_enabled)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Creates gateway state over the given store. Providers are registered
    /// separately, one per active network, by the bootstrap code that knows
    /// which chain crates are in play.
    #[must_use]
    pub fn new(registry: NetworkRegistry, kv: Arc<dyn Kv>, credit_enabled: bool) -> Self {
        Self {
            registry,
            nonces: NonceLedger::new(Arc::clone(&kv)),
            idempotency: IdempotencyCache::new(Arc::clone(&kv)),
            credits: CreditLedger::new(kv),
            credit_enabled,
            providers: HashMap::new(),
        }
    }

    /// Registers the payment provider serving one network.
    pub fn register(&mut self, chain: ChainId, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(chain, provider);
    }

    /// Looks up the provider for a network.
    #[must_use]
    pub fn provider(&self, chain: &ChainId) -> Option<&Arc<dyn PaymentProvider>> {
        self.providers.get(chain)
    }
}
