//! The payment provider capability.
//!
//! Each active network is served by one [`PaymentProvider`]: local EVM,
//! external-facilitator EVM, or SVM. A provider is selected once per request
//! from the network descriptor and owns whatever state its path needs (chain
//! client, facilitator endpoint, fee-payer handle).
//!
//! The trait is dyn-compatible so the pipeline can hold heterogeneous
//! providers in one registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::RouteDescriptor;
use crate::error::{SettleError, VerifyError};
use crate::networks::ActiveNetwork;
use crate::proto::PaymentEnvelope;

/// Boxed future type used by dyn-compatible async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a provider needs to judge and settle one payment.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    /// The decoded client envelope.
    pub envelope: PaymentEnvelope,
    /// The route being paid for.
    pub route: Arc<RouteDescriptor>,
    /// The active network the envelope targets.
    pub network: ActiveNetwork,
    /// Required amount in the token's base units.
    pub required_amount: u128,
    /// Public URL of the protected resource.
    pub resource: String,
}

impl PaymentContext {
    /// Builds a context, deriving the required amount from the route price
    /// and the network's token decimals.
    #[must_use]
    pub fn new(
        envelope: PaymentEnvelope,
        route: Arc<RouteDescriptor>,
        network: ActiveNetwork,
        resource: String,
    ) -> Self {
        let required_amount = network.required_amount(route.price_atomic);
        Self {
            envelope,
            route,
            network,
            required_amount,
            resource,
        }
    }
}

/// A payment that passed verification.
#[derive(Debug, Clone)]
pub struct Verified {
    /// Payer identity recovered by the verifier. This is the only payer
    /// identity credit operations may use.
    pub payer: String,
}

/// A payment settled on-chain or through a facilitator.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// Settlement transaction hash or signature.
    pub tx_hash: String,
    /// Network the settlement landed on, in display form.
    pub network: String,
    /// Block number, when known locally.
    pub block_number: Option<u64>,
    /// Facilitator endpoint used, for delegated settlements.
    pub facilitator: Option<String>,
}

/// Verification and settlement for one payment family.
pub trait PaymentProvider: Send + Sync {
    /// Verifies a payment without persisting anything.
    ///
    /// Implementations may read replay state but must not write it; the
    /// pipeline owns nonce reservation.
    fn verify<'a>(
        &'a self,
        ctx: &'a PaymentContext,
    ) -> BoxFuture<'a, Result<Verified, VerifyError>>;

    /// Settles a verified payment and waits for it to land.
    fn settle<'a>(
        &'a self,
        ctx: &'a PaymentContext,
    ) -> BoxFuture<'a, Result<Settlement, SettleError>>;
}

impl<T: PaymentProvider> PaymentProvider for Arc<T> {
    fn verify<'a>(
        &'a self,
        ctx: &'a PaymentContext,
    ) -> BoxFuture<'a, Result<Verified, VerifyError>> {
        self.as_ref().verify(ctx)
    }

    fn settle<'a>(
        &'a self,
        ctx: &'a PaymentContext,
    ) -> BoxFuture<'a, Result<Settlement, SettleError>> {
        self.as_ref().settle(ctx)
    }
}
