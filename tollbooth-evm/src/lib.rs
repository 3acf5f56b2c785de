//! EVM payment providers for the tollbooth gateway.
//!
//! Two [`PaymentProvider`](tollbooth::provider::PaymentProvider)
//! implementations live here:
//!
//! - [`LocalEvmProvider`](exact::LocalEvmProvider) verifies EIP-712 signed
//!   ERC-3009 authorizations and settles them itself by submitting
//!   `transferWithAuthorization` over the configured RPC endpoint.
//! - [`ExternalEvmProvider`](facilitator::ExternalEvmProvider) delegates
//!   both halves to a remote facilitator for networks the gateway does not
//!   settle locally.

pub mod chain;
pub mod contract;
pub mod exact;
pub mod facilitator;

pub use chain::{EvmChainClient, EvmChainError};
pub use exact::LocalEvmProvider;
pub use facilitator::ExternalEvmProvider;
