//! SVM payment provider for the tollbooth gateway.
//!
//! SVM payments arrive as a partially signed transaction: the payer authors
//! and signs an SPL Token `TransferChecked` to the route's recipient, with
//! the fee-payer signature slot left empty. The gateway verifies the
//! transaction structure, co-signs with its fee-payer key, and submits.
//!
//! [`SvmProvider`](exact::SvmProvider) implements the
//! [`PaymentProvider`](tollbooth::provider::PaymentProvider) capability for
//! Solana-like networks.

pub mod chain;
pub mod exact;

pub use chain::{SvmChainClient, SvmChainError, fee_payer_pubkey};
pub use exact::SvmProvider;
