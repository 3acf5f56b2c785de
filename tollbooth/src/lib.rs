//! Core of the tollbooth x402 payment gateway.
//!
//! Tollbooth sits in front of a backend API and demands a cryptographically
//! signed stablecoin transfer authorization for each protected request. This
//! crate holds everything that is independent of a particular chain family:
//!
//! - [`proto`] — wire format types (payment envelopes, 402 bodies, receipts)
//! - [`chain`] — CAIP-2 chain identifiers and virtual machine families
//! - [`networks`] — the static table of supported chains and amount scaling
//! - [`config`] — gateway configuration loaded once at startup
//! - [`challenge`] — the 402 Payment Required challenge builder
//! - [`provider`] — the [`PaymentProvider`](provider::PaymentProvider)
//!   capability implemented per chain family in `tollbooth-evm` / `tollbooth-svm`
//! - [`facilitator`] — HTTP client for external verify/settle facilitators
//! - [`store`] — replay protection, idempotency, and credit state over a
//!   remote key-value service
//! - [`error`] — domain error types

pub mod chain;
pub mod challenge;
pub mod config;
pub mod encoding;
pub mod error;
pub mod facilitator;
pub mod networks;
pub mod proto;
pub mod provider;
pub mod store;
pub mod timestamp;

pub use chain::{ChainId, VmFamily};
pub use timestamp::UnixTimestamp;
