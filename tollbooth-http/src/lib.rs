//! HTTP pipeline for the tollbooth x402 payment gateway.
//!
//! This crate turns the chain-agnostic core into request middleware:
//!
//! - [`headers`] — payment header names plus envelope/receipt codecs
//! - [`gateway`] — the shared per-process state (registry, providers,
//!   stores) handed to every protected route
//! - [`pipeline`] — the per-request admission state machine
//! - [`layer`] — a tower [`Layer`](tower::Layer) enforcing payment on a
//!   protected route, usable from axum or any tower-compatible framework
//!
//! The embedding application owns the HTTP server and the backend proxy;
//! this crate decides, per request, whether to challenge, reject, or
//! proceed, and which receipt headers to attach.

pub mod gateway;
pub mod headers;
pub mod layer;
pub mod pipeline;

pub use gateway::Gateway;
pub use layer::PaymentGate;
pub use pipeline::{Admission, Grant, Receipt, admit};
