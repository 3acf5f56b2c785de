//! Settlement state over a remote key-value service.
//!
//! All stateful policies (replay protection, idempotency, credits) are
//! layered over the narrow [`Kv`] contract so they can run against Redis in
//! production and the in-memory adapter in tests and single-node setups.

pub mod credit;
pub mod idempotency;
pub mod kv;
pub mod nonce;

pub use credit::CreditLedger;
pub use idempotency::{IdempotencyCache, IdempotencyRecord};
pub use kv::{Kv, KvError, MemoryKv, RedisKv};
pub use nonce::{NonceLedger, NonceRecord, NonceStatus};
