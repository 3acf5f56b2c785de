//! The per-request admission state machine.
//!
//! For one paid request the pipeline runs, in order: header decode,
//! idempotency lookup, provider verification, credit consumption, nonce
//! reservation, settlement, nonce confirmation, receipt emission. Each step
//! either advances or terminates with a 402 (challenge re-emitted, reason
//! attached) or a 400 (malformed envelope).
//!
//! Ordering rules:
//!
//! - The idempotency lookup runs before verification so cached receipts are
//!   served cheaply, but a hit is honored only when the envelope decodes
//!   and targets the same route; the cache is written only after settlement.
//! - Credit consumption runs after verification and before nonce
//!   reservation; a consumed credit skips reservation and settlement.
//! - Settlement runs on a spawned task so a client disconnect cannot cancel
//!   it between submission and confirmation; the nonce is confirmed and the
//!   idempotency record written even if nobody is waiting for the response.
//!
//! Payer identity always comes from the verifier result, never from request
//! metadata.

use std::sync::Arc;

use tollbooth::challenge::{Challenge, ChallengeBuilder};
use tollbooth::config::RouteDescriptor;
use tollbooth::error::SettleError;
use tollbooth::proto::SettlementReceipt;
use tollbooth::provider::{PaymentContext, PaymentProvider, Settlement};
use tollbooth::store::nonce::{NonceRecord, nonce_key};
use tollbooth::store::{IdempotencyRecord, NonceLedger};

use crate::gateway::Gateway;
use crate::headers;

/// Reason attached to a 402 when the nonce gate loses.
pub const NONCE_UNAVAILABLE_REASON: &str = "nonce already used or settlement in progress";

/// How a request may proceed past the payment gate.
#[derive(Debug, Clone)]
pub enum Receipt {
    /// Settlement happened in this request; carry its receipt header.
    Settled {
        /// Base64 receipt for the `PAYMENT-RESPONSE` header.
        header: String,
    },
    /// A credit covered the request; carry the credit sentinel header.
    Credit,
    /// An idempotent replay; re-emit the original receipt verbatim.
    Cached {
        /// Base64 receipt for the `PAYMENT-RESPONSE` header.
        header: String,
    },
}

/// A granted admission.
#[derive(Debug, Clone)]
pub struct Grant {
    /// The receipt to attach to the response.
    pub receipt: Receipt,
    /// Verifier-derived payer identity, absent on cached replays.
    pub payer: Option<String>,
}

impl Grant {
    /// Whether an on-chain settlement happened in this request, which is
    /// the precondition for credit issuance.
    #[must_use]
    pub const fn settled_now(&self) -> bool {
        matches!(self.receipt, Receipt::Settled { .. })
    }
}

/// Outcome of the admission pipeline.
#[derive(Debug)]
pub enum Admission {
    /// Terminal 400: the envelope was not decodable.
    Malformed {
        /// Human-readable description of the defect.
        message: String,
    },
    /// Terminal 402: challenge the client, optionally with the reason a
    /// submitted payment was rejected.
    Challenge(Box<Challenge>),
    /// Proceed downstream.
    Proceed(Grant),
}

/// Runs the admission pipeline for one request.
pub async fn admit(
    gateway: &Gateway,
    route: &Arc<RouteDescriptor>,
    resource: &str,
    payment_header: Option<&str>,
) -> Admission {
    let builder = ChallengeBuilder::new(&gateway.registry);
    let challenge =
        |reason: Option<String>| Admission::Challenge(Box::new(builder.build_rejection(route, resource, reason)));

    let Some(raw) = payment_header else {
        return challenge(None);
    };
    let envelope = match headers::decode_envelope(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            return Admission::Malformed {
                message: format!("invalid payment envelope: {err}"),
            };
        }
    };

    // Served-before lookup: cheap, read-only, and only trusted when the
    // replay targets the same route.
    let payment_id = envelope.payment_id().map(str::to_owned);
    if let Some(id) = &payment_id
        && let Some(record) = gateway.idempotency.get(id).await
    {
        if record.route == route.route_key {
            tracing::debug!(payment_id = %id, "idempotent replay, re-emitting receipt");
            return Admission::Proceed(Grant {
                receipt: Receipt::Cached {
                    header: record.receipt_header,
                },
                payer: None,
            });
        }
        tracing::debug!(
            payment_id = %id,
            cached_route = %record.route,
            "idempotency hit for another route, ignoring"
        );
    }

    let Some(network) = gateway.registry.lookup(&envelope.network).cloned() else {
        return challenge(Some(format!(
            "unknown or inactive network: {}",
            envelope.network
        )));
    };
    let Some(provider) = gateway.provider(&envelope.network).cloned() else {
        return challenge(Some(format!(
            "no payment provider for network: {}",
            envelope.network
        )));
    };

    let ctx = PaymentContext::new(
        envelope,
        Arc::clone(route),
        network,
        resource.to_owned(),
    );

    let verified = match provider.verify(&ctx).await {
        Ok(verified) => verified,
        Err(err) => {
            tracing::debug!(route = %route.route_key, %err, "payment rejected");
            return challenge(Some(err.to_string()));
        }
    };

    if gateway.credit_enabled
        && gateway
            .credits
            .consume(&verified.payer, &route.route_key)
            .await
    {
        tracing::info!(
            route = %route.route_key,
            payer = %verified.payer,
            "credit consumed, skipping settlement"
        );
        return Admission::Proceed(Grant {
            receipt: Receipt::Credit,
            payer: Some(verified.payer),
        });
    }

    let Some(key) = nonce_key(&ctx.envelope) else {
        return challenge(Some("payment carries no usable nonce".to_owned()));
    };
    let record = NonceRecord::pending(
        ctx.envelope.network.clone(),
        &verified.payer,
        &route.route_key,
        ctx.network.descriptor.vm,
    );
    match gateway.nonces.reserve(&key, &record).await {
        Ok(true) => {}
        Ok(false) => return challenge(Some(NONCE_UNAVAILABLE_REASON.to_owned())),
        Err(err) => {
            // Without exclusivity the gateway must not settle.
            tracing::warn!(nonce = %key, %err, "nonce reservation failed closed");
            return challenge(Some(NONCE_UNAVAILABLE_REASON.to_owned()));
        }
    }

    match settle_reserved(
        gateway.nonces.clone(),
        gateway.idempotency.clone(),
        provider,
        ctx,
        record,
        key,
        payment_id,
        route.route_key.clone(),
    )
    .await
    {
        Ok(header) => Admission::Proceed(Grant {
            receipt: Receipt::Settled { header },
            payer: Some(verified.payer),
        }),
        Err(err) => challenge(Some(format!("settlement failed: {err}"))),
    }
}

/// Settles a reserved nonce on a spawned task and finalizes the stores.
///
/// Spawning decouples the settlement lifecycle from the request future: if
/// the client disconnects mid-settlement, confirmation and the idempotency
/// write still complete, so a retry with the same payment identifier is
/// served from cache instead of double-settling.
#[allow(clippy::too_many_arguments)]
async fn settle_reserved(
    nonces: NonceLedger,
    idempotency: tollbooth::store::IdempotencyCache,
    provider: Arc<dyn PaymentProvider>,
    ctx: PaymentContext,
    record: NonceRecord,
    nonce_key: String,
    payment_id: Option<String>,
    route_key: String,
) -> Result<String, SettleError> {
    let handle = tokio::spawn(async move {
        match provider.settle(&ctx).await {
            Ok(settlement) => {
                let receipt = receipt_of(&settlement);
                let header = headers::encode_receipt(&receipt);
                let confirmed = record.confirmed(receipt.clone());
                nonces.confirm(&nonce_key, &confirmed).await;
                if let Some(id) = payment_id {
                    idempotency
                        .put(&id, &IdempotencyRecord::new(&route_key, &header, receipt))
                        .await;
                }
                Ok(header)
            }
            Err(err) => {
                // Delete the reservation so the client may retry.
                nonces.release(&nonce_key).await;
                Err(err)
            }
        }
    });
    handle.await.unwrap_or_else(|err| {
        Err(SettleError::new("settlement_failed")
            .with_message(format!("settlement task failed: {err}")))
    })
}

fn receipt_of(settlement: &Settlement) -> SettlementReceipt {
    SettlementReceipt {
        success: true,
        tx_hash: settlement.tx_hash.clone(),
        network: settlement.network.clone(),
        block_number: settlement.block_number,
        facilitator: settlement.facilitator.clone(),
    }
}
