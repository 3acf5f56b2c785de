//! The 402 Payment Required challenge builder.
//!
//! Given a route and the request's public URL, assembles one accept entry
//! per active network plus the base64 header form of the same document.
//!
//! Recipient precedence: an EVM network settling through a facilitator uses
//! the facilitator's recipient contract; other EVM networks use the route's
//! EVM receiving address; SVM networks use the route's SVM address. Entries
//! for which no recipient resolves are omitted.

use serde_json::json;

use crate::chain::VmFamily;
use crate::config::RouteDescriptor;
use crate::encoding;
use crate::networks::{ActiveNetwork, NetworkRegistry};
use crate::proto::{
    AcceptEntry, ChallengeExtensions, MAX_TIMEOUT_SECONDS, PaymentRequired, SCHEME_EXACT,
    X402_VERSION,
};

/// A built challenge: the JSON body and its base64 header form.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Value for the `PAYMENT-REQUIRED` response header.
    pub header: String,
    /// The 402 response body.
    pub body: PaymentRequired,
}

/// Builds 402 challenges from the active-network view.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeBuilder<'a> {
    registry: &'a NetworkRegistry,
}

impl<'a> ChallengeBuilder<'a> {
    /// Creates a builder over the given registry.
    #[must_use]
    pub const fn new(registry: &'a NetworkRegistry) -> Self {
        Self { registry }
    }

    /// Builds the challenge for a missing payment header.
    #[must_use]
    pub fn build(&self, route: &RouteDescriptor, resource: &str) -> Challenge {
        self.build_rejection(route, resource, None)
    }

    /// Builds the challenge re-emitted after a rejected payment, carrying
    /// the rejection reason.
    #[must_use]
    pub fn build_rejection(
        &self,
        route: &RouteDescriptor,
        resource: &str,
        reason: Option<String>,
    ) -> Challenge {
        let accepts: Vec<AcceptEntry> = self
            .registry
            .active()
            .filter_map(|network| accept_entry(network, route, resource))
            .collect();

        let body = PaymentRequired {
            x402_version: X402_VERSION,
            error: "payment_required".to_owned(),
            message: Some(format!(
                "Payment of {} is required to access this resource",
                route.display_price
            )),
            reason,
            accepts,
            extensions: ChallengeExtensions::default(),
        };
        let header = encoding::encode_json(&body)
            .expect("challenge body serializes to JSON");
        Challenge { header, body }
    }
}

/// Builds the accept entry for one network, or `None` when the route has no
/// recipient on that network's family.
fn accept_entry(
    network: &ActiveNetwork,
    route: &RouteDescriptor,
    resource: &str,
) -> Option<AcceptEntry> {
    let descriptor = network.descriptor;
    let (pay_to, extra) = match descriptor.vm {
        VmFamily::Evm => {
            let pay_to = match descriptor.facilitator {
                Some(facilitator) => facilitator.recipient.to_owned(),
                None => route.pay_to_evm.clone()?,
            };
            let mut extra = json!({ "name": descriptor.token.name });
            if let Some(version) = descriptor.token.version {
                extra["version"] = json!(version);
            }
            (pay_to, extra)
        }
        VmFamily::Svm => {
            let pay_to = route.pay_to_svm.clone()?;
            let fee_payer = network.fee_payer.as_deref()?;
            (pay_to, json!({ "feePayer": fee_payer }))
        }
    };

    let amount = network.required_amount(route.price_atomic).to_string();
    Some(AcceptEntry {
        scheme: SCHEME_EXACT.to_owned(),
        network: network.chain_id(),
        max_amount_required: amount.clone(),
        amount,
        max_timeout_seconds: MAX_TIMEOUT_SECONDS,
        resource: resource.to_owned(),
        description: route.description.clone(),
        mime_type: route.mime_type.clone(),
        pay_to,
        asset: descriptor.token.address.to_owned(),
        extra: Some(extra),
    })
}
