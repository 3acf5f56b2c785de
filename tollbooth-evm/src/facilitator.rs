//! External-facilitator payment path for EVM networks.
//!
//! Networks whose descriptor names a facilitator delegate both verification
//! and settlement to it. The client's envelope is forwarded with the
//! network and protocol version rewritten into the facilitator's dialect,
//! alongside payment requirements synthesized from the route and network
//! descriptor.

use std::time::Duration;

use tollbooth::error::{SettleError, VerifyError};
use tollbooth::facilitator::{FacilitatorClient, FacilitatorClientError};
use tollbooth::networks::{ActiveNetwork, FacilitatorDescriptor};
use tollbooth::provider::{
    BoxFuture, PaymentContext, PaymentProvider, Settlement, Verified,
};
use tollbooth::proto::{
    FacilitatorRequest, FacilitatorRequirements, MAX_TIMEOUT_SECONDS, PaymentPayload,
    SCHEME_EXACT,
};

/// Errors constructing the external EVM provider.
#[derive(Debug, thiserror::Error)]
pub enum ExternalEvmSetupError {
    /// The network descriptor has no facilitator entry.
    #[error("network {0} has no facilitator descriptor")]
    NoFacilitator(String),
    /// The active network is missing its facilitator bearer token.
    #[error("network {0} has no facilitator api key")]
    NoApiKey(String),
    /// The facilitator client could not be built.
    #[error(transparent)]
    Client(#[from] FacilitatorClientError),
}

/// Delegates verify and settle to a remote facilitator.
pub struct ExternalEvmProvider {
    client: FacilitatorClient,
    facilitator: FacilitatorDescriptor,
}

impl std::fmt::Debug for ExternalEvmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalEvmProvider")
            .field("url", &self.facilitator.url)
            .finish_non_exhaustive()
    }
}

impl ExternalEvmProvider {
    /// Creates a provider for one facilitator-routed network.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalEvmSetupError`] when the descriptor or its key is
    /// missing, or the HTTP client cannot be built.
    pub fn new(network: &ActiveNetwork, timeout: Duration) -> Result<Self, ExternalEvmSetupError> {
        let facilitator = network
            .descriptor
            .facilitator
            .ok_or_else(|| ExternalEvmSetupError::NoFacilitator(network.descriptor.id.to_owned()))?;
        let bearer = network
            .facilitator_api_key
            .as_deref()
            .ok_or_else(|| ExternalEvmSetupError::NoApiKey(network.descriptor.id.to_owned()))?;
        let client = FacilitatorClient::new(facilitator.url, bearer, timeout)?;
        Ok(Self {
            client,
            facilitator,
        })
    }

    /// Builds the outbound request: the original envelope rewritten into the
    /// facilitator's dialect plus synthesized requirements.
    fn request(&self, ctx: &PaymentContext) -> FacilitatorRequest {
        let mut payload =
            serde_json::to_value(&ctx.envelope).expect("envelope serializes to JSON");
        payload["network"] = serde_json::Value::from(self.facilitator.network_name);
        payload["x402Version"] = serde_json::Value::from(self.facilitator.protocol_version);

        let amount = ctx.required_amount.to_string();
        FacilitatorRequest {
            payment_payload: payload,
            payment_requirements: FacilitatorRequirements {
                scheme: SCHEME_EXACT.to_owned(),
                network: self.facilitator.network_name.to_owned(),
                max_amount_required: amount.clone(),
                pay_to: self.facilitator.recipient.to_owned(),
                asset: ctx.network.descriptor.token.address.to_owned(),
                resource: ctx.resource.clone(),
                description: ctx.route.description.clone(),
                mime_type: ctx.route.mime_type.clone(),
                amount,
                recipient: self.facilitator.recipient.to_owned(),
                max_timeout_seconds: MAX_TIMEOUT_SECONDS,
            },
        }
    }

    /// Payer fallback when the facilitator response omits one: the
    /// authorization's `from` field, which settlement will hold to.
    fn envelope_payer(ctx: &PaymentContext) -> Option<String> {
        match &ctx.envelope.payload {
            PaymentPayload::Evm(evm) => Some(evm.authorization.from.clone()),
            PaymentPayload::Svm(_) => None,
        }
    }

    async fn verify_inner(&self, ctx: &PaymentContext) -> Result<Verified, VerifyError> {
        let response = self
            .client
            .verify(&self.request(ctx))
            .await
            .map_err(verify_transport_error)?;
        if !response.is_valid {
            return Err(VerifyError::new(
                response
                    .invalid_reason
                    .unwrap_or_else(|| "facilitator_rejected".to_owned()),
            ));
        }
        let payer = response
            .payer
            .or_else(|| Self::envelope_payer(ctx))
            .ok_or_else(|| {
                VerifyError::new("facilitator_rejected")
                    .with_message("facilitator response carried no payer")
            })?;
        Ok(Verified { payer })
    }

    async fn settle_inner(&self, ctx: &PaymentContext) -> Result<Settlement, SettleError> {
        let response = self
            .client
            .settle(&self.request(ctx))
            .await
            .map_err(settle_transport_error)?;
        if !response.success {
            return Err(SettleError::new(
                response
                    .error_reason
                    .unwrap_or_else(|| "settlement_failed".to_owned()),
            ));
        }
        let tx_hash = response.transaction.ok_or_else(|| {
            SettleError::new("settlement_failed")
                .with_message("facilitator reported success without a transaction")
        })?;
        Ok(Settlement {
            tx_hash,
            network: response
                .network
                .unwrap_or_else(|| self.facilitator.network_name.to_owned()),
            block_number: None,
            facilitator: Some(self.facilitator.url.to_owned()),
        })
    }
}

impl PaymentProvider for ExternalEvmProvider {
    fn verify<'a>(
        &'a self,
        ctx: &'a PaymentContext,
    ) -> BoxFuture<'a, Result<Verified, VerifyError>> {
        Box::pin(self.verify_inner(ctx))
    }

    fn settle<'a>(
        &'a self,
        ctx: &'a PaymentContext,
    ) -> BoxFuture<'a, Result<Settlement, SettleError>> {
        Box::pin(self.settle_inner(ctx))
    }
}

fn verify_transport_error(err: FacilitatorClientError) -> VerifyError {
    match err {
        FacilitatorClientError::UnexpectedStatus { status, reason } => {
            VerifyError::new(reason).with_message(format!("facilitator returned {status}"))
        }
        other => VerifyError::new("facilitator_unreachable").with_message(other.to_string()),
    }
}

fn settle_transport_error(err: FacilitatorClientError) -> SettleError {
    match err {
        FacilitatorClientError::UnexpectedStatus { status, reason } => {
            SettleError::new(reason).with_message(format!("facilitator returned {status}"))
        }
        other => SettleError::new("facilitator_unreachable").with_message(other.to_string()),
    }
}
