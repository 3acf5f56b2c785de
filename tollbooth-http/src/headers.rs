//! Payment header names and codecs.
//!
//! Clients signal payment with `Payment-Signature` or `X-Payment` (both
//! accepted). The gateway answers with `PAYMENT-REQUIRED` on challenges,
//! `PAYMENT-RESPONSE` on settled requests, and `X-x402-Credit: consumed`
//! when a credit covered the request.

use http::HeaderMap;

use tollbooth::encoding::{self, DecodeError};
use tollbooth::proto::{PaymentEnvelope, SettlementReceipt};

/// Challenge header on 402 responses.
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";

/// Receipt header on successfully settled responses.
pub const PAYMENT_RESPONSE_HEADER: &str = "payment-response";

/// Primary request header carrying the payment envelope.
pub const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";

/// Alternate request header carrying the payment envelope.
pub const X_PAYMENT_HEADER: &str = "x-payment";

/// Sentinel header marking a request served from a credit.
pub const CREDIT_HEADER: &str = "x-x402-credit";

/// Value of [`CREDIT_HEADER`].
pub const CREDIT_CONSUMED: &str = "consumed";

/// Extracts the payment header value, preferring `Payment-Signature`.
/// Header name matching is case-insensitive by construction.
#[must_use]
pub fn payment_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(PAYMENT_SIGNATURE_HEADER)
        .or_else(|| headers.get(X_PAYMENT_HEADER))
        .and_then(|value| value.to_str().ok())
}

/// Decodes a base64 payment envelope from a header value.
///
/// # Errors
///
/// Returns [`DecodeError`] on malformed base64 or JSON.
pub fn decode_envelope(value: &str) -> Result<PaymentEnvelope, DecodeError> {
    encoding::decode_json(value)
}

/// Encodes a settlement receipt into its header form.
#[must_use]
pub fn encode_receipt(receipt: &SettlementReceipt) -> String {
    encoding::encode_json(receipt).expect("receipt serializes to JSON")
}
