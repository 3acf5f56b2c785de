//! Wire format types for the x402 payment protocol.
//!
//! Three documents cross the wire, all as standard base64 of camelCase JSON:
//!
//! - the **payment envelope** a client submits in the `Payment-Signature` (or
//!   `X-Payment`) request header ([`PaymentEnvelope`]),
//! - the **402 challenge** the gateway returns when payment is missing or
//!   rejected ([`PaymentRequired`], also mirrored in the `PAYMENT-REQUIRED`
//!   response header), and
//! - the **settlement receipt** attached to successful responses in the
//!   `PAYMENT-RESPONSE` header ([`SettlementReceipt`]).
//!
//! The envelope payload is scheme-specific: EVM networks carry an ERC-3009
//! authorization plus a 65-byte signature, SVM networks carry a partially
//! signed transaction blob.

use serde::{Deserialize, Serialize};

use crate::chain::ChainId;
use crate::timestamp::UnixTimestamp;

/// The only payment scheme the gateway accepts.
pub const SCHEME_EXACT: &str = "exact";

/// Protocol version emitted in challenges and accepted in envelopes.
pub const X402_VERSION: u8 = 1;

/// Maximum payment validity window advertised to clients, in seconds.
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// A signed payment submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEnvelope {
    /// Protocol version declared by the client.
    pub x402_version: u8,
    /// Payment scheme; only [`SCHEME_EXACT`] is accepted.
    pub scheme: String,
    /// CAIP-2 identifier of the network the payment targets.
    pub network: ChainId,
    /// Scheme-specific signed payload.
    pub payload: PaymentPayload,
    /// Optional protocol extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<EnvelopeExtensions>,
}

impl PaymentEnvelope {
    /// Returns the client-chosen payment identifier if present and well
    /// formed: 16 to 128 characters from `[A-Za-z0-9_-]`.
    ///
    /// Malformed identifiers are ignored rather than rejected so a buggy
    /// client loses idempotent retries but not service.
    #[must_use]
    pub fn payment_id(&self) -> Option<&str> {
        let id = self
            .extensions
            .as_ref()?
            .payment_identifier
            .as_ref()?
            .payment_id
            .as_deref()?;
        let valid = (16..=128).contains(&id.len())
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        valid.then_some(id)
    }
}

/// Scheme-specific envelope payload, distinguished by shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PaymentPayload {
    /// ERC-3009 authorization plus signature (EVM networks).
    Evm(EvmPayload),
    /// Partially signed transaction blob (SVM networks).
    Svm(SvmPayload),
}

/// EVM payment payload: an ERC-3009 `TransferWithAuthorization` message and
/// the EIP-712 signature over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmPayload {
    /// The authorization message the payer signed.
    pub authorization: Eip3009Authorization,
    /// 65-byte signature, 0x-prefixed hex.
    pub signature: String,
}

/// The fields of an ERC-3009 transfer authorization.
///
/// Addresses and the nonce are 0x-prefixed hex strings; the value is a
/// decimal string in token base units. Chain-level parsing happens in the
/// EVM provider so this type stays independent of any chain library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip3009Authorization {
    /// Payer address.
    pub from: String,
    /// Recipient address.
    pub to: String,
    /// Transfer amount in token base units, decimal string.
    pub value: String,
    /// Start of the validity window (inclusive).
    pub valid_after: UnixTimestamp,
    /// End of the validity window (exclusive).
    pub valid_before: UnixTimestamp,
    /// Client-chosen 32-byte nonce, 0x-prefixed hex.
    pub nonce: String,
}

impl Eip3009Authorization {
    /// Parses the transfer value into token base units.
    #[must_use]
    pub fn value_atomic(&self) -> Option<u128> {
        self.value.parse().ok()
    }
}

/// SVM payment payload: a base64 transaction with the fee-payer signature
/// slot left empty for the gateway to fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SvmPayload {
    /// Base64-encoded partially signed transaction.
    pub transaction: String,
}

/// Extensions attached to a client envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeExtensions {
    /// Idempotent-retry identifier chosen by the client.
    #[serde(
        rename = "payment-identifier",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub payment_identifier: Option<PaymentIdClaim>,
}

/// The client's payment-identifier extension payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIdClaim {
    /// Opaque identifier enabling idempotent retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}

/// One acceptable payment option advertised in a 402 challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptEntry {
    /// Payment scheme, always [`SCHEME_EXACT`].
    pub scheme: String,
    /// CAIP-2 identifier of the network.
    pub network: ChainId,
    /// Required amount in token base units, decimal string.
    pub max_amount_required: String,
    /// Same amount, kept for consumers of the older field name.
    pub amount: String,
    /// Maximum seconds a payment authorization may remain valid.
    pub max_timeout_seconds: u64,
    /// Public URL of the protected resource.
    pub resource: String,
    /// Human-readable description of the resource.
    pub description: String,
    /// MIME type of the resource content.
    pub mime_type: String,
    /// Payment recipient address.
    pub pay_to: String,
    /// Token contract (EVM) or mint (SVM) address.
    pub asset: String,
    /// Scheme-specific hints: `{name, version}` EIP-712 domain parameters
    /// for EVM, `{feePayer}` for SVM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Extensions advertised in a 402 challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeExtensions {
    /// Advertises support for the payment-identifier extension.
    #[serde(rename = "payment-identifier")]
    pub payment_identifier: PaymentIdAdvert,
}

impl Default for ChallengeExtensions {
    fn default() -> Self {
        Self {
            payment_identifier: PaymentIdAdvert {
                supported: true,
                required: false,
            },
        }
    }
}

/// Capability advertisement for the payment-identifier extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIdAdvert {
    /// Whether the gateway honors payment identifiers.
    pub supported: bool,
    /// Whether clients must send one.
    pub required: bool,
}

/// Body (and header payload) of a `402 Payment Required` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version.
    pub x402_version: u8,
    /// Machine-readable error slug.
    pub error: String,
    /// Human-readable elaboration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reason a submitted payment was rejected, when one was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Acceptable payment options, one per active network.
    pub accepts: Vec<AcceptEntry>,
    /// Challenge-level extensions.
    pub extensions: ChallengeExtensions,
}

/// Receipt emitted after successful settlement, carried base64-encoded in
/// the `PAYMENT-RESPONSE` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    /// Always true on emitted receipts.
    pub success: bool,
    /// Settlement transaction hash or signature.
    pub tx_hash: String,
    /// Network the settlement landed on.
    pub network: String,
    /// Block number of the settlement, when known locally.
    pub block_number: Option<u64>,
    /// Facilitator endpoint that settled, for delegated settlements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facilitator: Option<String>,
}

/// Envelope POSTed to an external facilitator's `/verify` and `/settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorRequest {
    /// The client's original payment envelope, network and version rewritten
    /// to the facilitator's dialect.
    pub payment_payload: serde_json::Value,
    /// Requirements synthesized from the route and network descriptor.
    pub payment_requirements: FacilitatorRequirements,
}

/// Payment requirements in the dialect external facilitators expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorRequirements {
    /// Payment scheme, always [`SCHEME_EXACT`].
    pub scheme: String,
    /// Facilitator-side network name.
    pub network: String,
    /// Required amount in token base units, decimal string.
    pub max_amount_required: String,
    /// Facilitator recipient contract.
    pub pay_to: String,
    /// Token contract address.
    pub asset: String,
    /// Public URL of the protected resource.
    pub resource: String,
    /// Human-readable description of the resource.
    pub description: String,
    /// MIME type of the resource content.
    pub mime_type: String,
    /// Required amount, duplicated for older facilitator revisions.
    pub amount: String,
    /// Recipient, duplicated for older facilitator revisions.
    pub recipient: String,
    /// Maximum payment validity window in seconds.
    pub max_timeout_seconds: u64,
}

/// Response from a facilitator `/verify` call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorVerifyResponse {
    /// Whether the facilitator judged the payment valid.
    #[serde(default)]
    pub is_valid: bool,
    /// Machine-readable rejection reason.
    #[serde(default)]
    pub invalid_reason: Option<String>,
    /// Payer identity recovered by the facilitator.
    #[serde(default)]
    pub payer: Option<String>,
}

/// Response from a facilitator `/settle` call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorSettleResponse {
    /// Whether settlement succeeded.
    #[serde(default)]
    pub success: bool,
    /// Machine-readable failure reason.
    #[serde(default)]
    pub error_reason: Option<String>,
    /// Settlement transaction identifier.
    #[serde(default)]
    pub transaction: Option<String>,
    /// Facilitator-side network name the settlement landed on.
    #[serde(default)]
    pub network: Option<String>,
    /// Payer identity recovered by the facilitator.
    #[serde(default)]
    pub payer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evm_envelope_json(payment_id: Option<&str>) -> serde_json::Value {
        let mut v = serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "eip155:8453",
            "payload": {
                "authorization": {
                    "from": "0x1111111111111111111111111111111111111111",
                    "to": "0x2222222222222222222222222222222222222222",
                    "value": "10000",
                    "validAfter": "0",
                    "validBefore": "99999999999",
                    "nonce": "0x0101010101010101010101010101010101010101010101010101010101010101"
                },
                "signature": "0xab"
            }
        });
        if let Some(id) = payment_id {
            v["extensions"] =
                serde_json::json!({"payment-identifier": {"paymentId": id}});
        }
        v
    }

    #[test]
    fn decodes_evm_envelope() {
        let envelope: PaymentEnvelope =
            serde_json::from_value(evm_envelope_json(None)).unwrap();
        assert_eq!(envelope.scheme, SCHEME_EXACT);
        match &envelope.payload {
            PaymentPayload::Evm(evm) => {
                assert_eq!(evm.authorization.value_atomic(), Some(10_000));
            }
            PaymentPayload::Svm(_) => panic!("expected EVM payload"),
        }
    }

    #[test]
    fn decodes_svm_envelope() {
        let envelope: PaymentEnvelope = serde_json::from_value(serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp1QckQe",
            "payload": {"transaction": "AQID"}
        }))
        .unwrap();
        assert!(matches!(envelope.payload, PaymentPayload::Svm(_)));
    }

    #[test]
    fn payment_id_enforces_length_and_alphabet() {
        let ok: PaymentEnvelope =
            serde_json::from_value(evm_envelope_json(Some("retry_0123456789-A"))).unwrap();
        assert_eq!(ok.payment_id(), Some("retry_0123456789-A"));

        let short: PaymentEnvelope =
            serde_json::from_value(evm_envelope_json(Some("too-short"))).unwrap();
        assert_eq!(short.payment_id(), None);

        let bad_chars: PaymentEnvelope =
            serde_json::from_value(evm_envelope_json(Some("spaces are not allowed!!"))).unwrap();
        assert_eq!(bad_chars.payment_id(), None);

        let long: PaymentEnvelope =
            serde_json::from_value(evm_envelope_json(Some(&"x".repeat(129)))).unwrap();
        assert_eq!(long.payment_id(), None);
    }

    #[test]
    fn challenge_extensions_default_advertises_payment_identifier() {
        let ext = ChallengeExtensions::default();
        let json = serde_json::to_value(&ext).unwrap();
        assert_eq!(json["payment-identifier"]["supported"], true);
        assert_eq!(json["payment-identifier"]["required"], false);
    }

    #[test]
    fn receipt_serializes_camel_case() {
        let receipt = SettlementReceipt {
            success: true,
            tx_hash: "0xdead".into(),
            network: "eip155:8453".into(),
            block_number: Some(42),
            facilitator: None,
        };
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["txHash"], "0xdead");
        assert_eq!(json["blockNumber"], 42);
        assert!(json.get("facilitator").is_none());
    }
}
