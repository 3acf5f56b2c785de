//! Domain error types for payment verification and settlement.

use std::fmt;

use crate::chain::ChainId;

/// Top-level error for a payment attempt.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// The payment failed verification.
    #[error("{0}")]
    Verify(#[from] VerifyError),

    /// The payment failed settlement.
    #[error("{0}")]
    Settle(#[from] SettleError),

    /// The envelope targets a network the gateway does not serve.
    #[error("unknown or inactive network: {0}")]
    UnknownNetwork(ChainId),

    /// The nonce is already used or a settlement for it is in flight.
    #[error("nonce already used or settlement in progress")]
    NonceUnavailable,
}

/// A payment rejected during verification.
///
/// Carries a machine-readable reason, an optional human-readable message,
/// and the payer address when it was recovered before the rejection.
#[derive(Debug, Clone)]
pub struct VerifyError {
    /// Machine-readable reason slug.
    pub invalid_reason: String,
    /// Human-readable elaboration.
    pub invalid_message: Option<String>,
    /// The payer's address, if known.
    pub payer: Option<String>,
}

impl VerifyError {
    /// Creates a new verification error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            invalid_reason: reason.into(),
            invalid_message: None,
            payer: None,
        }
    }

    /// Sets the human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.invalid_message = Some(message.into());
        self
    }

    /// Sets the payer address.
    #[must_use]
    pub fn with_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = &self.invalid_message {
            write!(f, "{}: {}", self.invalid_reason, msg)
        } else {
            write!(f, "{}", self.invalid_reason)
        }
    }
}

impl std::error::Error for VerifyError {}

/// A payment that verified but failed settlement.
#[derive(Debug, Clone)]
pub struct SettleError {
    /// Machine-readable reason slug.
    pub error_reason: String,
    /// Human-readable elaboration.
    pub error_message: Option<String>,
    /// Transaction hash, when one was produced before the failure.
    pub transaction: Option<String>,
}

impl SettleError {
    /// Creates a new settlement error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            error_reason: reason.into(),
            error_message: None,
            transaction: None,
        }
    }

    /// Sets the human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Sets the transaction hash.
    #[must_use]
    pub fn with_transaction(mut self, tx: impl Into<String>) -> Self {
        self.transaction = Some(tx.into());
        self
    }
}

impl fmt::Display for SettleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = &self.error_message {
            write!(f, "{}: {}", self.error_reason, msg)
        } else {
            write!(f, "{}", self.error_reason)
        }
    }
}

impl std::error::Error for SettleError {}

/// Well-known machine-readable rejection reasons.
///
/// Free-form reasons are allowed; these constants keep the common ones
/// consistent across providers.
pub mod reasons {
    /// The declared scheme is not `exact`.
    pub const UNSUPPORTED_SCHEME: &str = "unsupported_scheme";
    /// The payload shape does not match the network's family.
    pub const MALFORMED_PAYLOAD: &str = "malformed_payload";
    /// The authorized value is below the required amount.
    pub const INSUFFICIENT_VALUE: &str = "insufficient_value";
    /// The authorization pays the wrong recipient.
    pub const RECIPIENT_MISMATCH: &str = "recipient_mismatch";
    /// The validity window has not opened yet.
    pub const AUTHORIZATION_EARLY: &str = "authorization_not_yet_valid";
    /// The validity window has closed.
    pub const AUTHORIZATION_EXPIRED: &str = "authorization_expired";
    /// Signature recovery failed or recovered the wrong signer.
    pub const INVALID_SIGNATURE: &str = "invalid_signature";
    /// The payer's on-chain balance cannot cover the transfer.
    pub const INSUFFICIENT_FUNDS: &str = "insufficient_funds";
    /// Settlement transaction reverted on-chain.
    pub const TRANSACTION_REVERTED: &str = "transaction_reverted";
    /// Settlement did not confirm within the deadline.
    pub const SETTLEMENT_TIMEOUT: &str = "settlement_timeout";
}
