//! Chain identification for payment networks.
//!
//! Every supported network is addressed by a [`ChainId`], a CAIP-2 compliant
//! identifier of the form `namespace:reference` (e.g. `eip155:8453` for Base,
//! `solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp1QckQe` for Solana mainnet). The
//! namespace determines the [`VmFamily`] and with it the verification and
//! settlement path a payment takes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// CAIP-2 namespace for EVM chains.
pub const EIP155_NAMESPACE: &str = "eip155";

/// CAIP-2 namespace for Solana-like chains.
pub const SOLANA_NAMESPACE: &str = "solana";

/// A CAIP-2 compliant blockchain identifier.
///
/// # Serialization
///
/// Serializes to/from a colon-separated string: `"eip155:8453"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId {
    namespace: String,
    reference: String,
}

impl ChainId {
    /// Creates a new chain ID from namespace and reference components.
    pub fn new<N: Into<String>, R: Into<String>>(namespace: N, reference: R) -> Self {
        Self {
            namespace: namespace.into(),
            reference: reference.into(),
        }
    }

    /// Returns the namespace component of the chain ID.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the reference component of the chain ID.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the virtual machine family implied by the namespace, if known.
    #[must_use]
    pub fn vm_family(&self) -> Option<VmFamily> {
        match self.namespace.as_str() {
            EIP155_NAMESPACE => Some(VmFamily::Evm),
            SOLANA_NAMESPACE => Some(VmFamily::Svm),
            _ => None,
        }
    }

    /// For `eip155` chains, returns the numeric chain ID.
    #[must_use]
    pub fn eip155_reference(&self) -> Option<u64> {
        (self.namespace == EIP155_NAMESPACE)
            .then(|| self.reference.parse().ok())
            .flatten()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

impl From<ChainId> for String {
    fn from(value: ChainId) -> Self {
        value.to_string()
    }
}

/// Error returned when parsing an invalid chain ID string.
///
/// A valid chain ID is `namespace:reference` with both components non-empty.
#[derive(Debug, thiserror::Error)]
#[error("invalid chain id format: {0}")]
pub struct ChainIdFormatError(String);

impl FromStr for ChainId {
    type Err = ChainIdFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, reference)) if !namespace.is_empty() && !reference.is_empty() => {
                Ok(Self::new(namespace, reference))
            }
            _ => Err(ChainIdFormatError(s.into())),
        }
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The virtual machine family of a network, which selects the payment path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmFamily {
    /// EVM chains settle ERC-3009 `transferWithAuthorization` payloads.
    Evm,
    /// SVM chains settle partially signed transactions co-signed by a fee payer.
    Svm,
}

impl fmt::Display for VmFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evm => write!(f, "evm"),
            Self::Svm => write!(f, "svm"),
        }
    }
}
