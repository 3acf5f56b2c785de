//! The static table of supported payment networks.
//!
//! Network descriptors are immutable for the process lifetime. The
//! [`NetworkRegistry`] is the filtered view of that table: a network is
//! active only when its RPC endpoint is configured and, for SVM networks,
//! a fee-payer key is present.
//!
//! Prices are quoted in 6-decimal atomic units; [`scaled_amount`] widens
//! them to the target token's decimal width.

use std::collections::HashMap;

use crate::chain::{ChainId, VmFamily};
use crate::config::GatewayConfig;

/// A token deployment on a specific network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenDeployment {
    /// Token contract (EVM) or mint (SVM) address.
    pub address: &'static str,
    /// EIP-712 domain name of the token contract.
    pub name: &'static str,
    /// EIP-712 domain version, when the contract defines one.
    pub version: Option<&'static str>,
    /// Decimal width of the token. Must be at least 6.
    pub decimals: u8,
}

/// An external settlement service handling verify/settle for a network
/// where the gateway does not settle locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacilitatorDescriptor {
    /// Base URL of the facilitator.
    pub url: &'static str,
    /// Configuration key the bearer token is looked up under.
    pub api_key_ref: &'static str,
    /// Network name in the facilitator's own dialect.
    pub network_name: &'static str,
    /// Recipient contract the facilitator settles into.
    pub recipient: &'static str,
    /// Protocol version the facilitator speaks.
    pub protocol_version: u8,
}

/// Immutable description of one supported network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkDescriptor {
    /// CAIP-2 chain identifier, e.g. `eip155:8453`.
    pub id: &'static str,
    /// Virtual machine family, which selects the payment path.
    pub vm: VmFamily,
    /// Numeric chain ID for EVM networks.
    pub chain_numeric: Option<u64>,
    /// Configuration key the RPC URL is looked up under.
    pub rpc_url_ref: &'static str,
    /// The stablecoin accepted on this network.
    pub token: TokenDeployment,
    /// External facilitator, when settlement is delegated.
    pub facilitator: Option<FacilitatorDescriptor>,
}

impl NetworkDescriptor {
    /// Returns the parsed CAIP-2 chain identifier.
    ///
    /// # Panics
    ///
    /// Panics if a table entry carries a malformed identifier, which is a
    /// programming error caught by the table tests.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.id.parse().expect("static network table id is valid")
    }
}

/// All networks the gateway knows how to serve.
pub static KNOWN_NETWORKS: &[NetworkDescriptor] = &[
    NetworkDescriptor {
        id: "eip155:8453",
        vm: VmFamily::Evm,
        chain_numeric: Some(8453),
        rpc_url_ref: "base",
        token: TokenDeployment {
            address: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            name: "USD Coin",
            version: Some("2"),
            decimals: 6,
        },
        facilitator: None,
    },
    NetworkDescriptor {
        id: "eip155:84532",
        vm: VmFamily::Evm,
        chain_numeric: Some(84532),
        rpc_url_ref: "base-sepolia",
        token: TokenDeployment {
            address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
            name: "USDC",
            version: Some("2"),
            decimals: 6,
        },
        facilitator: None,
    },
    // MegaETH settles through an external facilitator; its stablecoin is an
    // 18-decimal token, so route prices are widened by 10^12 on the wire.
    NetworkDescriptor {
        id: "eip155:6342",
        vm: VmFamily::Evm,
        chain_numeric: Some(6342),
        rpc_url_ref: "megaeth",
        token: TokenDeployment {
            address: "0xE9b6e75C243B6100ffcb1c66e8f78F96FeeA727F",
            name: "MegaUSD",
            version: None,
            decimals: 18,
        },
        facilitator: Some(FacilitatorDescriptor {
            url: "https://facilitator.megaeth.io",
            api_key_ref: "megaeth",
            network_name: "megaeth-testnet",
            recipient: "0x4D4f7A86F2d69DE11e0225f0b16F09f61FA2C2a4",
            protocol_version: 1,
        }),
    },
    NetworkDescriptor {
        id: "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp1QckQe",
        vm: VmFamily::Svm,
        chain_numeric: None,
        rpc_url_ref: "solana",
        token: TokenDeployment {
            address: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            name: "USD Coin",
            version: None,
            decimals: 6,
        },
        facilitator: None,
    },
];

/// The verification/settlement path a network uses.
///
/// Selection precedence: SVM networks always use the SVM path; an EVM
/// network with a facilitator descriptor uses the facilitator; all other
/// EVM networks settle locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Verify and settle locally over an EVM RPC endpoint.
    LocalEvm,
    /// Delegate verify and settle to an external facilitator.
    ExternalEvm,
    /// Verify and co-sign/settle through the SVM fee-payer client.
    Svm,
}

/// Errors building the active-network registry.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The table carries a token narrower than the 6-decimal price unit.
    #[error("network {id}: token decimals {decimals} below the 6-decimal price unit")]
    UnsupportedDecimals {
        /// The offending network.
        id: &'static str,
        /// Its token's decimal width.
        decimals: u8,
    },
    /// A facilitator network is configured without its bearer token.
    #[error("network {id}: facilitator api key `{key_ref}` is not configured")]
    MissingFacilitatorKey {
        /// The offending network.
        id: &'static str,
        /// The configuration key that was expected.
        key_ref: &'static str,
    },
}

/// One network from the active view, with its resolved configuration.
#[derive(Debug, Clone)]
pub struct ActiveNetwork {
    /// The immutable descriptor from the static table.
    pub descriptor: &'static NetworkDescriptor,
    /// Resolved RPC endpoint URL.
    pub rpc_url: String,
    /// Resolved facilitator bearer token, for facilitator networks.
    pub facilitator_api_key: Option<String>,
    /// The gateway's fee-payer public key, for SVM networks.
    pub fee_payer: Option<String>,
}

impl ActiveNetwork {
    /// Returns the parsed CAIP-2 chain identifier.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.descriptor.chain_id()
    }

    /// Returns the payment path this network uses.
    #[must_use]
    pub fn provider_kind(&self) -> ProviderKind {
        match self.descriptor.vm {
            VmFamily::Svm => ProviderKind::Svm,
            VmFamily::Evm if self.descriptor.facilitator.is_some() => ProviderKind::ExternalEvm,
            VmFamily::Evm => ProviderKind::LocalEvm,
        }
    }

    /// Returns the required on-wire amount for a route price.
    #[must_use]
    pub fn required_amount(&self, price_atomic: u64) -> u128 {
        scaled_amount(price_atomic, self.descriptor.token.decimals)
    }
}

/// Widens a 6-decimal atomic price to a token's decimal width.
///
/// Callers guarantee `decimals >= 6`; the registry rejects narrower tokens
/// when it is built.
#[must_use]
pub fn scaled_amount(price_atomic: u64, decimals: u8) -> u128 {
    u128::from(price_atomic) * 10u128.pow(u32::from(decimals.max(6)) - 6)
}

/// The id-indexed view of networks that are actually serviceable under the
/// current configuration.
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    networks: HashMap<ChainId, ActiveNetwork>,
}

impl NetworkRegistry {
    /// Builds the active view from configuration.
    ///
    /// A network is included when its `rpc_url_ref` resolves to a configured
    /// RPC URL; SVM networks additionally require `svm_fee_payer` (the
    /// public key derived from the configured fee-payer keypair).
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] if an otherwise-active network has a token
    /// narrower than 6 decimals or a facilitator without a configured key.
    pub fn from_config(
        config: &GatewayConfig,
        svm_fee_payer: Option<&str>,
    ) -> Result<Self, NetworkError> {
        let mut networks = HashMap::new();
        for descriptor in KNOWN_NETWORKS {
            let Some(rpc_url) = config.rpc.get(descriptor.rpc_url_ref) else {
                continue;
            };
            if descriptor.token.decimals < 6 {
                return Err(NetworkError::UnsupportedDecimals {
                    id: descriptor.id,
                    decimals: descriptor.token.decimals,
                });
            }
            let fee_payer = match descriptor.vm {
                VmFamily::Svm => match svm_fee_payer {
                    Some(pubkey) => Some(pubkey.to_owned()),
                    None => continue,
                },
                VmFamily::Evm => None,
            };
            let facilitator_api_key = match descriptor.facilitator {
                Some(facilitator) => {
                    let key = config.facilitator_keys.get(facilitator.api_key_ref);
                    match key {
                        Some(key) => Some(key.clone()),
                        None => {
                            return Err(NetworkError::MissingFacilitatorKey {
                                id: descriptor.id,
                                key_ref: facilitator.api_key_ref,
                            });
                        }
                    }
                }
                None => None,
            };
            networks.insert(
                descriptor.chain_id(),
                ActiveNetwork {
                    descriptor,
                    rpc_url: rpc_url.clone(),
                    facilitator_api_key,
                    fee_payer,
                },
            );
        }
        Ok(Self { networks })
    }

    /// Looks up an active network by chain identifier.
    #[must_use]
    pub fn lookup(&self, id: &ChainId) -> Option<&ActiveNetwork> {
        self.networks.get(id)
    }

    /// Iterates active networks in a stable order.
    pub fn active(&self) -> impl Iterator<Item = &ActiveNetwork> {
        let mut ids: Vec<&ChainId> = self.networks.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| &self.networks[id])
    }

    /// Number of active networks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.networks.len()
    }

    /// Whether no network is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn config_with_rpc(entries: &[(&str, &str)]) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        for (key, url) in entries {
            config.rpc.insert((*key).into(), (*url).into());
        }
        config
            .facilitator_keys
            .insert("megaeth".into(), "test-bearer".into());
        config
    }

    #[test]
    fn table_ids_parse_and_decimals_are_wide_enough() {
        for descriptor in KNOWN_NETWORKS {
            let id = descriptor.chain_id();
            assert_eq!(id.vm_family(), Some(descriptor.vm), "{}", descriptor.id);
            assert!(descriptor.token.decimals >= 6, "{}", descriptor.id);
        }
    }

    #[test]
    fn scaling_is_identity_at_six_decimals() {
        assert_eq!(scaled_amount(10_000, 6), 10_000);
    }

    #[test]
    fn scaling_widens_to_eighteen_decimals() {
        assert_eq!(scaled_amount(10_000, 18), 10_000_000_000_000_000);
        assert_eq!(scaled_amount(1, 18), 1_000_000_000_000);
    }

    #[test]
    fn active_view_requires_rpc_configuration() {
        let registry = NetworkRegistry::from_config(
            &config_with_rpc(&[("base", "https://mainnet.base.org")]),
            None,
        )
        .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&"eip155:8453".parse().unwrap()).is_some());
        assert!(registry.lookup(&"eip155:84532".parse().unwrap()).is_none());
    }

    #[test]
    fn svm_network_requires_fee_payer() {
        let config = config_with_rpc(&[("solana", "https://api.mainnet-beta.solana.com")]);
        let without = NetworkRegistry::from_config(&config, None).unwrap();
        assert!(without.is_empty());

        let with =
            NetworkRegistry::from_config(&config, Some("FeePayer1111111111111111111111111111111111"))
                .unwrap();
        assert_eq!(with.len(), 1);
        let network = with.active().next().unwrap();
        assert_eq!(network.provider_kind(), ProviderKind::Svm);
        assert!(network.fee_payer.is_some());
    }

    #[test]
    fn facilitator_precedence_over_local_settlement() {
        let registry = NetworkRegistry::from_config(
            &config_with_rpc(&[
                ("base", "https://mainnet.base.org"),
                ("megaeth", "https://rpc.megaeth.io"),
            ]),
            None,
        )
        .unwrap();
        let base = registry.lookup(&"eip155:8453".parse().unwrap()).unwrap();
        assert_eq!(base.provider_kind(), ProviderKind::LocalEvm);
        let megaeth = registry.lookup(&"eip155:6342".parse().unwrap()).unwrap();
        assert_eq!(megaeth.provider_kind(), ProviderKind::ExternalEvm);
        assert_eq!(megaeth.required_amount(10_000), 10_000_000_000_000_000);
    }

    #[test]
    fn facilitator_network_without_key_is_a_startup_error() {
        let mut config = GatewayConfig::default();
        config
            .rpc
            .insert("megaeth".into(), "https://rpc.megaeth.io".into());
        let err = NetworkRegistry::from_config(&config, None).unwrap_err();
        assert!(matches!(err, NetworkError::MissingFacilitatorKey { .. }));
    }
}
