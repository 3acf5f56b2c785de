//! Gateway configuration.
//!
//! Configuration is loaded once at startup from a TOML file, with `$VAR` /
//! `${VAR}` references in string values expanded from the process
//! environment, and passed through the component graph as an immutable
//! value. Nothing in the core reads the environment after load.
//!
//! # Example
//!
//! ```toml
//! settlement_private_key = "$SETTLEMENT_KEY"
//! enable_credit_system = true
//!
//! [rpc]
//! base = "https://mainnet.base.org"
//! solana = "https://api.mainnet-beta.solana.com"
//!
//! [svm]
//! fee_payer_key = "$SOLANA_FEE_PAYER"
//!
//! [store]
//! url = "redis://127.0.0.1:6379"
//! token = "$KV_TOKEN"
//!
//! [[routes]]
//! route_key = "v1"
//! backend_base_url = "https://api.internal.example"
//! backend_key = "$BACKEND_KEY_V1"
//! price_atomic = 10000
//! display_price = "$0.01"
//! pay_to_evm = "0x36f2F85746bD2935a47F339350F9F3f58A343d4b"
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors loading or validating gateway configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration file is not valid TOML of the expected shape.
    #[error("cannot parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    /// A secret still contains an unresolved `$VAR` reference after
    /// environment expansion.
    #[error("unresolved environment reference in `{field}`")]
    UnresolvedSecret {
        /// The configuration field at fault.
        field: String,
    },
    /// Two routes share a route key.
    #[error("duplicate route key `{0}`")]
    DuplicateRoute(String),
    /// A route has a zero price.
    #[error("route `{0}` has price_atomic = 0")]
    ZeroPrice(String),
    /// A route has no receiving address on any family.
    #[error("route `{0}` has neither pay_to_evm nor pay_to_svm")]
    NoRecipient(String),
}

/// How a failed balance read during verification is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceCheckMode {
    /// A transport failure is logged and the payment proceeds; settlement
    /// itself rejects an unfunded transfer on-chain.
    #[default]
    AllowOnError,
    /// A transport failure rejects the payment.
    Strict,
}

/// Connection settings for the key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Optional auth token applied to the connection.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
            token: None,
        }
    }
}

/// SVM settlement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvmConfig {
    /// Fee-payer keypair, base58.
    pub fee_payer_key: String,
}

/// When and how failed backend responses are compensated with credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPolicy {
    /// Backend status codes that trigger credit issuance.
    #[serde(default = "default_credit_statuses")]
    pub credit_on_status_codes: BTreeSet<u16>,
    /// Per-payer, per-route ceiling on outstanding credits.
    #[serde(default = "default_max_credits")]
    pub max_credits_per_payer: u32,
    /// Credit counter TTL in seconds, refreshed on every write.
    #[serde(default = "default_credit_ttl")]
    pub credit_ttl_secs: u64,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            credit_on_status_codes: default_credit_statuses(),
            max_credits_per_payer: default_max_credits(),
            credit_ttl_secs: default_credit_ttl(),
        }
    }
}

fn default_credit_statuses() -> BTreeSet<u16> {
    [500, 502, 503, 504].into_iter().collect()
}

const fn default_max_credits() -> u32 {
    10
}

const fn default_credit_ttl() -> u64 {
    86_400
}

/// One protected route, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// Stable key identifying the route in store keys and logs.
    pub route_key: String,
    /// Base URL of the backend this route fronts.
    pub backend_base_url: String,
    /// Credential injected into backend requests by the proxy layer.
    #[serde(default)]
    pub backend_key: Option<String>,
    /// Header the backend credential travels in.
    #[serde(default = "default_backend_key_header")]
    pub backend_key_header: String,
    /// Price in 6-decimal atomic units.
    pub price_atomic: u64,
    /// Human-readable price, e.g. `$0.01`.
    pub display_price: String,
    /// Receiving address on EVM networks.
    #[serde(default)]
    pub pay_to_evm: Option<String>,
    /// Receiving address on SVM networks.
    #[serde(default)]
    pub pay_to_svm: Option<String>,
    /// Description shown to payers in 402 challenges.
    #[serde(default)]
    pub description: String,
    /// MIME type of the protected resource.
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Credit compensation policy for this route.
    #[serde(default)]
    pub credit: CreditPolicy,
}

fn default_backend_key_header() -> String {
    "X-Api-Key".to_owned()
}

fn default_mime_type() -> String {
    "application/json".to_owned()
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// RPC endpoint URLs keyed by the network table's `rpc_url_ref`.
    #[serde(default)]
    pub rpc: HashMap<String, String>,
    /// Private key signing local EVM settlement transactions, hex.
    #[serde(default)]
    pub settlement_private_key: Option<String>,
    /// SVM settlement settings; absent disables SVM networks.
    #[serde(default)]
    pub svm: Option<SvmConfig>,
    /// Facilitator bearer tokens keyed by the network table's `api_key_ref`.
    #[serde(default)]
    pub facilitator_keys: HashMap<String, String>,
    /// Key-value store connection.
    #[serde(default)]
    pub store: StoreConfig,
    /// Protected routes.
    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,
    /// Master switch for the credit compensation subsystem.
    #[serde(default)]
    pub enable_credit_system: bool,
    /// Treatment of failed balance reads during verification.
    #[serde(default)]
    pub balance_check: BalanceCheckMode,
    /// Grace applied to validity-window checks, in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
    /// Upper bound on waiting for a settlement confirmation, in seconds.
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
    /// Upper bound on facilitator HTTP calls, in seconds.
    #[serde(default = "default_facilitator_timeout")]
    pub facilitator_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rpc: HashMap::new(),
            settlement_private_key: None,
            svm: None,
            facilitator_keys: HashMap::new(),
            store: StoreConfig::default(),
            routes: Vec::new(),
            enable_credit_system: false,
            balance_check: BalanceCheckMode::default(),
            clock_skew_secs: default_clock_skew(),
            receipt_timeout_secs: default_receipt_timeout(),
            facilitator_timeout_secs: default_facilitator_timeout(),
        }
    }
}

const fn default_clock_skew() -> u64 {
    6
}

const fn default_receipt_timeout() -> u64 {
    60
}

const fn default_facilitator_timeout() -> u64 {
    15
}

impl GatewayConfig {
    /// Loads configuration from the path in the `CONFIG` environment
    /// variable, falling back to `tollbooth.toml` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or
    /// validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "tollbooth.toml".to_owned());
        Self::load_from(Path::new(&path))
    }

    /// Loads configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or
    /// validated.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parses and validates configuration from a TOML string, expanding
    /// environment references first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if parsing or validation fails.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(raw);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = &self.settlement_private_key
            && looks_unresolved(key)
        {
            return Err(ConfigError::UnresolvedSecret {
                field: "settlement_private_key".into(),
            });
        }
        if let Some(svm) = &self.svm
            && looks_unresolved(&svm.fee_payer_key)
        {
            return Err(ConfigError::UnresolvedSecret {
                field: "svm.fee_payer_key".into(),
            });
        }
        for (key_ref, token) in &self.facilitator_keys {
            if looks_unresolved(token) {
                return Err(ConfigError::UnresolvedSecret {
                    field: format!("facilitator_keys.{key_ref}"),
                });
            }
        }

        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.route_key.as_str()) {
                return Err(ConfigError::DuplicateRoute(route.route_key.clone()));
            }
            if route.price_atomic == 0 {
                return Err(ConfigError::ZeroPrice(route.route_key.clone()));
            }
            if route.pay_to_evm.is_none() && route.pay_to_svm.is_none() {
                return Err(ConfigError::NoRecipient(route.route_key.clone()));
            }
            if let Some(key) = &route.backend_key
                && looks_unresolved(key)
            {
                return Err(ConfigError::UnresolvedSecret {
                    field: format!("routes.{}.backend_key", route.route_key),
                });
            }
        }
        Ok(())
    }
}

/// A secret that still starts with `$` after expansion points at a missing
/// environment variable.
fn looks_unresolved(value: &str) -> bool {
    value.trim_start().starts_with('$')
}

/// Expands `$VAR` and `${VAR}` references from the process environment.
/// Unresolved references are left in place for [`GatewayConfig::validate`]
/// to flag on secret fields.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        let (name, consumed) = if let Some(stripped) = rest.strip_prefix('{') {
            match stripped.find('}') {
                Some(end) => (&stripped[..end], end + 2),
                None => {
                    out.push('$');
                    continue;
                }
            }
        } else {
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(rest.len());
            (&rest[..end], end)
        };

        if name.is_empty() {
            out.push('$');
            continue;
        }
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                out.push('$');
                out.push_str(&rest[..consumed]);
            }
        }
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    out
}
