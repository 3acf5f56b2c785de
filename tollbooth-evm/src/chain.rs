//! EVM chain client: balance reads and settlement submission.
//!
//! One client exists per active EVM network. The underlying provider is
//! built from the configured RPC endpoint with the settlement wallet
//! attached, so the same handle serves `balanceOf` reads and
//! `transferWithAuthorization` writes.

use std::time::Duration;

use alloy_network::EthereumWallet;
use alloy_primitives::{Address, B256, Signature, TxHash, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_signer_local::PrivateKeySigner;

use crate::contract::IEip3009;

/// Errors from the EVM chain client.
#[derive(Debug, thiserror::Error)]
pub enum EvmChainError {
    /// The configured RPC URL does not parse.
    #[error("invalid RPC URL `{url}`: {source}")]
    InvalidRpcUrl {
        /// The offending URL.
        url: String,
        /// The parse failure.
        #[source]
        source: url::ParseError,
    },
    /// A contract call or transaction submission failed.
    #[error(transparent)]
    Contract(#[from] alloy_contract::Error),
    /// Waiting for the settlement receipt failed or timed out.
    #[error(transparent)]
    PendingTransaction(#[from] alloy_provider::PendingTransactionError),
    /// The settlement transaction landed but reverted.
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
}

/// A settled transfer: transaction hash and the block it landed in.
#[derive(Debug, Clone, Copy)]
pub struct SettledTransfer {
    /// Transaction hash of the settlement.
    pub tx_hash: TxHash,
    /// Block number, when the receipt carried one.
    pub block_number: Option<u64>,
}

/// The fields of a `transferWithAuthorization` call, parsed into chain
/// types.
#[derive(Debug, Clone)]
pub struct TransferCall {
    /// Payer address.
    pub from: Address,
    /// Recipient address.
    pub to: Address,
    /// Transfer amount in token base units.
    pub value: U256,
    /// Start of the validity window, seconds.
    pub valid_after: u64,
    /// End of the validity window, seconds.
    pub valid_before: u64,
    /// 32-byte authorization nonce.
    pub nonce: B256,
    /// EIP-712 signature over the authorization.
    pub signature: Signature,
}

/// Per-network EVM client.
#[derive(Debug, Clone)]
pub struct EvmChainClient {
    provider: DynProvider,
    receipt_timeout: Duration,
}

impl EvmChainClient {
    /// Builds a client for `rpc_url` with the settlement signer attached.
    ///
    /// # Errors
    ///
    /// Returns [`EvmChainError::InvalidRpcUrl`] if the URL does not parse.
    pub fn connect(
        rpc_url: &str,
        signer: PrivateKeySigner,
        receipt_timeout: Duration,
    ) -> Result<Self, EvmChainError> {
        let url = rpc_url
            .parse()
            .map_err(|source| EvmChainError::InvalidRpcUrl {
                url: rpc_url.to_owned(),
                source,
            })?;
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(url)
            .erased();
        Ok(Self {
            provider,
            receipt_timeout,
        })
    }

    /// Reads the payer's token balance.
    ///
    /// # Errors
    ///
    /// Returns [`EvmChainError`] if the RPC call fails.
    pub async fn balance_of(&self, token: Address, owner: Address) -> Result<U256, EvmChainError> {
        let contract = IEip3009::new(token, self.provider.clone());
        Ok(contract.balanceOf(owner).call().await?)
    }

    /// Submits `transferWithAuthorization` and waits for one confirmation.
    ///
    /// The 65-byte signature is decomposed into `(v, r, s)` with `v` in
    /// Electrum notation (27 or 28).
    ///
    /// # Errors
    ///
    /// Returns [`EvmChainError`] if submission fails, the receipt does not
    /// arrive within the configured timeout, or the transaction reverted.
    pub async fn settle_transfer(
        &self,
        token: Address,
        call: &TransferCall,
    ) -> Result<SettledTransfer, EvmChainError> {
        let contract = IEip3009::new(token, self.provider.clone());
        let v = 27 + u8::from(call.signature.v());
        let r = B256::from(call.signature.r());
        let s = B256::from(call.signature.s());

        let pending = contract
            .transferWithAuthorization(
                call.from,
                call.to,
                call.value,
                U256::from(call.valid_after),
                U256::from(call.valid_before),
                call.nonce,
                v,
                r,
                s,
            )
            .send()
            .await?;

        let receipt = pending
            .with_required_confirmations(1)
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await?;

        if receipt.status() {
            tracing::info!(
                tx = %receipt.transaction_hash,
                from = %call.from,
                to = %call.to,
                value = %call.value,
                "transferWithAuthorization confirmed"
            );
            Ok(SettledTransfer {
                tx_hash: receipt.transaction_hash,
                block_number: receipt.block_number,
            })
        } else {
            tracing::warn!(
                tx = %receipt.transaction_hash,
                "transferWithAuthorization reverted"
            );
            Err(EvmChainError::Reverted(receipt.transaction_hash))
        }
    }
}
