//! SVM chain client: co-signing, simulation, and submission.

use std::time::Duration;

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSimulateTransactionConfig;
use solana_commitment_config::CommitmentConfig;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use solana_transaction::versioned::VersionedTransaction;

/// Errors from the SVM chain client.
#[derive(Debug, thiserror::Error)]
pub enum SvmChainError {
    /// The fee-payer keypair does not parse.
    #[error("invalid fee payer keypair: {0}")]
    InvalidKeypair(String),
    /// Co-signing failed.
    #[error("cannot sign transaction: {0}")]
    Signing(String),
    /// RPC transport failure.
    #[error("rpc error: {0}")]
    Rpc(#[from] Box<solana_client::client_error::ClientError>),
    /// The simulated or submitted transaction failed on the ledger.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    /// Submission did not confirm within the deadline.
    #[error("confirmation timed out after {0:?}")]
    ConfirmTimeout(Duration),
}

/// Parses a base58 fee-payer keypair.
///
/// # Errors
///
/// Returns [`SvmChainError::InvalidKeypair`] if the string is not a valid
/// base58 keypair.
pub fn parse_keypair(fee_payer_key: &str) -> Result<Keypair, SvmChainError> {
    let bytes = bs58::decode(fee_payer_key.trim())
        .into_vec()
        .map_err(|e| SvmChainError::InvalidKeypair(e.to_string()))?;
    Keypair::try_from(bytes.as_slice()).map_err(|e| SvmChainError::InvalidKeypair(e.to_string()))
}

/// Derives the public key of a configured fee-payer keypair, as advertised
/// in 402 challenges and checked against incoming transactions.
///
/// # Errors
///
/// Returns [`SvmChainError::InvalidKeypair`] if the keypair does not parse.
pub fn fee_payer_pubkey(fee_payer_key: &str) -> Result<String, SvmChainError> {
    Ok(parse_keypair(fee_payer_key)?.pubkey().to_string())
}

/// Per-network SVM client holding the RPC connection and fee-payer key.
pub struct SvmChainClient {
    rpc: RpcClient,
    fee_payer: Keypair,
    confirm_timeout: Duration,
}

impl std::fmt::Debug for SvmChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvmChainClient")
            .field("fee_payer", &self.fee_payer.pubkey())
            .finish_non_exhaustive()
    }
}

impl SvmChainClient {
    /// Builds a client for `rpc_url` with the given fee-payer keypair.
    ///
    /// # Errors
    ///
    /// Returns [`SvmChainError::InvalidKeypair`] if the keypair does not
    /// parse.
    pub fn connect(
        rpc_url: &str,
        fee_payer_key: &str,
        confirm_timeout: Duration,
    ) -> Result<Self, SvmChainError> {
        Ok(Self {
            rpc: RpcClient::new(rpc_url.to_owned()),
            fee_payer: parse_keypair(fee_payer_key)?,
            confirm_timeout,
        })
    }

    /// The fee payer's public key.
    #[must_use]
    pub fn fee_payer(&self) -> Pubkey {
        self.fee_payer.pubkey()
    }

    /// Fills the fee-payer signature slot of a partially signed transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SvmChainError::Signing`] if the fee payer is not among the
    /// transaction's required signers.
    pub fn co_sign(
        &self,
        mut transaction: VersionedTransaction,
    ) -> Result<VersionedTransaction, SvmChainError> {
        let message_bytes = transaction.message.serialize();
        let signature = self
            .fee_payer
            .try_sign_message(&message_bytes)
            .map_err(|e| SvmChainError::Signing(e.to_string()))?;

        let num_required = transaction.message.header().num_required_signatures as usize;
        let static_keys = transaction.message.static_account_keys();
        let position = static_keys[..num_required.min(static_keys.len())]
            .iter()
            .position(|key| *key == self.fee_payer.pubkey())
            .ok_or_else(|| {
                SvmChainError::Signing("fee payer is not a required signer".to_owned())
            })?;

        if transaction.signatures.len() < num_required {
            transaction
                .signatures
                .resize(num_required, Signature::default());
        }
        transaction.signatures[position] = signature;
        Ok(transaction)
    }

    /// Simulates a transaction without signature checks.
    ///
    /// # Errors
    ///
    /// Returns [`SvmChainError::Rpc`] on transport failure and
    /// [`SvmChainError::TransactionFailed`] when the ledger rejects the
    /// simulated execution.
    pub async fn simulate(&self, transaction: &VersionedTransaction) -> Result<(), SvmChainError> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false,
            replace_recent_blockhash: true,
            commitment: Some(CommitmentConfig::confirmed()),
            ..RpcSimulateTransactionConfig::default()
        };
        let response = self
            .rpc
            .simulate_transaction_with_config(transaction, config)
            .await
            .map_err(Box::new)?;
        if let Some(err) = response.value.err {
            return Err(SvmChainError::TransactionFailed(err.to_string()));
        }
        Ok(())
    }

    /// Submits a fully signed transaction and waits for confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`SvmChainError`] on transport failure, ledger rejection, or
    /// confirmation timeout.
    pub async fn send_and_confirm(
        &self,
        transaction: &VersionedTransaction,
    ) -> Result<Signature, SvmChainError> {
        let submit = self.rpc.send_and_confirm_transaction(transaction);
        match tokio::time::timeout(self.confirm_timeout, submit).await {
            Ok(Ok(signature)) => Ok(signature),
            Ok(Err(err)) => Err(SvmChainError::Rpc(Box::new(err))),
            Err(_) => Err(SvmChainError::ConfirmTimeout(self.confirm_timeout)),
        }
    }
}

/// Whether every required signature slot holds a real signature.
#[must_use]
pub fn is_fully_signed(transaction: &VersionedTransaction) -> bool {
    let num_required = transaction.message.header().num_required_signatures as usize;
    transaction.signatures.len() >= num_required
        && transaction
            .signatures
            .iter()
            .all(|s| *s != Signature::default())
}
