//! SVM verification and settlement for the exact scheme.
//!
//! Verification decodes the partially signed transaction, checks its
//! structure (one SPL Token `TransferChecked` to the route recipient's
//! associated token account, fee payer in the gateway's slot, payer
//! signature present), and simulates execution. Settlement co-signs with
//! the fee-payer key and submits.

use std::sync::Arc;
use std::time::Duration;

use solana_pubkey::{Pubkey, pubkey};
use solana_signature::Signature;
use solana_transaction::versioned::VersionedTransaction;
use tokio::sync::OnceCell;

use tollbooth::config::{BalanceCheckMode, GatewayConfig};
use tollbooth::encoding;
use tollbooth::error::{SettleError, VerifyError, reasons};
use tollbooth::networks::ActiveNetwork;
use tollbooth::provider::{
    BoxFuture, PaymentContext, PaymentProvider, Settlement, Verified,
};
use tollbooth::proto::{PaymentPayload, SCHEME_EXACT};

use crate::chain::{self, SvmChainClient, SvmChainError};

/// Associated Token Account program.
pub const ATA_PROGRAM_PUBKEY: Pubkey = pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Errors constructing the SVM provider.
#[derive(Debug, thiserror::Error)]
pub enum SvmSetupError {
    /// No SVM settlement settings are configured.
    #[error("svm settlement is not configured")]
    NotConfigured,
    /// The fee-payer keypair does not parse.
    #[error(transparent)]
    Chain(#[from] SvmChainError),
}

/// Parsed SPL Token `TransferChecked` instruction fields.
#[derive(Debug, Clone, Copy)]
struct TransferChecked {
    amount: u64,
    mint: Pubkey,
    destination: Pubkey,
    authority: Pubkey,
    token_program: Pubkey,
}

/// Verifies and settles exact-scheme payments on one SVM network.
pub struct SvmProvider {
    network: ActiveNetwork,
    fee_payer_key: String,
    fee_payer: Pubkey,
    balance_check: BalanceCheckMode,
    confirm_timeout: Duration,
    client: OnceCell<Arc<SvmChainClient>>,
}

impl std::fmt::Debug for SvmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvmProvider")
            .field("network", &self.network.descriptor.id)
            .field("fee_payer", &self.fee_payer)
            .finish_non_exhaustive()
    }
}

impl SvmProvider {
    /// Creates a provider for one active SVM network.
    ///
    /// # Errors
    ///
    /// Returns [`SvmSetupError`] if SVM settlement is not configured or the
    /// fee-payer keypair does not parse.
    pub fn new(network: ActiveNetwork, config: &GatewayConfig) -> Result<Self, SvmSetupError> {
        let svm = config.svm.as_ref().ok_or(SvmSetupError::NotConfigured)?;
        let keypair = chain::parse_keypair(&svm.fee_payer_key)?;
        Ok(Self {
            network,
            fee_payer_key: svm.fee_payer_key.clone(),
            fee_payer: solana_signer::Signer::pubkey(&keypair),
            balance_check: config.balance_check,
            confirm_timeout: Duration::from_secs(config.receipt_timeout_secs),
            client: OnceCell::new(),
        })
    }

    /// Returns the chain client, constructing it on first use under
    /// single-flight semantics. A failed construction leaves the cell empty
    /// so the next caller retries.
    async fn client(&self) -> Result<&Arc<SvmChainClient>, SvmChainError> {
        self.client
            .get_or_try_init(|| async {
                SvmChainClient::connect(
                    &self.network.rpc_url,
                    &self.fee_payer_key,
                    self.confirm_timeout,
                )
                .map(Arc::new)
            })
            .await
    }

    fn decode(&self, ctx: &PaymentContext) -> Result<VersionedTransaction, VerifyError> {
        if ctx.envelope.scheme != SCHEME_EXACT {
            return Err(VerifyError::new(reasons::UNSUPPORTED_SCHEME)
                .with_message(format!("scheme `{}` is not accepted", ctx.envelope.scheme)));
        }
        let PaymentPayload::Svm(svm) = &ctx.envelope.payload else {
            return Err(VerifyError::new(reasons::MALFORMED_PAYLOAD)
                .with_message("SVM networks require a transaction payload"));
        };
        let bytes = encoding::decode_bytes(&svm.transaction).map_err(|e| {
            VerifyError::new(reasons::MALFORMED_PAYLOAD)
                .with_message(format!("transaction is not base64: {e}"))
        })?;
        bincode::deserialize(&bytes).map_err(|e| {
            VerifyError::new(reasons::MALFORMED_PAYLOAD)
                .with_message(format!("transaction does not deserialize: {e}"))
        })
    }

    fn check_structure(
        &self,
        ctx: &PaymentContext,
        transaction: &VersionedTransaction,
    ) -> Result<TransferChecked, VerifyError> {
        let static_keys = transaction.message.static_account_keys();
        if static_keys.first() != Some(&self.fee_payer) {
            return Err(VerifyError::new("invalid_fee_payer")
                .with_message("transaction fee payer is not the gateway fee payer"));
        }

        let transfer = extract_transfer(transaction)?;
        if transfer.authority == self.fee_payer {
            return Err(VerifyError::new(reasons::MALFORMED_PAYLOAD)
                .with_message("fee payer cannot be the transfer authority"));
        }
        let payer = transfer.authority.to_string();

        let mint: Pubkey = self
            .network
            .descriptor
            .token
            .address
            .parse()
            .expect("static mint address is valid");
        if transfer.mint != mint {
            return Err(VerifyError::new("asset_mismatch")
                .with_message(format!("transfer mint {} is not {mint}", transfer.mint))
                .with_payer(payer));
        }

        let pay_to: Pubkey = ctx
            .route
            .pay_to_svm
            .as_deref()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| VerifyError::new(reasons::RECIPIENT_MISMATCH)
                .with_message("route has no SVM receiving address"))?;
        let (expected_destination, _) = Pubkey::find_program_address(
            &[
                pay_to.as_ref(),
                transfer.token_program.as_ref(),
                transfer.mint.as_ref(),
            ],
            &ATA_PROGRAM_PUBKEY,
        );
        if transfer.destination != expected_destination {
            return Err(VerifyError::new(reasons::RECIPIENT_MISMATCH)
                .with_message("transfer destination is not the recipient's token account")
                .with_payer(payer));
        }

        let required: u64 = ctx.required_amount.try_into().map_err(|_| {
            VerifyError::new(reasons::INSUFFICIENT_VALUE)
                .with_message("required amount exceeds the 64-bit token range")
        })?;
        if transfer.amount != required {
            return Err(VerifyError::new(reasons::INSUFFICIENT_VALUE)
                .with_message(format!(
                    "transfer amount {} does not match required {required}",
                    transfer.amount
                ))
                .with_payer(payer));
        }

        // The payer must already have signed; the gateway only contributes
        // the fee-payer signature.
        let num_required = transaction.message.header().num_required_signatures as usize;
        let signed = static_keys[..num_required.min(static_keys.len())]
            .iter()
            .position(|key| *key == transfer.authority)
            .and_then(|pos| transaction.signatures.get(pos))
            .is_some_and(|sig| *sig != Signature::default());
        if !signed {
            return Err(VerifyError::new(reasons::INVALID_SIGNATURE)
                .with_message("transfer authority has not signed the transaction")
                .with_payer(payer));
        }

        Ok(transfer)
    }

    async fn verify_inner(&self, ctx: &PaymentContext) -> Result<Verified, VerifyError> {
        let transaction = self.decode(ctx)?;
        let transfer = self.check_structure(ctx, &transaction)?;
        let payer = transfer.authority.to_string();

        let simulated = match self.client().await {
            Ok(client) => client.simulate(&transaction).await,
            Err(e) => Err(e),
        };
        match simulated {
            Ok(()) => {}
            Err(SvmChainError::TransactionFailed(err)) => {
                return Err(VerifyError::new("simulation_failed")
                    .with_message(err)
                    .with_payer(payer));
            }
            Err(err) => match self.balance_check {
                BalanceCheckMode::Strict => {
                    return Err(VerifyError::new("simulation_unavailable")
                        .with_message(err.to_string())
                        .with_payer(payer));
                }
                BalanceCheckMode::AllowOnError => {
                    tracing::warn!(
                        network = self.network.descriptor.id,
                        %err,
                        "simulation unavailable, deferring to settlement"
                    );
                }
            },
        }

        Ok(Verified { payer })
    }

    async fn settle_inner(&self, ctx: &PaymentContext) -> Result<Settlement, SettleError> {
        let transaction = self
            .decode(ctx)
            .map_err(|e| SettleError::new(e.invalid_reason))?;
        let client = self
            .client()
            .await
            .map_err(|e| SettleError::new("rpc_unavailable").with_message(e.to_string()))?;

        let signed = client
            .co_sign(transaction)
            .map_err(|e| SettleError::new("cosign_failed").with_message(e.to_string()))?;
        if !chain::is_fully_signed(&signed) {
            return Err(SettleError::new(reasons::INVALID_SIGNATURE)
                .with_message("transaction is not fully signed after co-signing"));
        }

        let signature = client.send_and_confirm(&signed).await.map_err(|e| match e {
            SvmChainError::ConfirmTimeout(_) => {
                SettleError::new(reasons::SETTLEMENT_TIMEOUT).with_message(e.to_string())
            }
            other => SettleError::new("settlement_failed").with_message(other.to_string()),
        })?;

        Ok(Settlement {
            tx_hash: signature.to_string(),
            network: self.network.descriptor.id.to_owned(),
            block_number: None,
            facilitator: None,
        })
    }
}

impl PaymentProvider for SvmProvider {
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

/// Finds the single SPL Token `TransferChecked` instruction.
///
/// Compute-budget instructions are ignored; any other program, a second
/// transfer, or a non-`TransferChecked` token instruction is rejected.
fn extract_transfer(transaction: &VersionedTransaction) -> Result<TransferChecked, VerifyError> {
    let static_keys = transaction.message.static_account_keys();
    let mut found: Option<TransferChecked> = None;

    for instruction in transaction.message.instructions() {
        let program = *instruction.program_id(static_keys);
        if program == solana_compute_budget_interface::ID {
            continue;
        }
        if program == ATA_PROGRAM_PUBKEY {
            return Err(VerifyError::new(reasons::MALFORMED_PAYLOAD)
                .with_message("account creation instructions are not accepted"));
        }

        let amount = if program == spl_token::ID {
            match spl_token::instruction::TokenInstruction::unpack(&instruction.data) {
                Ok(spl_token::instruction::TokenInstruction::TransferChecked { amount, .. }) => {
                    amount
                }
                _ => {
                    return Err(VerifyError::new(reasons::MALFORMED_PAYLOAD)
                        .with_message("only transferChecked token instructions are accepted"));
                }
            }
        } else if program == spl_token_2022::ID {
            match spl_token_2022::instruction::TokenInstruction::unpack(&instruction.data) {
                Ok(spl_token_2022::instruction::TokenInstruction::TransferChecked {
                    amount,
                    ..
                }) => amount,
                _ => {
                    return Err(VerifyError::new(reasons::MALFORMED_PAYLOAD)
                        .with_message("only transferChecked token instructions are accepted"));
                }
            }
        } else {
            return Err(VerifyError::new(reasons::MALFORMED_PAYLOAD)
                .with_message(format!("program {program} is not accepted")));
        };

        if found.is_some() {
            return Err(VerifyError::new(reasons::MALFORMED_PAYLOAD)
                .with_message("multiple transfer instructions"));
        }

        let account = |i: usize| -> Result<Pubkey, VerifyError> {
            instruction
                .accounts
                .get(i)
                .and_then(|idx| static_keys.get(*idx as usize))
                .copied()
                .ok_or_else(|| {
                    VerifyError::new(reasons::MALFORMED_PAYLOAD)
                        .with_message("transfer instruction accounts are truncated")
                })
        };
        found = Some(TransferChecked {
            amount,
            mint: account(1)?,
            destination: account(2)?,
            authority: account(3)?,
            token_program: program,
        });
    }

    found.ok_or_else(|| {
        VerifyError::new(reasons::MALFORMED_PAYLOAD).with_message("no transfer instruction")
    })
}
