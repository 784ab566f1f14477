use async_trait::async_trait;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    message::Message,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{
    ConfirmationStatus, LedgerGateway, LedgerResult, LedgerTransaction, PreparedTransfer,
    TokenAccountState, TransactionStatus, TransferBatch,
};
use crate::error::LedgerError;

#[derive(Debug, Clone)]
pub struct SolanaGatewayConfig {
    pub rpc_url: String,
    pub commitment: CommitmentConfig,
    pub poll_interval: Duration,
}

impl Default for SolanaGatewayConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            commitment: CommitmentConfig::confirmed(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Solana ledger gateway over JSON-RPC
pub struct SolanaGateway {
    config: SolanaGatewayConfig,
    client: RpcClient,
    delegate_keypair: Option<Arc<Keypair>>,
}

impl SolanaGateway {
    pub fn new(config: SolanaGatewayConfig) -> Self {
        let client = RpcClient::new_with_commitment(config.rpc_url.clone(), config.commitment);

        Self {
            config,
            client,
            delegate_keypair: None,
        }
    }

    pub fn with_delegate(mut self, keypair: Keypair) -> Self {
        self.delegate_keypair = Some(Arc::new(keypair));
        self
    }

    fn keypair(&self) -> LedgerResult<&Keypair> {
        self.delegate_keypair
            .as_deref()
            .ok_or_else(|| LedgerError::Rejected("no delegate signing identity loaded".to_string()))
    }

    fn sign(&self, batch: &TransferBatch, recent_blockhash: Hash) -> LedgerResult<Transaction> {
        let keypair = self.keypair()?;
        let authority = keypair.pubkey();

        if batch.authority != authority.to_string() {
            return Err(LedgerError::Rejected(format!(
                "batch authority {} is not the loaded delegate {}",
                batch.authority, authority
            )));
        }

        let instructions = build_transfer_instructions(batch, &authority)?;
        let message = Message::new(&instructions, Some(&authority));

        Ok(Transaction::new(&[keypair], message, recent_blockhash))
    }

    async fn simulate(&self, transaction: &Transaction) -> LedgerResult<()> {
        let result = self
            .client
            .simulate_transaction(transaction)
            .await
            .map_err(|e| rpc_error("simulation", e))?;

        if let Some(err) = result.value.err {
            return Err(LedgerError::Rejected(format!(
                "Transaction would fail: {:?}",
                err
            )));
        }

        Ok(())
    }
}

/// One `transfer_checked` per batch entry, all signed by `authority`
pub fn build_transfer_instructions(
    batch: &TransferBatch,
    authority: &Pubkey,
) -> LedgerResult<Vec<Instruction>> {
    batch
        .transfers
        .iter()
        .map(|transfer| {
            let source = parse_pubkey(&transfer.source)?;
            let mint = parse_pubkey(&transfer.mint)?;
            let destination = parse_pubkey(&transfer.destination)?;

            spl_token::instruction::transfer_checked(
                &spl_token::ID,
                &source,
                &mint,
                &destination,
                authority,
                &[],
                transfer.amount,
                transfer.decimals,
            )
            .map_err(|e| {
                LedgerError::Rejected(format!("Failed to build SPL transfer instruction: {:?}", e))
            })
        })
        .collect()
}

fn parse_pubkey(address: &str) -> LedgerResult<Pubkey> {
    Pubkey::from_str(address).map_err(|_| LedgerError::InvalidAddress(address.to_string()))
}

fn parse_signature(signature: &str) -> LedgerResult<Signature> {
    Signature::from_str(signature).map_err(|_| LedgerError::InvalidAddress(signature.to_string()))
}

fn parse_amount(raw: &str, field: &str) -> LedgerResult<u64> {
    raw.parse::<u64>()
        .map_err(|_| LedgerError::Rejected(format!("unparseable {}: {}", field, raw)))
}

/// A status only counts once it reaches the configured commitment; below
/// that the transaction may still be dropped with its fork
fn committed_status(failure: Option<String>, committed: bool) -> Option<TransactionStatus> {
    if !committed {
        return None;
    }
    Some(match failure {
        Some(err) => TransactionStatus::Failed(err),
        None => TransactionStatus::Succeeded,
    })
}

fn rpc_error(context: &str, error: ClientError) -> LedgerError {
    LedgerError::Network(format!("{} failed: {}", context, error))
}

#[async_trait]
impl LedgerGateway for SolanaGateway {
    fn signer_address(&self) -> Option<String> {
        self.delegate_keypair.as_ref().map(|k| k.pubkey().to_string())
    }

    async fn get_transaction(&self, signature: &str) -> LedgerResult<Option<LedgerTransaction>> {
        let parsed = parse_signature(signature)?;

        let response = self
            .client
            .get_signature_statuses_with_history(&[parsed])
            .await
            .map_err(|e| rpc_error("signature status lookup", e))?;

        let Some(status) = response.value.into_iter().next().flatten() else {
            return Ok(None);
        };

        let committed = status.satisfies_commitment(self.config.commitment);
        let failure = status.err.as_ref().map(|err| format!("{:?}", err));

        match committed_status(failure, committed) {
            Some(tx_status) => Ok(Some(LedgerTransaction {
                signature: signature.to_string(),
                status: tx_status,
            })),
            None => {
                debug!("{} seen below {:?} commitment", signature, self.config.commitment.commitment);
                Ok(None)
            }
        }
    }

    async fn get_token_account_state(&self, token_account: &str) -> LedgerResult<TokenAccountState> {
        let pubkey = parse_pubkey(token_account)?;

        let account = self
            .client
            .get_account_with_commitment(&pubkey, self.config.commitment)
            .await
            .map_err(|e| rpc_error("account lookup", e))?
            .value
            .ok_or_else(|| LedgerError::NotFound(token_account.to_string()))?;

        if account.owner != spl_token::ID {
            return Err(LedgerError::Rejected(format!(
                "{} is not an SPL token account",
                token_account
            )));
        }

        let parsed = self
            .client
            .get_token_account_with_commitment(&pubkey, self.config.commitment)
            .await
            .map_err(|e| rpc_error("token account lookup", e))?
            .value
            .ok_or_else(|| LedgerError::NotFound(token_account.to_string()))?;

        let delegated_amount = match &parsed.delegated_amount {
            Some(amount) => parse_amount(&amount.amount, "delegated amount")?,
            None => 0,
        };

        Ok(TokenAccountState {
            mint: parsed.mint.clone(),
            decimals: parsed.token_amount.decimals,
            delegate: parsed.delegate.clone(),
            delegated_amount,
            balance: parse_amount(&parsed.token_amount.amount, "balance")?,
        })
    }

    async fn find_receiving_account(&self, owner: &str, mint: &str) -> LedgerResult<Option<String>> {
        let owner_pubkey = parse_pubkey(owner)?;
        let mint_pubkey = parse_pubkey(mint)?;

        let ata = spl_associated_token_account::get_associated_token_address(
            &owner_pubkey,
            &mint_pubkey,
        );

        match self.get_token_account_state(&ata.to_string()).await {
            Ok(state) if state.mint == mint => Ok(Some(ata.to_string())),
            Ok(state) => {
                warn!(
                    "Receiving account {} holds mint {}, expected {}",
                    ata, state.mint, mint
                );
                Ok(None)
            }
            Err(LedgerError::NotFound(_)) | Err(LedgerError::Rejected(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn prepare_transfer(&self, batch: TransferBatch) -> LedgerResult<PreparedTransfer> {
        let recent_blockhash = self
            .client
            .get_latest_blockhash()
            .await
            .map_err(|e| rpc_error("blockhash fetch", e))?;

        let transaction = self.sign(&batch, recent_blockhash)?;
        let signature = transaction
            .signatures
            .first()
            .ok_or_else(|| LedgerError::Rejected("transaction carries no signature".to_string()))?
            .to_string();

        debug!(
            "Prepared sweep {} with {} transfers",
            signature,
            batch.transfers.len()
        );

        Ok(PreparedTransfer {
            signature,
            recent_blockhash: recent_blockhash.to_string(),
            batch,
        })
    }

    async fn send_prepared(&self, prepared: &PreparedTransfer) -> LedgerResult<()> {
        let recent_blockhash = Hash::from_str(&prepared.recent_blockhash).map_err(|_| {
            LedgerError::Rejected(format!("bad blockhash: {}", prepared.recent_blockhash))
        })?;

        // Same message + same blockhash reproduces the claimed signature
        let transaction = self.sign(&prepared.batch, recent_blockhash)?;
        let rebuilt = transaction.signatures.first().map(|s| s.to_string());
        if rebuilt.as_deref() != Some(prepared.signature.as_str()) {
            return Err(LedgerError::Rejected(format!(
                "rebuilt transaction signature differs from prepared {}",
                prepared.signature
            )));
        }

        self.simulate(&transaction).await?;

        info!("Simulation successful, sending sweep {}", prepared.signature);

        self.client
            .send_transaction(&transaction)
            .await
            .map_err(|e| match e.get_transaction_error() {
                Some(tx_err) => LedgerError::Rejected(format!("Send failed: {:?}", tx_err)),
                None => rpc_error("send", e),
            })?;

        Ok(())
    }

    async fn is_blockhash_valid(&self, blockhash: &str) -> LedgerResult<bool> {
        let hash = Hash::from_str(blockhash)
            .map_err(|_| LedgerError::InvalidAddress(blockhash.to_string()))?;

        // Processed is the widest view: a hash still valid anywhere can land
        self.client
            .is_blockhash_valid(&hash, CommitmentConfig::processed())
            .await
            .map_err(|e| rpc_error("blockhash validity check", e))
    }

    async fn await_confirmation(
        &self,
        signature: &str,
        timeout: Duration,
    ) -> LedgerResult<ConfirmationStatus> {
        let parsed = parse_signature(signature)?;
        let start = std::time::Instant::now();

        loop {
            match self.client.get_signature_statuses(&[parsed]).await {
                Ok(response) => {
                    if let Some(Some(status)) = response.value.first() {
                        let committed = status.satisfies_commitment(self.config.commitment);
                        let failure = status.err.as_ref().map(|err| format!("{:?}", err));
                        match committed_status(failure, committed) {
                            Some(TransactionStatus::Succeeded) => {
                                return Ok(ConfirmationStatus::Confirmed)
                            }
                            Some(TransactionStatus::Failed(reason)) => {
                                return Ok(ConfirmationStatus::Failed(reason))
                            }
                            None => {}
                        }
                    }
                }
                Err(e) => {
                    // Keep polling until the deadline
                    debug!("Status poll for {} failed: {}", signature, e);
                }
            }

            if start.elapsed() >= timeout {
                return Ok(ConfirmationStatus::TimedOut);
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
