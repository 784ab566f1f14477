// Ledger access: the gateway contract, per-network registry and the
// Solana implementation
pub mod registry;
pub mod solana;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::LedgerError;

pub use registry::{NetworkProfile, NetworkRegistry};

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Succeeded,
    Failed(String),
}

/// A transaction as the ledger reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub signature: String,
    pub status: TransactionStatus,
}

/// Live delegation view of one token account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccountState {
    pub mint: String,
    pub decimals: u8,
    pub delegate: Option<String>,
    pub delegated_amount: u64,
    pub balance: u64,
}

impl TokenAccountState {
    /// Largest amount the delegate can move right now
    pub fn sweepable(&self) -> u64 {
        self.delegated_amount.min(self.balance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInstruction {
    pub source: String,
    pub destination: String,
    pub mint: String,
    pub amount: u64,
    pub decimals: u8,
}

/// Transfers signed by one authority and landed as one atomic transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBatch {
    pub authority: String,
    pub transfers: Vec<TransferInstruction>,
}

impl TransferBatch {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            transfers: Vec::new(),
        }
    }

    pub fn push_transfer(
        &mut self,
        source: &str,
        destination: &str,
        mint: &str,
        amount: u64,
        decimals: u8,
    ) {
        self.transfers.push(TransferInstruction {
            source: source.to_string(),
            destination: destination.to_string(),
            mint: mint.to_string(),
            amount,
            decimals,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn total_amount(&self) -> u128 {
        self.transfers.iter().map(|t| u128::from(t.amount)).sum()
    }
}

/// A signed but not yet broadcast batch.
///
/// `signature` is final: broadcasting the same batch against the same
/// blockhash reproduces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransfer {
    pub signature: String,
    pub recent_blockhash: String,
    pub batch: TransferBatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Confirmed,
    Failed(String),
    TimedOut,
}

/// Read/write access to one ledger network.
///
/// Reads reflect the latest confirmed state at call time. `Network` and
/// `Timeout` errors are transient; `NotFound` and `Rejected` are final for
/// the specific check that raised them.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Public address of the locally held delegate signing identity, if any
    fn signer_address(&self) -> Option<String>;

    /// Look up a transaction by signature; `None` when the ledger has no
    /// record of it at the gateway's commitment level
    async fn get_transaction(&self, signature: &str) -> LedgerResult<Option<LedgerTransaction>>;

    async fn get_token_account_state(&self, token_account: &str) -> LedgerResult<TokenAccountState>;

    /// Token account owned by `owner` able to receive `mint`, if one exists
    async fn find_receiving_account(&self, owner: &str, mint: &str) -> LedgerResult<Option<String>>;

    /// Build and sign the batch without broadcasting it
    async fn prepare_transfer(&self, batch: TransferBatch) -> LedgerResult<PreparedTransfer>;

    /// Broadcast a prepared batch
    async fn send_prepared(&self, prepared: &PreparedTransfer) -> LedgerResult<()>;

    /// Whether a transaction signed against `blockhash` could still land
    async fn is_blockhash_valid(&self, blockhash: &str) -> LedgerResult<bool>;

    async fn await_confirmation(
        &self,
        signature: &str,
        timeout: Duration,
    ) -> LedgerResult<ConfirmationStatus>;
}
