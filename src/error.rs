use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::approvals::models::LifecycleState;

/// Top-level error type for the sweeper
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Errors surfaced by a ledger gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger RPC unavailable: {0}")]
    Network(String),

    #[error("ledger request timed out: {0}")]
    Timeout(String),

    #[error("not found on ledger: {0}")]
    NotFound(String),

    #[error("rejected by ledger: {0}")]
    Rejected(String),

    #[error("invalid ledger address: {0}")]
    InvalidAddress(String),
}

impl LedgerError {
    /// Transient errors leave records untouched and are retried next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Network(_) | LedgerError::Timeout(_))
    }
}

/// Per-record processing outcome taxonomy.
///
/// Only `ClaimInvalid` and `TransferExecution` ever reach the store as a
/// terminal state; the other two leave the record where it is.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("claim invalid: {0}")]
    ClaimInvalid(#[from] ClaimDefect),

    #[error("transfer execution failed: {0}")]
    TransferExecution(String),

    #[error("transient ledger error: {0}")]
    TransientLedger(LedgerError),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl SweepError {
    /// Maps a gateway error raised outside of a single grant's scope.
    pub fn from_ledger(error: LedgerError, context: &str) -> Self {
        if error.is_transient() {
            SweepError::TransientLedger(error)
        } else {
            SweepError::TransferExecution(format!("{}: {}", context, error))
        }
    }
}

/// Why a claim as a whole failed verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimDefect {
    #[error("claim transaction not found")]
    TransactionNotFound,

    #[error("claim transaction failed on ledger: {0}")]
    TransactionFailed(String),

    #[error("claim signature is malformed: {0}")]
    MalformedSignature(String),

    #[error("{failed} of {total} grants failed verification: {details}")]
    GrantsRejected {
        failed: usize,
        total: usize,
        details: String,
    },
}

/// Why a single grant line failed verification or was left out of a batch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrantDefect {
    #[error("token account {account}: no delegate set (expected {expected})")]
    NoDelegate { account: String, expected: String },

    #[error("token account {account}: delegate mismatch (expected {expected}, found {found})")]
    DelegateMismatch {
        account: String,
        expected: String,
        found: String,
    },

    #[error("token account {account}: delegated allowance is zero")]
    ZeroAllowance { account: String },

    #[error("token account {account}: balance is zero")]
    ZeroBalance { account: String },

    #[error("token account {account}: holds mint {found}, claim names {claimed}")]
    MintMismatch {
        account: String,
        claimed: String,
        found: String,
    },

    #[error("token account {account}: already swept by an earlier grant line")]
    DuplicateGrant { account: String },

    #[error("destination has no receiving account for mint {mint}")]
    NoReceivingAccount { mint: String },

    #[error("token account {account}: {error}")]
    Ledger { account: String, error: LedgerError },
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
