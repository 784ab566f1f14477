use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Lifecycle of an approval claim.
///
/// Valid transitions:
/// - Submitted → Verified, VerificationFailed
/// - Verified → Transferred, TransferFailed
/// - VerificationFailed, Transferred, TransferFailed → none (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "approval_lifecycle", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Submitted,
    Verified,
    VerificationFailed,
    Transferred,
    TransferFailed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Submitted => "submitted",
            LifecycleState::Verified => "verified",
            LifecycleState::VerificationFailed => "verification_failed",
            LifecycleState::Transferred => "transferred",
            LifecycleState::TransferFailed => "transfer_failed",
        }
    }

    /// States reachable in one step from this one
    pub fn successors(&self) -> &'static [LifecycleState] {
        match self {
            LifecycleState::Submitted => &[
                LifecycleState::Verified,
                LifecycleState::VerificationFailed,
            ],
            LifecycleState::Verified => &[
                LifecycleState::Transferred,
                LifecycleState::TransferFailed,
            ],
            LifecycleState::VerificationFailed
            | LifecycleState::Transferred
            | LifecycleState::TransferFailed => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    pub fn can_transition_to(&self, to: LifecycleState) -> bool {
        self.successors().contains(&to)
    }

    /// SECURITY: every store implementation calls this before issuing the
    /// guarded update, so an illegal edge never reaches the database.
    pub fn validate_transition(from: LifecycleState, to: LifecycleState) -> AppResult<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(AppError::InvalidTransition { from, to })
        }
    }
}

/// One token-account-level claim within an approval record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantLine {
    pub token_account: String,
    pub mint: String,
    /// What the owner says they approved. Never used for sizing transfers.
    pub claimed_amount: String,
    pub decimals: u8,
}

/// Render a raw base-unit amount in token units, for logs
pub fn ui_amount(raw: u64, decimals: u8) -> Decimal {
    Decimal::try_from_i128_with_scale(i128::from(raw), u32::from(decimals))
        .unwrap_or_else(|_| Decimal::from(raw))
}

/// Outcome of verifying one grant against the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantVerification {
    pub token_account: String,
    pub passed: bool,
    pub observed_delegate: Option<String>,
    pub delegated_amount: u64,
    pub balance: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantTransferStatus {
    /// Included in a broadcast batch, confirmation outstanding
    Pending,
    Transferred,
    /// Left out of the batch before submission
    Skipped,
    /// Included in a batch that failed on submission or confirmation
    Failed,
}

/// Outcome of sweeping one grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantTransfer {
    pub token_account: String,
    pub mint: String,
    pub destination_account: Option<String>,
    pub amount: u64,
    pub status: GrantTransferStatus,
    pub reason: Option<String>,
}

impl GrantTransfer {
    pub fn skipped(grant: &GrantLine, reason: String) -> Self {
        Self {
            token_account: grant.token_account.clone(),
            mint: grant.mint.clone(),
            destination_account: None,
            amount: 0,
            status: GrantTransferStatus::Skipped,
            reason: Some(reason),
        }
    }

    pub fn is_included(&self) -> bool {
        self.status != GrantTransferStatus::Skipped
    }
}

/// Approval claim as written by the ingestion collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApproval {
    pub owner: String,
    pub delegate: String,
    pub network: String,
    pub claim_signature: String,
    pub grants: Vec<GrantLine>,
}

/// ApprovalRecord entity - one per claimed delegation event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub owner: String,
    pub delegate: String,
    pub network: String,
    pub claim_signature: String,
    pub grants: Vec<GrantLine>,

    pub lifecycle_state: LifecycleState,
    pub verification_results: Vec<GrantVerification>,
    pub transfer_results: Vec<GrantTransfer>,
    pub failure_reason: Option<String>,

    /// Signature of the sweep transaction. Attached before broadcast, so a
    /// `Verified` record carrying one has a settlement in flight.
    pub settlement_signature: Option<String>,
    /// Blockhash the settlement was signed against; once it expires the
    /// settlement can no longer land
    pub settlement_blockhash: Option<String>,
    pub settlement_submitted_at: Option<DateTime<Utc>>,

    pub submitted_at: DateTime<Utc>,
    /// Set when verification concludes, pass or fail
    pub verified_at: Option<DateTime<Utc>>,
    /// Set when the transfer stage concludes, success or failure
    pub transferred_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn submitted(new: NewApproval) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: new.owner,
            delegate: new.delegate,
            network: new.network,
            claim_signature: new.claim_signature,
            grants: new.grants,
            lifecycle_state: LifecycleState::Submitted,
            verification_results: Vec::new(),
            transfer_results: Vec::new(),
            failure_reason: None,
            settlement_signature: None,
            settlement_blockhash: None,
            settlement_submitted_at: None,
            submitted_at: now,
            verified_at: None,
            transferred_at: None,
            updated_at: now,
        }
    }

    pub fn has_pending_settlement(&self) -> bool {
        self.lifecycle_state == LifecycleState::Verified && self.settlement_signature.is_some()
    }
}

/// A signed settlement attached to a record before it is broadcast. Every
/// record of one owner swept together carries the same claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementClaim {
    pub signature: String,
    pub blockhash: String,
}

/// A guarded lifecycle transition.
///
/// Applied only when the stored record is still in `from` and its attached
/// settlement signature equals `expected_settlement`.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub expected_settlement: Option<String>,
    pub verification_results: Option<Vec<GrantVerification>>,
    pub transfer_results: Option<Vec<GrantTransfer>>,
    pub failure_reason: Option<String>,
    pub settlement_signature: Option<String>,
}

impl Transition {
    fn new(from: LifecycleState, to: LifecycleState) -> Self {
        Self {
            from,
            to,
            expected_settlement: None,
            verification_results: None,
            transfer_results: None,
            failure_reason: None,
            settlement_signature: None,
        }
    }

    pub fn verified(results: Vec<GrantVerification>) -> Self {
        Self {
            verification_results: Some(results),
            ..Self::new(LifecycleState::Submitted, LifecycleState::Verified)
        }
    }

    pub fn verification_failed(results: Vec<GrantVerification>, reason: String) -> Self {
        Self {
            verification_results: Some(results),
            failure_reason: Some(reason),
            ..Self::new(LifecycleState::Submitted, LifecycleState::VerificationFailed)
        }
    }

    /// `settlement` is both the expected in-flight signature and the one
    /// recorded; `None` closes a record that had nothing to sweep. Use
    /// [`Transition::expecting`] when the guard differs.
    pub fn transferred(results: Vec<GrantTransfer>, settlement: Option<String>) -> Self {
        Self {
            expected_settlement: settlement.clone(),
            transfer_results: Some(results),
            settlement_signature: settlement,
            ..Self::new(LifecycleState::Verified, LifecycleState::Transferred)
        }
    }

    pub fn transfer_failed(
        results: Vec<GrantTransfer>,
        settlement: Option<String>,
        reason: String,
    ) -> Self {
        Self {
            expected_settlement: settlement.clone(),
            transfer_results: Some(results),
            settlement_signature: settlement,
            failure_reason: Some(reason),
            ..Self::new(LifecycleState::Verified, LifecycleState::TransferFailed)
        }
    }

    /// Override the settlement signature the record must currently carry
    pub fn expecting(mut self, settlement: Option<String>) -> Self {
        self.expected_settlement = settlement;
        self
    }

    /// Whether `record` satisfies this transition's guard
    pub fn guard_holds(&self, record: &ApprovalRecord) -> bool {
        record.lifecycle_state == self.from
            && record.settlement_signature == self.expected_settlement
    }

    /// Write this transition's effects onto an in-memory record
    pub fn apply_to(&self, record: &mut ApprovalRecord, now: DateTime<Utc>) {
        record.lifecycle_state = self.to;
        if let Some(results) = &self.verification_results {
            record.verification_results = results.clone();
        }
        if let Some(results) = &self.transfer_results {
            record.transfer_results = results.clone();
        }
        if let Some(reason) = &self.failure_reason {
            record.failure_reason = Some(reason.clone());
        }
        record.settlement_signature = self.settlement_signature.clone();
        if record.settlement_signature.is_none() {
            record.settlement_blockhash = None;
        }
        match self.to {
            LifecycleState::Verified | LifecycleState::VerificationFailed => {
                record.verified_at = Some(now)
            }
            LifecycleState::Transferred | LifecycleState::TransferFailed => {
                record.transferred_at = Some(now)
            }
            LifecycleState::Submitted => {}
        }
        record.updated_at = now;
    }
}
