use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::{group_by_network, group_by_owner, CycleReport, ReconcileStage, RecordOutcome};
use crate::approvals::models::{
    ui_amount, ApprovalRecord, GrantLine, GrantTransfer, GrantTransferStatus, LifecycleState,
};
use crate::approvals::{ApprovalStore, SettlementClaim, Transition};
use crate::error::{AppResult, GrantDefect, LedgerError, SweepError};
use crate::gateway::{
    ConfirmationStatus, LedgerGateway, NetworkProfile, NetworkRegistry, PreparedTransfer,
    TokenAccountState, TransactionStatus, TransferBatch,
};

/// Where an in-flight settlement stands after looking it up
enum PendingSettlement {
    /// Concluded on the ledger and recorded
    Settled(RecordOutcome),
    /// Not visible yet and could still land
    Waiting,
    /// Its blockhash is gone, so it can never land; the batch may be rebuilt
    Expired,
}

/// One record's share of an owner's combined batch
struct Contribution {
    record: ApprovalRecord,
    results: Vec<GrantTransfer>,
}

/// TransferExecutor - sweeps verified delegations into the destination.
///
/// All sweepable grants of one owner on one network go out as a single
/// transaction. SECURITY: the settlement is attached to every contributing
/// record through a compare-and-swap before broadcast, and the batch is only
/// sent when every claim was won, so one approval is settled at most once.
pub struct TransferExecutor {
    store: Arc<dyn ApprovalStore>,
    networks: Arc<NetworkRegistry>,
    batch_size: i64,
    max_concurrent_owners: usize,
}

impl TransferExecutor {
    pub fn new(store: Arc<dyn ApprovalStore>, networks: Arc<NetworkRegistry>) -> Self {
        Self {
            store,
            networks,
            batch_size: 100,
            max_concurrent_owners: 1,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_concurrent_owners(mut self, owners: usize) -> Self {
        self.max_concurrent_owners = owners.max(1);
        self
    }

    async fn sweep_owner(&self, records: Vec<ApprovalRecord>) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for group in group_by_network(records) {
            let Some(first) = group.first() else {
                continue;
            };
            let (owner, network) = (first.owner.clone(), first.network.clone());
            outcomes.extend(self.sweep_network(&owner, &network, group).await);
        }
        outcomes
    }

    #[instrument(
        skip_all,
        fields(owner = %owner, network = %network, records = records.len())
    )]
    async fn sweep_network(
        &self,
        owner: &str,
        network: &str,
        records: Vec<ApprovalRecord>,
    ) -> Vec<RecordOutcome> {
        let identity = self.networks.resolve(network).and_then(|profile| {
            let (signer, destination) = profile.transfer_identity()?;
            Ok((profile, signer, destination))
        });
        let (profile, signer, destination) = match identity {
            Ok(identity) => identity,
            Err(e) => {
                warn!("⚠️ Skipping sweep: {}", e);
                return vec![RecordOutcome::Skipped; records.len()];
            }
        };

        let mut outcomes = Vec::with_capacity(records.len());
        let mut candidates = Vec::with_capacity(records.len());

        for record in records {
            if record.delegate != signer {
                warn!(
                    approval_id = %record.id,
                    "⚠️ Skipping sweep: loaded delegate {} is not the record's delegate {}",
                    signer, record.delegate
                );
                outcomes.push(RecordOutcome::Skipped);
                continue;
            }

            match self.resume(&record, profile).await {
                Ok(None) => candidates.push(record),
                Ok(Some(outcome)) => outcomes.push(outcome),
                Err(e) => outcomes.push(self.absorb(&record, &e).await),
            }
        }

        if candidates.is_empty() {
            return outcomes;
        }

        // Re-read every candidate before touching the store, so a destination
        // the gateway rejects leaves the whole partition untouched
        let gateway = profile.gateway.as_ref();
        let total = candidates.len();
        let mut swept = HashSet::new();
        let mut built = Vec::with_capacity(total);

        for record in candidates {
            let result = build_batch(gateway, &record, &signer, &destination, &swept).await;
            match &result {
                Err(SweepError::Configuration(reason)) => {
                    warn!("⚠️ Skipping sweep: {}", reason);
                    outcomes.extend(std::iter::repeat(RecordOutcome::Skipped).take(total));
                    return outcomes;
                }
                Ok((batch, _)) => {
                    swept.extend(batch.transfers.iter().map(|t| t.source.clone()));
                }
                Err(_) => {}
            }
            built.push((record, result));
        }

        let mut combined = TransferBatch::new(signer.as_str());
        let mut contributions = Vec::new();

        for (record, result) in built {
            match result {
                Ok((batch, results)) if batch.is_empty() => {
                    info!(
                        approval_id = %record.id,
                        "Nothing sweepable, closing claim without a transaction"
                    );
                    let transition = Transition::transferred(results, None)
                        .expecting(record.settlement_signature.clone());
                    outcomes.push(
                        self.conclude_logged(&record, transition, RecordOutcome::Advanced)
                            .await,
                    );
                }
                Ok((batch, results)) => {
                    combined.transfers.extend(batch.transfers);
                    contributions.push(Contribution { record, results });
                }
                Err(e) => outcomes.push(self.absorb(&record, &e).await),
            }
        }

        if !contributions.is_empty() {
            outcomes.extend(self.settle_batch(profile, combined, contributions).await);
        }

        outcomes
    }

    /// Prepare, claim, broadcast and confirm one combined batch
    async fn settle_batch(
        &self,
        profile: &NetworkProfile,
        batch: TransferBatch,
        contributions: Vec<Contribution>,
    ) -> Vec<RecordOutcome> {
        let gateway = profile.gateway.as_ref();

        let prepared = match gateway.prepare_transfer(batch).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let error = SweepError::from_ledger(e, "preparing sweep");
                let mut outcomes = Vec::with_capacity(contributions.len());
                for contribution in &contributions {
                    outcomes.push(self.absorb(&contribution.record, &error).await);
                }
                return outcomes;
            }
        };

        let (claimed, mut outcomes) = self.claim_all(&prepared, contributions).await;
        if claimed.is_empty() {
            return outcomes;
        }
        if !outcomes.is_empty() {
            warn!(
                "Sweep {} only partly claimed, holding it back until its blockhash expires",
                prepared.signature
            );
            outcomes.extend(claimed.iter().map(|_| RecordOutcome::Deferred));
            return outcomes;
        }

        let signature = prepared.signature.clone();
        info!(
            "📤 Sending sweep {} ({} transfers for {} records, {} base units)",
            signature,
            prepared.batch.transfers.len(),
            claimed.len(),
            prepared.batch.total_amount()
        );

        match gateway.send_prepared(&prepared).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!("Sweep {} outcome unknown, will check next cycle: {}", signature, e);
                return vec![RecordOutcome::Deferred; claimed.len()];
            }
            Err(e) => {
                let reason = format!("sweep submission rejected: {}", e);
                return self
                    .conclude_each(&claimed, RecordOutcome::Failed, |results| {
                        Transition::transfer_failed(
                            settle(results, GrantTransferStatus::Failed, Some(&reason)),
                            Some(signature.clone()),
                            reason.clone(),
                        )
                    })
                    .await;
            }
        }

        match gateway
            .await_confirmation(&signature, profile.confirmation_timeout)
            .await
        {
            Ok(ConfirmationStatus::Confirmed) => {
                info!("✅ Sweep {} confirmed", signature);
                self.conclude_each(&claimed, RecordOutcome::Advanced, |results| {
                    Transition::transferred(
                        settle(results, GrantTransferStatus::Transferred, None),
                        Some(signature.clone()),
                    )
                })
                .await
            }
            Ok(ConfirmationStatus::Failed(detail)) => {
                let reason = format!("sweep {} failed on ledger: {}", signature, detail);
                self.conclude_each(&claimed, RecordOutcome::Failed, |results| {
                    Transition::transfer_failed(
                        settle(results, GrantTransferStatus::Failed, Some(&reason)),
                        Some(signature.clone()),
                        reason.clone(),
                    )
                })
                .await
            }
            Ok(ConfirmationStatus::TimedOut) => {
                warn!("⏳ Sweep {} not confirmed in time, will check next cycle", signature);
                vec![RecordOutcome::Deferred; claimed.len()]
            }
            Err(e) => {
                warn!("Confirmation of {} interrupted: {}", signature, e);
                vec![RecordOutcome::Deferred; claimed.len()]
            }
        }
    }

    /// Attach the prepared settlement to each contributing record in order.
    ///
    /// Stops at the first claim that is not won. Returns the claimed records
    /// plus the outcomes of those that were not claimed.
    async fn claim_all(
        &self,
        prepared: &PreparedTransfer,
        contributions: Vec<Contribution>,
    ) -> (Vec<Contribution>, Vec<RecordOutcome>) {
        let claim = SettlementClaim {
            signature: prepared.signature.clone(),
            blockhash: prepared.recent_blockhash.clone(),
        };
        let mut claimed = Vec::with_capacity(contributions.len());
        let mut unclaimed = Vec::new();

        for contribution in contributions {
            if !unclaimed.is_empty() {
                unclaimed.push(RecordOutcome::Deferred);
                continue;
            }

            let record = &contribution.record;
            let won = self
                .store
                .claim_settlement(
                    record.id,
                    record.settlement_signature.as_deref(),
                    &claim,
                    &contribution.results,
                )
                .await;

            match won {
                Ok(true) => claimed.push(contribution),
                Ok(false) => {
                    debug!(approval_id = %record.id, "Another worker claimed this settlement");
                    unclaimed.push(RecordOutcome::LostRace);
                }
                Err(e) => {
                    error!(approval_id = %record.id, "❌ Store unavailable during claim: {:?}", e);
                    unclaimed.push(RecordOutcome::Deferred);
                }
            }
        }

        (claimed, unclaimed)
    }

    /// Resolve a settlement attached by an earlier cycle. `None` means the
    /// record is free to join a new batch.
    #[instrument(skip_all, fields(approval_id = %record.id))]
    async fn resume(
        &self,
        record: &ApprovalRecord,
        profile: &NetworkProfile,
    ) -> Result<Option<RecordOutcome>, SweepError> {
        let Some(pending) = &record.settlement_signature else {
            return Ok(None);
        };

        match self.check_pending(record, profile, pending).await? {
            PendingSettlement::Settled(outcome) => Ok(Some(outcome)),
            PendingSettlement::Waiting => Ok(Some(RecordOutcome::Deferred)),
            PendingSettlement::Expired => {
                warn!("Settlement {} never landed, rebuilding the batch", pending);
                Ok(None)
            }
        }
    }

    async fn check_pending(
        &self,
        record: &ApprovalRecord,
        profile: &NetworkProfile,
        signature: &str,
    ) -> Result<PendingSettlement, SweepError> {
        let lookup = profile
            .gateway
            .get_transaction(signature)
            .await
            .map_err(|e| SweepError::from_ledger(e, "looking up pending sweep"))?;

        match lookup.map(|tx| tx.status) {
            Some(TransactionStatus::Succeeded) => {
                info!("✅ Pending sweep {} landed", signature);
                let transition = Transition::transferred(
                    settle(
                        &record.transfer_results,
                        GrantTransferStatus::Transferred,
                        None,
                    ),
                    Some(signature.to_string()),
                );
                let outcome = self
                    .conclude(record, transition, RecordOutcome::Advanced)
                    .await?;
                Ok(PendingSettlement::Settled(outcome))
            }
            Some(TransactionStatus::Failed(detail)) => {
                let reason = format!("sweep {} failed on ledger: {}", signature, detail);
                let transition = Transition::transfer_failed(
                    settle(
                        &record.transfer_results,
                        GrantTransferStatus::Failed,
                        Some(&reason),
                    ),
                    Some(signature.to_string()),
                    reason,
                );
                let outcome = self
                    .conclude(record, transition, RecordOutcome::Failed)
                    .await?;
                Ok(PendingSettlement::Settled(outcome))
            }
            None if self.settlement_expired(record, profile).await? => {
                Ok(PendingSettlement::Expired)
            }
            None => {
                debug!("Sweep {} not visible yet", signature);
                Ok(PendingSettlement::Waiting)
            }
        }
    }

    /// An unseen settlement is only given up once it is older than the
    /// network's pending expiry and the ledger no longer accepts its blockhash
    async fn settlement_expired(
        &self,
        record: &ApprovalRecord,
        profile: &NetworkProfile,
    ) -> Result<bool, SweepError> {
        let aged = match record.settlement_submitted_at {
            Some(submitted) => (Utc::now() - submitted)
                .to_std()
                .map(|age| age >= profile.pending_expiry)
                .unwrap_or(false),
            None => true,
        };
        if !aged {
            return Ok(false);
        }

        let Some(blockhash) = record.settlement_blockhash.as_deref() else {
            return Ok(true);
        };

        match profile.gateway.is_blockhash_valid(blockhash).await {
            Ok(true) => {
                debug!("Blockhash {} still valid, settlement may land", blockhash);
                Ok(false)
            }
            Ok(false) => Ok(true),
            Err(e) if e.is_transient() => Err(SweepError::TransientLedger(e)),
            Err(e) => {
                warn!("Blockhash {} unusable, treating it as expired: {}", blockhash, e);
                Ok(true)
            }
        }
    }

    async fn conclude(
        &self,
        record: &ApprovalRecord,
        transition: Transition,
        applied: RecordOutcome,
    ) -> Result<RecordOutcome, SweepError> {
        if self.store.transition(record.id, &transition).await? {
            Ok(applied)
        } else {
            debug!(approval_id = %record.id, "Claim already concluded by another worker");
            Ok(RecordOutcome::LostRace)
        }
    }

    async fn conclude_logged(
        &self,
        record: &ApprovalRecord,
        transition: Transition,
        applied: RecordOutcome,
    ) -> RecordOutcome {
        match self.conclude(record, transition, applied).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(approval_id = %record.id, "❌ Failed to record sweep outcome: {}", e);
                RecordOutcome::Deferred
            }
        }
    }

    async fn conclude_each(
        &self,
        claimed: &[Contribution],
        applied: RecordOutcome,
        transition: impl Fn(&[GrantTransfer]) -> Transition,
    ) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::with_capacity(claimed.len());
        for contribution in claimed {
            let transition = transition(&contribution.results);
            outcomes.push(
                self.conclude_logged(&contribution.record, transition, applied)
                    .await,
            );
        }
        outcomes
    }

    /// Map an error that stopped one record's sweep to its outcome
    async fn absorb(&self, record: &ApprovalRecord, error: &SweepError) -> RecordOutcome {
        match error {
            SweepError::Configuration(reason) => {
                warn!(approval_id = %record.id, "⚠️ Skipping sweep: {}", reason);
                RecordOutcome::Skipped
            }
            SweepError::TransientLedger(e) => {
                warn!(approval_id = %record.id, "Ledger unavailable, retrying next cycle: {}", e);
                RecordOutcome::Deferred
            }
            SweepError::Store(e) => {
                error!(approval_id = %record.id, "❌ Store unavailable during sweep: {:?}", e);
                RecordOutcome::Deferred
            }
            other => {
                error!(approval_id = %record.id, "❌ Sweep failed: {}", other);
                self.abandon(record, other.to_string()).await
            }
        }
    }

    /// Record a sweep that cannot proceed as `TransferFailed`
    async fn abandon(&self, record: &ApprovalRecord, reason: String) -> RecordOutcome {
        let transition = Transition::transfer_failed(
            settle(
                &record.transfer_results,
                GrantTransferStatus::Failed,
                Some(&reason),
            ),
            None,
            reason,
        )
        .expecting(record.settlement_signature.clone());

        self.conclude_logged(record, transition, RecordOutcome::Failed)
            .await
    }
}

/// Re-read every grant of one record and assemble its part of the batch
/// from live ledger state.
///
/// Grants that can no longer be swept are kept in the results as `Skipped`
/// with a reason; the rest are `Pending` and sized to what the delegate can
/// move right now. Accounts in `swept` already belong to another record of
/// the same batch.
async fn build_batch(
    gateway: &dyn LedgerGateway,
    record: &ApprovalRecord,
    signer: &str,
    destination: &str,
    swept: &HashSet<String>,
) -> Result<(TransferBatch, Vec<GrantTransfer>), SweepError> {
    let mut batch = TransferBatch::new(signer);
    let mut results = Vec::with_capacity(record.grants.len());
    let mut seen = HashSet::new();

    for grant in &record.grants {
        if swept.contains(&grant.token_account) || !seen.insert(grant.token_account.as_str()) {
            let defect = GrantDefect::DuplicateGrant {
                account: grant.token_account.clone(),
            };
            results.push(GrantTransfer::skipped(grant, defect.to_string()));
            continue;
        }

        let state = match gateway.get_token_account_state(&grant.token_account).await {
            Ok(state) => state,
            Err(e) if e.is_transient() => return Err(SweepError::TransientLedger(e)),
            Err(e) => {
                results.push(skip_unreadable(grant, e));
                continue;
            }
        };

        if let Some(defect) = transfer_defect(grant, signer, &state) {
            info!("Skipping {}: {}", grant.token_account, defect);
            results.push(GrantTransfer::skipped(grant, defect.to_string()));
            continue;
        }

        let receiving = match gateway.find_receiving_account(destination, &state.mint).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                let defect = GrantDefect::NoReceivingAccount {
                    mint: state.mint.clone(),
                };
                warn!("Skipping {}: {}", grant.token_account, defect);
                results.push(GrantTransfer::skipped(grant, defect.to_string()));
                continue;
            }
            Err(LedgerError::InvalidAddress(address)) => {
                return Err(SweepError::Configuration(format!(
                    "cannot derive receiving account at destination {}: invalid address {}",
                    destination, address
                )))
            }
            Err(e) if e.is_transient() => return Err(SweepError::TransientLedger(e)),
            Err(e) => {
                results.push(skip_unreadable(grant, e));
                continue;
            }
        };

        let amount = state.sweepable();
        debug!(
            "Sweeping {} from {} into {}",
            ui_amount(amount, state.decimals),
            grant.token_account,
            receiving
        );

        batch.push_transfer(
            &grant.token_account,
            &receiving,
            &state.mint,
            amount,
            state.decimals,
        );
        results.push(GrantTransfer {
            token_account: grant.token_account.clone(),
            mint: state.mint.clone(),
            destination_account: Some(receiving),
            amount,
            status: GrantTransferStatus::Pending,
            reason: None,
        });
    }

    Ok((batch, results))
}

fn skip_unreadable(grant: &GrantLine, error: LedgerError) -> GrantTransfer {
    let defect = GrantDefect::Ledger {
        account: grant.token_account.clone(),
        error,
    };
    warn!("Skipping {}: {}", grant.token_account, defect);
    GrantTransfer::skipped(grant, defect.to_string())
}

/// Why a grant that passed verification can no longer be swept
pub fn transfer_defect(
    grant: &GrantLine,
    signer: &str,
    state: &TokenAccountState,
) -> Option<GrantDefect> {
    let account = grant.token_account.clone();

    match state.delegate.as_deref() {
        None => {
            return Some(GrantDefect::NoDelegate {
                account,
                expected: signer.to_string(),
            })
        }
        Some(found) if found != signer => {
            return Some(GrantDefect::DelegateMismatch {
                account,
                expected: signer.to_string(),
                found: found.to_string(),
            })
        }
        Some(_) => {}
    }

    if state.mint != grant.mint {
        Some(GrantDefect::MintMismatch {
            account,
            claimed: grant.mint.clone(),
            found: state.mint.clone(),
        })
    } else if state.delegated_amount == 0 {
        Some(GrantDefect::ZeroAllowance { account })
    } else if state.balance == 0 {
        Some(GrantDefect::ZeroBalance { account })
    } else {
        None
    }
}

/// Move every included grant out of `Pending`
fn settle(
    results: &[GrantTransfer],
    status: GrantTransferStatus,
    reason: Option<&str>,
) -> Vec<GrantTransfer> {
    results
        .iter()
        .map(|result| {
            if result.status != GrantTransferStatus::Pending {
                return result.clone();
            }
            GrantTransfer {
                status,
                reason: reason.map(str::to_string),
                ..result.clone()
            }
        })
        .collect()
}

#[async_trait]
impl ReconcileStage for TransferExecutor {
    fn name(&self) -> &'static str {
        "transfer"
    }

    async fn run_cycle(&self) -> AppResult<CycleReport> {
        let records = self
            .store
            .list_by_state(LifecycleState::Verified, self.batch_size)
            .await?;

        if records.is_empty() {
            return Ok(CycleReport::default());
        }

        let outcomes: Vec<Vec<RecordOutcome>> = stream::iter(group_by_owner(records))
            .map(|group| self.sweep_owner(group))
            .buffer_unordered(self.max_concurrent_owners)
            .collect()
            .await;

        Ok(CycleReport::from_outcomes(outcomes.into_iter().flatten()))
    }
}
