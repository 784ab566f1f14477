use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::{group_by_owner, CycleReport, ReconcileStage, RecordOutcome};
use crate::approvals::models::{ApprovalRecord, GrantLine, GrantVerification, LifecycleState};
use crate::approvals::{ApprovalStore, Transition};
use crate::error::{AppResult, ClaimDefect, GrantDefect, LedgerError, SweepError};
use crate::gateway::{LedgerGateway, NetworkRegistry, TokenAccountState, TransactionStatus};

/// Conclusion reached for one submitted claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Verified(Vec<GrantVerification>),
    Rejected {
        results: Vec<GrantVerification>,
        defect: ClaimDefect,
    },
}

impl Verdict {
    fn into_transition(self) -> Transition {
        match self {
            Verdict::Verified(results) => Transition::verified(results),
            Verdict::Rejected { results, defect } => {
                Transition::verification_failed(results, defect.to_string())
            }
        }
    }
}

/// ApprovalVerifier - checks submitted claims against live ledger state.
///
/// Moves `Submitted` records to `Verified` or `VerificationFailed`. Never
/// signs or broadcasts anything.
pub struct ApprovalVerifier {
    store: Arc<dyn ApprovalStore>,
    networks: Arc<NetworkRegistry>,
    batch_size: i64,
    max_concurrent_owners: usize,
}

impl ApprovalVerifier {
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

    #[instrument(
        skip(self, record),
        fields(approval_id = %record.id, owner = %record.owner, network = %record.network)
    )]
    async fn process(&self, record: ApprovalRecord) -> RecordOutcome {
        let verdict = match self.evaluate(&record).await {
            Ok(verdict) => verdict,
            Err(SweepError::Configuration(reason)) => {
                warn!("⚠️ Skipping claim: {}", reason);
                return RecordOutcome::Skipped;
            }
            Err(SweepError::TransientLedger(e)) => {
                warn!("Ledger unavailable, retrying next cycle: {}", e);
                return RecordOutcome::Deferred;
            }
            Err(e) => {
                error!("❌ Verification aborted: {:?}", e);
                return RecordOutcome::Deferred;
            }
        };

        let passed = matches!(verdict, Verdict::Verified(_));
        match self.store.transition(record.id, &verdict.into_transition()).await {
            Ok(true) if passed => {
                info!("✅ Claim verified");
                RecordOutcome::Advanced
            }
            Ok(true) => {
                info!("Claim failed verification");
                RecordOutcome::Failed
            }
            Ok(false) => {
                debug!("Claim already concluded by another worker");
                RecordOutcome::LostRace
            }
            Err(e) => {
                error!("❌ Failed to record verification outcome: {:?}", e);
                RecordOutcome::Deferred
            }
        }
    }

    /// Decide a claim from the ledger's current view.
    ///
    /// Pure with respect to the store; an `Err` means no decision could be
    /// reached and the record must stay `Submitted`.
    pub async fn evaluate(&self, record: &ApprovalRecord) -> Result<Verdict, SweepError> {
        let profile = self.networks.resolve(&record.network)?;
        let gateway = profile.gateway.as_ref();

        match self.check_claim_transaction(gateway, record).await {
            Ok(()) => {}
            Err(SweepError::ClaimInvalid(defect)) => {
                return Ok(Verdict::Rejected {
                    results: Vec::new(),
                    defect,
                })
            }
            Err(e) => return Err(e),
        }

        let mut results = Vec::with_capacity(record.grants.len());
        for grant in &record.grants {
            results.push(verify_grant(gateway, &record.delegate, grant).await?);
        }

        let failures: Vec<&str> = results
            .iter()
            .filter(|r| !r.passed)
            .filter_map(|r| r.reason.as_deref())
            .collect();

        if failures.is_empty() {
            return Ok(Verdict::Verified(results));
        }

        let defect = ClaimDefect::GrantsRejected {
            failed: failures.len(),
            total: results.len(),
            details: failures.join("; "),
        };
        Ok(Verdict::Rejected { results, defect })
    }

    /// `Ok` only when the claim transaction landed successfully; a claim the
    /// ledger disowns comes back as `SweepError::ClaimInvalid`
    async fn check_claim_transaction(
        &self,
        gateway: &dyn LedgerGateway,
        record: &ApprovalRecord,
    ) -> Result<(), SweepError> {
        let defect = match gateway.get_transaction(&record.claim_signature).await {
            Ok(Some(tx)) => match tx.status {
                TransactionStatus::Succeeded => return Ok(()),
                TransactionStatus::Failed(detail) => ClaimDefect::TransactionFailed(detail),
            },
            Ok(None) | Err(LedgerError::NotFound(_)) => ClaimDefect::TransactionNotFound,
            Err(LedgerError::InvalidAddress(signature)) => {
                ClaimDefect::MalformedSignature(signature)
            }
            Err(e) if e.is_transient() => return Err(SweepError::TransientLedger(e)),
            Err(e) => ClaimDefect::TransactionFailed(e.to_string()),
        };

        Err(defect.into())
    }
}

async fn verify_grant(
    gateway: &dyn LedgerGateway,
    expected_delegate: &str,
    grant: &GrantLine,
) -> Result<GrantVerification, SweepError> {
    match gateway.get_token_account_state(&grant.token_account).await {
        Ok(state) => Ok(check_grant(grant, expected_delegate, &state)),
        Err(e) if e.is_transient() => Err(SweepError::TransientLedger(e)),
        Err(e) => {
            let defect = GrantDefect::Ledger {
                account: grant.token_account.clone(),
                error: e,
            };
            Ok(GrantVerification {
                token_account: grant.token_account.clone(),
                passed: false,
                observed_delegate: None,
                delegated_amount: 0,
                balance: 0,
                reason: Some(defect.to_string()),
            })
        }
    }
}

/// A grant passes when the account delegates to `expected_delegate` with a
/// non-zero allowance.
pub fn check_grant(
    grant: &GrantLine,
    expected_delegate: &str,
    state: &TokenAccountState,
) -> GrantVerification {
    let account = grant.token_account.clone();
    let defect = match state.delegate.as_deref() {
        None => Some(GrantDefect::NoDelegate {
            account: account.clone(),
            expected: expected_delegate.to_string(),
        }),
        Some(found) if found != expected_delegate => Some(GrantDefect::DelegateMismatch {
            account: account.clone(),
            expected: expected_delegate.to_string(),
            found: found.to_string(),
        }),
        Some(_) if state.delegated_amount == 0 => Some(GrantDefect::ZeroAllowance {
            account: account.clone(),
        }),
        Some(_) => None,
    };

    GrantVerification {
        token_account: account,
        passed: defect.is_none(),
        observed_delegate: state.delegate.clone(),
        delegated_amount: state.delegated_amount,
        balance: state.balance,
        reason: defect.map(|d| d.to_string()),
    }
}

#[async_trait]
impl ReconcileStage for ApprovalVerifier {
    fn name(&self) -> &'static str {
        "verification"
    }

    async fn run_cycle(&self) -> AppResult<CycleReport> {
        let records = self
            .store
            .list_by_state(LifecycleState::Submitted, self.batch_size)
            .await?;

        if records.is_empty() {
            return Ok(CycleReport::default());
        }

        let outcomes: Vec<Vec<RecordOutcome>> = stream::iter(group_by_owner(records))
            .map(|group| async move {
                let mut outcomes = Vec::with_capacity(group.len());
                for record in group {
                    outcomes.push(self.process(record).await);
                }
                outcomes
            })
            .buffer_unordered(self.max_concurrent_owners)
            .collect()
            .await;

        Ok(CycleReport::from_outcomes(outcomes.into_iter().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::models::NewApproval;
    use crate::gateway::{LedgerTransaction, NetworkProfile};
    use crate::testing::*;

    struct Harness {
        store: Arc<MemoryApprovalStore>,
        gateway: Arc<MockGateway>,
        verifier: ApprovalVerifier,
    }

    fn harness(gateway: MockGateway) -> Harness {
        let store = Arc::new(MemoryApprovalStore::new());
        let gateway = Arc::new(gateway);
        let mut registry = NetworkRegistry::new();
        registry.register(NetworkProfile::new(NETWORK, gateway.clone()));
        let verifier = ApprovalVerifier::new(store.clone(), Arc::new(registry));
        Harness {
            store,
            gateway,
            verifier,
        }
    }

    #[tokio::test]
    async fn test_all_grants_valid_verifies() {
        let h = harness(
            MockGateway::new()
                .with_transaction(succeeded("CLAIM"))
                .with_account("A", delegated(DELEGATE, 500, 300))
                .with_account("B", delegated(DELEGATE, 10, 10)),
        );
        let record = h
            .store
            .insert(new_approval("CLAIM", vec![grant("A"), grant("B")]))
            .await
            .unwrap();

        let report = h.verifier.run_cycle().await.unwrap();
        assert_eq!(report.advanced, 1);

        let stored = h.store.record(record.id).await;
        assert_eq!(stored.lifecycle_state, LifecycleState::Verified);
        assert!(stored.verified_at.is_some());
        assert!(stored.failure_reason.is_none());
        assert_eq!(stored.verification_results.len(), 2);
        assert!(stored.verification_results.iter().all(|r| r.passed));
        assert_eq!(stored.verification_results[0].delegated_amount, 500);
    }

    #[tokio::test]
    async fn test_delegate_mismatch_fails_whole_claim() {
        let h = harness(
            MockGateway::new()
                .with_transaction(succeeded("CLAIM"))
                .with_account("A", delegated("SOMEONE_ELSE", 500, 300))
                .with_account("B", delegated(DELEGATE, 10, 10)),
        );
        let record = h
            .store
            .insert(new_approval("CLAIM", vec![grant("A"), grant("B")]))
            .await
            .unwrap();

        let report = h.verifier.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = h.store.record(record.id).await;
        assert_eq!(stored.lifecycle_state, LifecycleState::VerificationFailed);
        let reason = stored.failure_reason.unwrap();
        assert!(reason.contains("A"));
        assert!(reason.contains("delegate mismatch"));
        assert!(!stored.verification_results[0].passed);
        assert!(stored.verification_results[1].passed);
    }

    #[tokio::test]
    async fn test_zero_allowance_fails() {
        let h = harness(
            MockGateway::new()
                .with_transaction(succeeded("CLAIM"))
                .with_account("A", delegated(DELEGATE, 0, 300)),
        );
        let record = h
            .store
            .insert(new_approval("CLAIM", vec![grant("A")]))
            .await
            .unwrap();

        h.verifier.run_cycle().await.unwrap();

        let stored = h.store.record(record.id).await;
        assert_eq!(stored.lifecycle_state, LifecycleState::VerificationFailed);
        assert!(stored.failure_reason.unwrap().contains("allowance is zero"));
    }

    #[tokio::test]
    async fn test_missing_claim_transaction_fails() {
        let h = harness(MockGateway::new().with_account("A", delegated(DELEGATE, 5, 5)));
        let record = h
            .store
            .insert(new_approval("NEVER_LANDED", vec![grant("A")]))
            .await
            .unwrap();

        h.verifier.run_cycle().await.unwrap();

        let stored = h.store.record(record.id).await;
        assert_eq!(stored.lifecycle_state, LifecycleState::VerificationFailed);
        assert_eq!(stored.failure_reason.as_deref(), Some("claim transaction not found"));
    }

    #[tokio::test]
    async fn test_failed_claim_transaction_fails() {
        let h = harness(MockGateway::new().with_transaction(LedgerTransaction {
            signature: "CLAIM".into(),
            status: TransactionStatus::Failed("InstructionError(0)".into()),
        }));
        let record = h
            .store
            .insert(new_approval("CLAIM", vec![grant("A")]))
            .await
            .unwrap();

        h.verifier.run_cycle().await.unwrap();

        let stored = h.store.record(record.id).await;
        assert_eq!(stored.lifecycle_state, LifecycleState::VerificationFailed);
        assert!(stored.failure_reason.unwrap().contains("InstructionError"));
    }

    #[tokio::test]
    async fn test_malformed_signature_fails() {
        let h = harness(MockGateway::new());
        h.gateway
            .set_transaction_error("not-a-sig", LedgerError::InvalidAddress("not-a-sig".into()));
        let record = h
            .store
            .insert(new_approval("not-a-sig", vec![grant("A")]))
            .await
            .unwrap();

        h.verifier.run_cycle().await.unwrap();

        let stored = h.store.record(record.id).await;
        assert_eq!(stored.lifecycle_state, LifecycleState::VerificationFailed);
        assert!(stored.failure_reason.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_transient_error_leaves_record_untouched() {
        let h = harness(
            MockGateway::new()
                .with_transaction(succeeded("CLAIM-1"))
                .with_transaction(succeeded("CLAIM-2"))
                .with_account("B", delegated(DELEGATE, 10, 10)),
        );
        h.gateway
            .set_account_error("A", LedgerError::Network("connection reset".into()));

        let flaky = h
            .store
            .insert(new_approval("CLAIM-1", vec![grant("A")]))
            .await
            .unwrap();
        let healthy = h
            .store
            .insert(NewApproval {
                owner: "OTHER_OWNER".into(),
                ..new_approval("CLAIM-2", vec![grant("B")])
            })
            .await
            .unwrap();

        let report = h.verifier.run_cycle().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.advanced, 1);

        let stored = h.store.record(flaky.id).await;
        assert_eq!(stored.lifecycle_state, LifecycleState::Submitted);
        assert!(stored.verification_results.is_empty());
        assert!(stored.verified_at.is_none());

        assert_eq!(
            h.store.record(healthy.id).await.lifecycle_state,
            LifecycleState::Verified
        );

        // Ledger recovers: the same record verifies on the next cycle
        h.gateway.set_account("A", delegated(DELEGATE, 1, 1));
        h.verifier.run_cycle().await.unwrap();
        assert_eq!(
            h.store.record(flaky.id).await.lifecycle_state,
            LifecycleState::Verified
        );
    }

    #[tokio::test]
    async fn test_unreadable_account_is_a_grant_failure() {
        let h = harness(MockGateway::new().with_transaction(succeeded("CLAIM")));
        let record = h
            .store
            .insert(new_approval("CLAIM", vec![grant("GONE")]))
            .await
            .unwrap();

        h.verifier.run_cycle().await.unwrap();

        let stored = h.store.record(record.id).await;
        assert_eq!(stored.lifecycle_state, LifecycleState::VerificationFailed);
        assert!(stored.failure_reason.unwrap().contains("GONE"));
    }

    #[tokio::test]
    async fn test_unknown_network_is_skipped() {
        let h = harness(MockGateway::new().with_transaction(succeeded("CLAIM")));
        let record = h
            .store
            .insert(NewApproval {
                network: "testnet".into(),
                ..new_approval("CLAIM", vec![grant("A")])
            })
            .await
            .unwrap();

        let report = h.verifier.run_cycle().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(
            h.store.record(record.id).await.lifecycle_state,
            LifecycleState::Submitted
        );
    }

    #[tokio::test]
    async fn test_concurrent_verifiers_transition_once() {
        let h = harness(
            MockGateway::new()
                .with_transaction(succeeded("CLAIM"))
                .with_account("A", delegated(DELEGATE, 5, 5)),
        );
        let mut registry = NetworkRegistry::new();
        registry.register(NetworkProfile::new(NETWORK, h.gateway.clone()));
        let rival = ApprovalVerifier::new(h.store.clone(), Arc::new(registry));

        h.store
            .insert(new_approval("CLAIM", vec![grant("A")]))
            .await
            .unwrap();

        let (a, b) = tokio::join!(h.verifier.run_cycle(), rival.run_cycle());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.advanced + b.advanced, 1);
        assert_eq!(h.store.applied_mutations(), 1);
    }

    #[tokio::test]
    async fn test_second_cycle_is_a_no_op() {
        let h = harness(
            MockGateway::new()
                .with_transaction(succeeded("CLAIM"))
                .with_account("A", delegated(DELEGATE, 5, 5)),
        );
        h.store
            .insert(new_approval("CLAIM", vec![grant("A")]))
            .await
            .unwrap();

        h.verifier.run_cycle().await.unwrap();
        let second = h.verifier.run_cycle().await.unwrap();

        assert_eq!(second, CycleReport::default());
        assert_eq!(h.store.applied_mutations(), 1);
    }

    #[tokio::test]
    async fn test_same_snapshot_same_verdict() {
        let h = harness(
            MockGateway::new()
                .with_transaction(succeeded("CLAIM"))
                .with_account("A", delegated(DELEGATE, 5, 5))
                .with_account("B", delegated("OTHER", 5, 5)),
        );
        let record = h
            .store
            .insert(new_approval("CLAIM", vec![grant("A"), grant("B")]))
            .await
            .unwrap();

        let first = h.verifier.evaluate(&record).await.unwrap();
        let second = h.verifier.evaluate(&record).await.unwrap();
        assert_eq!(first, second);
        assert!(matches!(first, Verdict::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_claim_lookup_reports_typed_defects() {
        let h = harness(MockGateway::new().with_transaction(succeeded("CLAIM")));
        let gateway = h.gateway.as_ref();
        h.gateway
            .set_transaction_error("BAD", LedgerError::InvalidAddress("BAD".into()));
        h.gateway
            .set_transaction_error("FLAKY", LedgerError::Timeout("rpc".into()));

        let landed = ApprovalRecord::submitted(new_approval("CLAIM", vec![grant("A")]));
        assert!(h.verifier.check_claim_transaction(gateway, &landed).await.is_ok());

        let missing = ApprovalRecord::submitted(new_approval("MISSING", vec![grant("A")]));
        assert!(matches!(
            h.verifier.check_claim_transaction(gateway, &missing).await,
            Err(SweepError::ClaimInvalid(ClaimDefect::TransactionNotFound))
        ));

        let malformed = ApprovalRecord::submitted(new_approval("BAD", vec![grant("A")]));
        assert!(matches!(
            h.verifier.check_claim_transaction(gateway, &malformed).await,
            Err(SweepError::ClaimInvalid(ClaimDefect::MalformedSignature(_)))
        ));

        let flaky = ApprovalRecord::submitted(new_approval("FLAKY", vec![grant("A")]));
        assert!(matches!(
            h.verifier.check_claim_transaction(gateway, &flaky).await,
            Err(SweepError::TransientLedger(_))
        ));
    }

    #[test]
    fn test_check_grant_no_delegate() {
        let state = TokenAccountState {
            delegate: None,
            ..delegated(DELEGATE, 0, 10)
        };
        let result = check_grant(&grant("A"), DELEGATE, &state);
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("no delegate"));
    }
}
