// Test doubles shared by the settlement tests
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::approvals::models::*;
use crate::approvals::repository::ApprovalStore;
use crate::error::{AppResult, LedgerError};
use crate::gateway::{
    ConfirmationStatus, LedgerGateway, LedgerResult, LedgerTransaction, PreparedTransfer,
    TokenAccountState, TransactionStatus, TransferBatch,
};

pub const OWNER: &str = "OWNER";
pub const DELEGATE: &str = "DELEGATE";
pub const DESTINATION: &str = "DESTINATION";
pub const MINT: &str = "MINT";
pub const NETWORK: &str = "devnet";

pub fn grant(token_account: &str) -> GrantLine {
    GrantLine {
        token_account: token_account.to_string(),
        mint: MINT.to_string(),
        claimed_amount: "1000".to_string(),
        decimals: 6,
    }
}

pub fn new_approval(claim_signature: &str, grants: Vec<GrantLine>) -> NewApproval {
    NewApproval {
        owner: OWNER.to_string(),
        delegate: DELEGATE.to_string(),
        network: NETWORK.to_string(),
        claim_signature: claim_signature.to_string(),
        grants,
    }
}

pub fn delegated(delegate: &str, delegated_amount: u64, balance: u64) -> TokenAccountState {
    TokenAccountState {
        mint: MINT.to_string(),
        decimals: 6,
        delegate: Some(delegate.to_string()),
        delegated_amount,
        balance,
    }
}

pub fn succeeded(signature: &str) -> LedgerTransaction {
    LedgerTransaction {
        signature: signature.to_string(),
        status: TransactionStatus::Succeeded,
    }
}

// ========== IN-MEMORY STORE ==========

/// Approval store with the same compare-and-swap semantics as Postgres
pub struct MemoryApprovalStore {
    records: RwLock<HashMap<Uuid, ApprovalRecord>>,
    applied: AtomicUsize,
    contested: Mutex<HashSet<Uuid>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            applied: AtomicUsize::new(0),
            contested: Mutex::new(HashSet::new()),
        }
    }

    /// Let a rival worker take the next settlement claim on `id` first
    pub fn contest(&self, id: Uuid) {
        self.contested.lock().unwrap().insert(id);
    }

    /// Number of transitions and claims that actually changed a record
    pub fn applied_mutations(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    pub async fn record(&self, id: Uuid) -> ApprovalRecord {
        self.records.read().await[&id].clone()
    }

    /// Force a record into a state, bypassing guards (fixture setup only)
    pub async fn force(&self, id: Uuid, update: impl FnOnce(&mut ApprovalRecord)) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&id) {
            update(record);
        }
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn insert(&self, new: NewApproval) -> AppResult<ApprovalRecord> {
        let record = ApprovalRecord::submitted(new);
        self.records.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<ApprovalRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list_by_state(
        &self,
        state: LifecycleState,
        limit: i64,
    ) -> AppResult<Vec<ApprovalRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<ApprovalRecord> = records
            .values()
            .filter(|r| r.lifecycle_state == state)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.submitted_at, a.id).cmp(&(b.submitted_at, b.id)));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn transition(&self, id: Uuid, transition: &Transition) -> AppResult<bool> {
        LifecycleState::validate_transition(transition.from, transition.to)?;

        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if transition.guard_holds(record) => {
                transition.apply_to(record, Utc::now());
                self.applied.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_settlement(
        &self,
        id: Uuid,
        previous: Option<&str>,
        settlement: &SettlementClaim,
        pending: &[GrantTransfer],
    ) -> AppResult<bool> {
        let mut records = self.records.write().await;
        if self.contested.lock().unwrap().remove(&id) {
            if let Some(record) = records.get_mut(&id) {
                record.settlement_signature = Some("RIVAL".to_string());
                record.settlement_blockhash = Some("RIVAL_BLOCKHASH".to_string());
                record.settlement_submitted_at = Some(Utc::now());
            }
        }
        match records.get_mut(&id) {
            Some(record)
                if record.lifecycle_state == LifecycleState::Verified
                    && record.settlement_signature.as_deref() == previous =>
            {
                let now = Utc::now();
                record.settlement_signature = Some(settlement.signature.clone());
                record.settlement_blockhash = Some(settlement.blockhash.clone());
                record.settlement_submitted_at = Some(now);
                record.transfer_results = pending.to_vec();
                record.updated_at = now;
                self.applied.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ========== SCRIPTED GATEWAY ==========

#[derive(Default)]
struct MockLedger {
    transactions: HashMap<String, LedgerResult<Option<LedgerTransaction>>>,
    accounts: HashMap<String, LedgerResult<TokenAccountState>>,
    receiving: HashMap<(String, String), String>,
    receiving_error: Option<LedgerError>,
    expired_blockhashes: HashSet<String>,
    prepare_error: Option<LedgerError>,
    send_error: Option<LedgerError>,
    confirmation: Option<ConfirmationStatus>,
    prepared: usize,
    sent: Vec<PreparedTransfer>,
    account_reads: usize,
}

/// Ledger gateway double driven by scripted responses
pub struct MockGateway {
    signer: Option<String>,
    ledger: Mutex<MockLedger>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            signer: None,
            ledger: Mutex::new(MockLedger::default()),
        }
    }

    pub fn with_signer(mut self, signer: &str) -> Self {
        self.signer = Some(signer.to_string());
        self
    }

    pub fn with_transaction(self, transaction: LedgerTransaction) -> Self {
        self.set_transaction(transaction);
        self
    }

    pub fn with_account(self, account: &str, state: TokenAccountState) -> Self {
        self.set_account(account, state);
        self
    }

    pub fn with_receiving(self, owner: &str, mint: &str, account: &str) -> Self {
        self.ledger
            .lock()
            .unwrap()
            .receiving
            .insert((owner.to_string(), mint.to_string()), account.to_string());
        self
    }

    pub fn set_transaction(&self, transaction: LedgerTransaction) {
        self.ledger
            .lock()
            .unwrap()
            .transactions
            .insert(transaction.signature.clone(), Ok(Some(transaction)));
    }

    pub fn set_transaction_error(&self, signature: &str, error: LedgerError) {
        self.ledger
            .lock()
            .unwrap()
            .transactions
            .insert(signature.to_string(), Err(error));
    }

    pub fn set_account(&self, account: &str, state: TokenAccountState) {
        self.ledger
            .lock()
            .unwrap()
            .accounts
            .insert(account.to_string(), Ok(state));
    }

    pub fn set_account_error(&self, account: &str, error: LedgerError) {
        self.ledger
            .lock()
            .unwrap()
            .accounts
            .insert(account.to_string(), Err(error));
    }

    pub fn set_receiving_error(&self, error: LedgerError) {
        self.ledger.lock().unwrap().receiving_error = Some(error);
    }

    pub fn set_blockhash_expired(&self, blockhash: &str) {
        self.ledger
            .lock()
            .unwrap()
            .expired_blockhashes
            .insert(blockhash.to_string());
    }

    pub fn set_prepare_error(&self, error: LedgerError) {
        self.ledger.lock().unwrap().prepare_error = Some(error);
    }

    pub fn set_send_error(&self, error: LedgerError) {
        self.ledger.lock().unwrap().send_error = Some(error);
    }

    pub fn set_confirmation(&self, status: ConfirmationStatus) {
        self.ledger.lock().unwrap().confirmation = Some(status);
    }

    pub fn sent(&self) -> Vec<PreparedTransfer> {
        self.ledger.lock().unwrap().sent.clone()
    }

    pub fn account_reads(&self) -> usize {
        self.ledger.lock().unwrap().account_reads
    }
}

#[async_trait]
impl LedgerGateway for MockGateway {
    fn signer_address(&self) -> Option<String> {
        self.signer.clone()
    }

    async fn get_transaction(&self, signature: &str) -> LedgerResult<Option<LedgerTransaction>> {
        tokio::task::yield_now().await;
        let ledger = self.ledger.lock().unwrap();
        ledger
            .transactions
            .get(signature)
            .cloned()
            .unwrap_or(Ok(None))
    }

    async fn get_token_account_state(&self, token_account: &str) -> LedgerResult<TokenAccountState> {
        tokio::task::yield_now().await;
        let mut ledger = self.ledger.lock().unwrap();
        ledger.account_reads += 1;
        ledger
            .accounts
            .get(token_account)
            .cloned()
            .unwrap_or_else(|| Err(LedgerError::NotFound(token_account.to_string())))
    }

    async fn find_receiving_account(&self, owner: &str, mint: &str) -> LedgerResult<Option<String>> {
        tokio::task::yield_now().await;
        let ledger = self.ledger.lock().unwrap();
        if let Some(error) = ledger.receiving_error.clone() {
            return Err(error);
        }
        Ok(ledger
            .receiving
            .get(&(owner.to_string(), mint.to_string()))
            .cloned())
    }

    async fn prepare_transfer(&self, batch: TransferBatch) -> LedgerResult<PreparedTransfer> {
        tokio::task::yield_now().await;
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(error) = ledger.prepare_error.clone() {
            return Err(error);
        }
        ledger.prepared += 1;
        Ok(PreparedTransfer {
            signature: format!("SWEEP-{}", ledger.prepared),
            recent_blockhash: format!("BLOCKHASH-{}", ledger.prepared),
            batch,
        })
    }

    async fn send_prepared(&self, prepared: &PreparedTransfer) -> LedgerResult<()> {
        tokio::task::yield_now().await;
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(error) = ledger.send_error.clone() {
            return Err(error);
        }
        ledger.sent.push(prepared.clone());
        Ok(())
    }

    async fn is_blockhash_valid(&self, blockhash: &str) -> LedgerResult<bool> {
        tokio::task::yield_now().await;
        let ledger = self.ledger.lock().unwrap();
        Ok(!ledger.expired_blockhashes.contains(blockhash))
    }

    async fn await_confirmation(
        &self,
        _signature: &str,
        _timeout: Duration,
    ) -> LedgerResult<ConfirmationStatus> {
        tokio::task::yield_now().await;
        let ledger = self.ledger.lock().unwrap();
        Ok(ledger
            .confirmation
            .clone()
            .unwrap_or(ConfirmationStatus::Confirmed))
    }
}
