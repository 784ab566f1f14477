// Settlement reconciliation: claim verification, delegated sweeps and the
// loops that drive them
pub mod executor;
pub mod scheduler;
pub mod verifier;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::approvals::ApprovalRecord;
use crate::error::AppResult;

pub use executor::TransferExecutor;
pub use scheduler::{SchedulerConfig, SettlementScheduler};
pub use verifier::ApprovalVerifier;

/// What happened to one record during a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Moved to the stage's success state
    Advanced,
    /// Moved to the stage's terminal failure state
    Failed,
    /// Left alone because of local configuration
    Skipped,
    /// Left alone until a later cycle (transient error or settlement in flight)
    Deferred,
    /// Another worker transitioned the record first
    LostRace,
}

/// Per-cycle tally, logged by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: usize,
    pub advanced: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub lost_races: usize,
}

impl CycleReport {
    pub fn record(&mut self, outcome: RecordOutcome) {
        self.scanned += 1;
        match outcome {
            RecordOutcome::Advanced => self.advanced += 1,
            RecordOutcome::Failed => self.failed += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Deferred => self.deferred += 1,
            RecordOutcome::LostRace => self.lost_races += 1,
        }
    }

    pub fn from_outcomes(outcomes: impl IntoIterator<Item = RecordOutcome>) -> Self {
        let mut report = Self::default();
        for outcome in outcomes {
            report.record(outcome);
        }
        report
    }
}

/// One periodically driven reconciliation stage
#[async_trait]
pub trait ReconcileStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process one batch of eligible records. Per-record failures are
    /// absorbed into the report; only a failed scan is returned as an error.
    async fn run_cycle(&self) -> AppResult<CycleReport>;
}

/// Group records by owner, keeping first-seen order of owners and records
pub fn group_by_owner(records: Vec<ApprovalRecord>) -> Vec<Vec<ApprovalRecord>> {
    group_by(records, |record| &record.owner)
}

/// Group one owner's records by network, same ordering rules
pub fn group_by_network(records: Vec<ApprovalRecord>) -> Vec<Vec<ApprovalRecord>> {
    group_by(records, |record| &record.network)
}

fn group_by(
    records: Vec<ApprovalRecord>,
    key: impl Fn(&ApprovalRecord) -> &String,
) -> Vec<Vec<ApprovalRecord>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<ApprovalRecord>> = Vec::new();

    for record in records {
        match index.get(key(&record)) {
            Some(&slot) => groups[slot].push(record),
            None => {
                index.insert(key(&record).clone(), groups.len());
                groups.push(vec![record]);
            }
        }
    }

    groups
}
