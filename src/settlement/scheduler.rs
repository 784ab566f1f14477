// Settlement Scheduler - drives the reconciliation stages
//
// - One independent interval loop per stage
// - A failed or panicking cycle is logged and the loop keeps going
// - Shutdown is cooperative: an in-flight cycle finishes first

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use super::{CycleReport, ReconcileStage};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub verify_interval: Duration,
    pub transfer_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            verify_interval: Duration::from_secs(30),
            transfer_interval: Duration::from_secs(30),
        }
    }
}

/// Settlement scheduler - owns the verification and transfer loops
pub struct SettlementScheduler {
    config: SchedulerConfig,
    verifier: Arc<dyn ReconcileStage>,
    executor: Arc<dyn ReconcileStage>,
}

impl SettlementScheduler {
    pub fn new(
        config: SchedulerConfig,
        verifier: Arc<dyn ReconcileStage>,
        executor: Arc<dyn ReconcileStage>,
    ) -> Self {
        Self {
            config,
            verifier,
            executor,
        }
    }

    /// Start both loops in the background. They stop once `shutdown`
    /// flips to `true` or its sender is dropped.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            "⏰ Verification every {:?}, transfers every {:?}",
            self.config.verify_interval, self.config.transfer_interval
        );

        vec![
            tokio::spawn(Self::run_loop(
                self.verifier.clone(),
                self.config.verify_interval,
                shutdown.clone(),
            )),
            tokio::spawn(Self::run_loop(
                self.executor.clone(),
                self.config.transfer_interval,
                shutdown,
            )),
        ]
    }

    async fn run_loop(
        stage: Arc<dyn ReconcileStage>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            Self::run_once(stage.clone()).await;
        }

        info!("🛑 {} loop stopped", stage.name());
    }

    /// Run a single cycle, absorbing its failure
    pub async fn run_once(stage: Arc<dyn ReconcileStage>) -> Option<CycleReport> {
        let name = stage.name();
        let cycle = tokio::spawn(async move { stage.run_cycle().await });

        match cycle.await {
            Ok(Ok(report)) => {
                if report.scanned > 0 {
                    info!(
                        "✓ {} cycle: {} scanned, {} advanced, {} failed, {} skipped, {} deferred, {} lost races",
                        name,
                        report.scanned,
                        report.advanced,
                        report.failed,
                        report.skipped,
                        report.deferred,
                        report.lost_races
                    );
                }
                Some(report)
            }
            Ok(Err(e)) => {
                error!("❌ {} cycle failed: {:?}", name, e);
                None
            }
            Err(e) => {
                error!("❌ {} cycle aborted: {}", name, e);
                None
            }
        }
    }
}
