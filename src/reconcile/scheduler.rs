// Reconciliation scheduler - periodic timer trigger and status log
//
// The timer never waits on a run: it fires a background trigger and the
// run guard drops it if a run is already in flight. The first tick fires
// immediately so the agent reconciles once on startup.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::info;

use crate::reconcile::{Reconciler, TriggerOrigin};
use crate::recovery::FaultSupervisor;

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub run_interval: Duration,
    pub status_log_interval: Duration,
}

pub struct ReconcileScheduler {
    config: ScheduleConfig,
    reconciler: Arc<Reconciler>,
    supervisor: Arc<FaultSupervisor>,
}

impl ReconcileScheduler {
    pub fn new(
        config: ScheduleConfig,
        reconciler: Arc<Reconciler>,
        supervisor: Arc<FaultSupervisor>,
    ) -> Self {
        Self {
            config,
            reconciler,
            supervisor,
        }
    }

    /// Start the timer and the status logger (both run in background)
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![self.spawn_timer(), self.spawn_status_log()]
    }

    fn spawn_timer(&self) -> JoinHandle<()> {
        let period = self.config.run_interval;
        let reconciler = self.reconciler.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("⏰ Reconciliation timer every {:?}", period);

            loop {
                ticker.tick().await;
                reconciler.trigger_background(TriggerOrigin::Timer);
            }
        })
    }

    fn spawn_status_log(&self) -> JoinHandle<()> {
        let period = self.config.status_log_interval;
        let reconciler = self.reconciler.clone();
        let supervisor = self.supervisor.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Nothing to report at startup.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let connection = supervisor.status();
                match reconciler.last_record() {
                    Some(record) => info!(
                        "Status: last run {} ({}) started {} -> {}, ledger {:?} gen {}",
                        record.run_id,
                        record.origin,
                        record.started_at.format("%Y-%m-%d %H:%M:%S"),
                        record
                            .outcome
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "running".to_string()),
                        connection.state,
                        connection.generation
                    ),
                    None => info!(
                        "Status: no run yet, ledger {:?} gen {}",
                        connection.state, connection.generation
                    ),
                }
            }
        })
    }
}
