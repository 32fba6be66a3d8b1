use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;
use crate::ledger::connector::{ConnectorFactory, EventReceiver, LedgerConnector};
use crate::ledger::models::{ConnectionMode, LedgerEvent};
use crate::reconcile::{Reconciler, TriggerOrigin};
use crate::recovery::{FaultReport, GenerationHandle, LedgerGeneration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Uninitialized,
    Connected,
    Faulted,
    Reinitializing,
}

/// Snapshot of the supervisor for the status endpoint and periodic log
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    /// Number of the live connector generation, 0 before the first connect
    pub generation: u64,
    pub mode: Option<ConnectionMode>,
    pub resets: u64,
    pub last_fault: Option<String>,
    pub last_fault_at: Option<DateTime<Utc>>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Uninitialized,
            generation: 0,
            mode: None,
            resets: 0,
            last_fault: None,
            last_fault_at: None,
        }
    }
}

/// Owns the ledger connection lifecycle.
///
/// On a connection fault it drops the live generation, waits out the cooldown,
/// builds a fresh connector, re-subscribes and fires one catch-up run.
pub struct FaultSupervisor {
    factory: Arc<dyn ConnectorFactory>,
    generations: Arc<GenerationHandle>,
    faults: mpsc::Sender<FaultReport>,
    cooldown: Duration,
    resetting: AtomicBool,
    next_generation: AtomicU64,
    status: RwLock<SupervisorStatus>,
}

impl FaultSupervisor {
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        generations: Arc<GenerationHandle>,
        faults: mpsc::Sender<FaultReport>,
        cooldown: Duration,
    ) -> Self {
        Self {
            factory,
            generations,
            faults,
            cooldown,
            resetting: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            status: RwLock::new(SupervisorStatus::default()),
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.read().clone()
    }

    /// Connect the first generation and start listening for faults.
    ///
    /// A failed initial connect is handled like any later fault: the supervisor
    /// keeps retrying after each cooldown while the agent stays up.
    pub async fn start(
        self: &Arc<Self>,
        reconciler: Arc<Reconciler>,
        mut reports: mpsc::Receiver<FaultReport>,
    ) -> JoinHandle<()> {
        match self.establish(&reconciler).await {
            Ok(number) => info!("✓ Ledger connector generation {} ready", number),
            Err(e) => {
                error!("Initial ledger connection failed: {}", e);
                self.begin_reset(reconciler.clone(), e);
            }
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                supervisor.on_fault(&reconciler, report);
            }
            debug!("Fault channel closed, supervisor listener exiting");
        })
    }

    fn on_fault(self: &Arc<Self>, reconciler: &Arc<Reconciler>, report: FaultReport) {
        match self.generations.current_number() {
            Some(live) if live == report.generation => {
                warn!(
                    "Connection fault on generation {}: {}",
                    report.generation, report.error
                );
                self.begin_reset(reconciler.clone(), report.error);
            }
            _ => debug!(
                "Ignoring fault from stale generation {}: {}",
                report.generation, report.error
            ),
        }
    }

    /// Start a reset unless one is already running
    fn begin_reset(self: &Arc<Self>, reconciler: Arc<Reconciler>, cause: LedgerError) {
        if self.resetting.swap(true, Ordering::SeqCst) {
            debug!("Reset already in progress, fault absorbed");
            return;
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.reset(&reconciler, cause).await;
            // Cleared before the catch-up so a fault on the new generation starts a new reset.
            supervisor.resetting.store(false, Ordering::SeqCst);
            reconciler.trigger_background(TriggerOrigin::Recovery);
        });
    }

    async fn reset(&self, reconciler: &Arc<Reconciler>, cause: LedgerError) {
        {
            let mut status = self.status.write();
            status.state = SupervisorState::Faulted;
            status.last_fault = Some(cause.to_string());
            status.last_fault_at = Some(Utc::now());
        }

        if let Some(number) = self.generations.tear_down() {
            info!("Tore down connector generation {}", number);
        }

        loop {
            info!("Reconnecting to ledger in {:?}", self.cooldown);
            tokio::time::sleep(self.cooldown).await;

            self.status.write().state = SupervisorState::Reinitializing;
            match self.establish(reconciler).await {
                Ok(number) => {
                    self.status.write().resets += 1;
                    info!("✓ Ledger connector generation {} ready, running catch-up", number);
                    return;
                }
                Err(e) => {
                    error!("Ledger reconnect failed: {}", e);
                    let mut status = self.status.write();
                    status.state = SupervisorState::Faulted;
                    status.last_fault = Some(e.to_string());
                    status.last_fault_at = Some(Utc::now());
                }
            }
        }
    }

    /// Build, subscribe and install a new generation
    async fn establish(&self, reconciler: &Arc<Reconciler>) -> Result<u64, LedgerError> {
        let connector = self.factory.connect().await?;
        let number = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let generation = Arc::new(LedgerGeneration::new(number, connector));

        let events = generation.subscribe().await?;
        let mode = generation.mode();

        {
            let mut status = self.status.write();
            status.state = SupervisorState::Connected;
            status.generation = number;
            status.mode = Some(mode);
        }

        // Installed before the watcher starts so its fault reports are never seen as stale.
        self.generations.install(generation.clone());
        generation.attach_subscription(tokio::spawn(watch_events(
            number,
            events,
            reconciler.clone(),
            self.faults.clone(),
        )));

        Ok(number)
    }
}

/// Turn ledger notifications into subscription triggers
async fn watch_events(
    generation: u64,
    mut events: EventReceiver,
    reconciler: Arc<Reconciler>,
    faults: mpsc::Sender<FaultReport>,
) {
    while let Some(event) = events.recv().await {
        match event {
            Ok(LedgerEvent::ItemReported { id }) => {
                info!("ItemReported: {}", id);
                reconciler.trigger_background(TriggerOrigin::Subscription);
            }
            Ok(LedgerEvent::MatchFound { lost_id, found_id }) => {
                info!("MatchFound: lost={} found={}", lost_id, found_id);
            }
            Err(error) => {
                let _ = faults.send(FaultReport { generation, error }).await;
                return;
            }
        }
    }

    let _ = faults
        .send(FaultReport {
            generation,
            error: LedgerError::Connection("ledger event stream ended".to_string()),
        })
        .await;
}
