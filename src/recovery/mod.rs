pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::LedgerError;
use crate::ledger::connector::{EventReceiver, LedgerConnector};
use crate::ledger::models::*;

pub use supervisor::{FaultSupervisor, SupervisorState, SupervisorStatus};

const FAULT_CHANNEL_CAPACITY: usize = 32;

/// A transport fault observed by a run or by the subscription watcher
#[derive(Debug, Clone)]
pub struct FaultReport {
    /// Generation the fault was observed on; stale reports are ignored
    pub generation: u64,
    pub error: LedgerError,
}

pub fn fault_channel() -> (mpsc::Sender<FaultReport>, mpsc::Receiver<FaultReport>) {
    mpsc::channel(FAULT_CHANNEL_CAPACITY)
}

/// One connector together with its subscription watcher.
///
/// Once retired, every call fails with a connection fault so runs still holding
/// this generation end with a normal run error.
pub struct LedgerGeneration {
    number: u64,
    connector: Arc<dyn LedgerConnector>,
    retired: AtomicBool,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerGeneration {
    pub fn new(number: u64, connector: Arc<dyn LedgerConnector>) -> Self {
        Self {
            number,
            connector,
            retired: AtomicBool::new(false),
            subscription: Mutex::new(None),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_subscription(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.subscription.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop the subscription watcher and refuse further calls
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if let Some(task) = self.subscription.lock().take() {
            task.abort();
        }
    }

    fn live(&self) -> Result<&Arc<dyn LedgerConnector>, LedgerError> {
        if self.is_retired() {
            return Err(LedgerError::Connection(format!(
                "connector generation {} was torn down",
                self.number
            )));
        }
        Ok(&self.connector)
    }
}

impl Drop for LedgerGeneration {
    fn drop(&mut self) {
        self.retire();
    }
}

#[async_trait]
impl LedgerConnector for LedgerGeneration {
    fn mode(&self) -> ConnectionMode {
        self.connector.mode()
    }

    async fn item_count(&self) -> Result<u64, LedgerError> {
        self.live()?.item_count().await
    }

    async fn get_item(&self, id: u64) -> Result<Item, LedgerError> {
        self.live()?.get_item(id).await
    }

    async fn match_status(&self, id: u64) -> Result<u64, LedgerError> {
        self.live()?.match_status(id).await
    }

    async fn record_match(&self, submission: &SignedMatch) -> Result<String, LedgerError> {
        self.live()?.record_match(submission).await
    }

    async fn transaction_status(&self, tx_ref: &str) -> Result<TxStatus, LedgerError> {
        self.live()?.transaction_status(tx_ref).await
    }

    async fn subscribe(&self) -> Result<EventReceiver, LedgerError> {
        self.live()?.subscribe().await
    }
}

/// Holds the single live connector generation; swapped whole on reset
#[derive(Default)]
pub struct GenerationHandle {
    slot: RwLock<Option<Arc<LedgerGeneration>>>,
}

impl GenerationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<LedgerGeneration>> {
        self.slot.read().clone()
    }

    pub fn current_number(&self) -> Option<u64> {
        self.slot.read().as_ref().map(|generation| generation.number())
    }

    /// Install a new generation, retiring whatever was there
    pub fn install(&self, generation: Arc<LedgerGeneration>) {
        let previous = self.slot.write().replace(generation);
        if let Some(previous) = previous {
            previous.retire();
        }
    }

    /// Remove and retire the live generation
    pub fn tear_down(&self) -> Option<u64> {
        let previous = self.slot.write().take()?;
        previous.retire();
        Some(previous.number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLedger;

    #[tokio::test]
    async fn test_retired_generation_refuses_calls() {
        let ledger = FakeLedger::with_red_wallets();
        let handle = GenerationHandle::new();
        handle.install(Arc::new(LedgerGeneration::new(1, ledger.connector())));

        let held = handle.current().unwrap();
        assert_eq!(held.item_count().await.unwrap(), 3);

        assert_eq!(handle.tear_down(), Some(1));
        assert!(handle.current().is_none());

        let err = held.item_count().await.unwrap_err();
        assert!(err.is_connection_fault());
    }

    #[tokio::test]
    async fn test_install_replaces_previous_generation() {
        let ledger = FakeLedger::with_red_wallets();
        let handle = GenerationHandle::new();

        let first = Arc::new(LedgerGeneration::new(1, ledger.connector()));
        handle.install(first.clone());
        handle.install(Arc::new(LedgerGeneration::new(2, ledger.connector())));

        assert!(first.is_retired());
        assert_eq!(handle.current_number(), Some(2));
    }
}
