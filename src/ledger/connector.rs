use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::LedgerError;
use crate::ledger::models::*;

/// Stream of ledger notifications. An `Err` item or a closed channel means the
/// underlying transport is gone.
pub type EventReceiver = mpsc::Receiver<Result<LedgerEvent, LedgerError>>;

/// Connector trait - implemented by each ledger transport
///
/// A connector is bound to exactly one connection; it never reconnects on its own.
/// Reconnection is owned by the fault supervisor, which drops the connector and
/// asks a [`ConnectorFactory`] for a fresh one.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    fn mode(&self) -> ConnectionMode;

    /// Number of item slots including the sentinel at id 0
    async fn item_count(&self) -> Result<u64, LedgerError>;

    async fn get_item(&self, id: u64) -> Result<Item, LedgerError>;

    /// Matched counterpart id, or 0 when unmatched
    async fn match_status(&self, id: u64) -> Result<u64, LedgerError>;

    /// Submit a signed `recordMatch`. Returns the transaction reference.
    async fn record_match(&self, submission: &SignedMatch) -> Result<String, LedgerError>;

    async fn transaction_status(&self, tx_ref: &str) -> Result<TxStatus, LedgerError>;

    /// Start receiving `ItemReported` / `MatchFound` notifications.
    ///
    /// May only be called once per connector.
    async fn subscribe(&self) -> Result<EventReceiver, LedgerError>;
}

/// Builds connectors from scratch; used on startup and after every fault reset
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn LedgerConnector>, LedgerError>;
}
