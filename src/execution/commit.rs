use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::error::CommitError;
use crate::execution::signature::AgentCredential;
use crate::ledger::connector::LedgerConnector;
use crate::ledger::models::*;

#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// How long a submission may stay pending before it is reported unconfirmed
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(3),
        }
    }
}

/// Result of a successful submission.
///
/// The run completes as soon as the submission is accepted; `confirmation`
/// resolves later and is only observed through logs (and by tests).
pub struct CommitReceipt {
    pub tx_ref: String,
    pub confirmation: JoinHandle<Result<TxStatus, CommitError>>,
}

/// Submits confirmed pairs to the ledger and tracks their confirmation
pub struct CommitPipeline {
    config: CommitConfig,
}

impl CommitPipeline {
    pub fn new(config: CommitConfig) -> Self {
        Self { config }
    }

    /// Sign and submit `recordMatch(lost, found)`.
    ///
    /// The ledger refuses the write when either side is already matched; that
    /// surfaces as [`CommitError::Rejected`], which callers treat as a no-op.
    #[instrument(skip(self, connector, credential, contract), fields(lost_id = pair.lost_id, found_id = pair.found_id))]
    pub async fn commit(
        &self,
        connector: Arc<dyn LedgerConnector>,
        credential: &AgentCredential,
        contract: &str,
        pair: &CandidatePair,
    ) -> Result<CommitReceipt, CommitError> {
        let nonce = rand::random::<u64>();
        let submission = credential.sign_match(contract, pair.lost_id, pair.found_id, nonce);

        let tx_ref = match connector.record_match(&submission).await {
            Ok(tx_ref) => tx_ref,
            Err(e) if e.is_already_matched() => {
                warn!(
                    "Ledger already holds a match for {} or {}, skipping",
                    pair.lost_id, pair.found_id
                );
                return Err(CommitError::Rejected {
                    lost_id: pair.lost_id,
                    found_id: pair.found_id,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                error!("recordMatch submission failed: {}", e);
                return Err(CommitError::Ledger(e));
            }
        };

        info!(
            "Match submitted: lost={} found={} (tx: {})",
            pair.lost_id, pair.found_id, tx_ref
        );

        let confirmation = tokio::spawn(await_confirmation(
            connector,
            tx_ref.clone(),
            self.config.clone(),
        ));

        Ok(CommitReceipt {
            tx_ref,
            confirmation,
        })
    }
}

/// Poll the transaction until it confirms, fails, or the deadline passes.
///
/// Never retries the submission: an unconfirmed match leaves both items
/// unmatched and the next run re-evaluates them.
async fn await_confirmation(
    connector: Arc<dyn LedgerConnector>,
    tx_ref: String,
    config: CommitConfig,
) -> Result<TxStatus, CommitError> {
    let deadline = Instant::now() + config.confirmation_timeout;

    loop {
        match connector.transaction_status(&tx_ref).await {
            Ok(TxStatus::Confirmed) => {
                info!("✓ Match transaction confirmed (tx: {})", tx_ref);
                return Ok(TxStatus::Confirmed);
            }
            Ok(TxStatus::Failed) => {
                let err = CommitError::Unconfirmed {
                    tx_ref: tx_ref.clone(),
                    reason: "transaction failed on ledger".to_string(),
                };
                error!("{}", err);
                return Err(err);
            }
            Ok(TxStatus::Pending) => {}
            Err(e) if e.is_connection_fault() => {
                let err = CommitError::Unconfirmed {
                    tx_ref: tx_ref.clone(),
                    reason: format!("lost ledger connection: {}", e),
                };
                error!("{}", err);
                return Err(err);
            }
            Err(e) => warn!("Status poll for {} failed: {}", tx_ref, e),
        }

        if Instant::now() >= deadline {
            let err = CommitError::Unconfirmed {
                tx_ref: tx_ref.clone(),
                reason: format!("not confirmed within {:?}", config.confirmation_timeout),
            };
            error!("{}", err);
            return Err(err);
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}
