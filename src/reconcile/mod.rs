pub mod guard;
pub mod scheduler;
pub mod snapshot;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CommitError, LedgerError, RunError};
use crate::execution::commit::CommitPipeline;
use crate::execution::signature::{AgentCredential, CredentialProvider};
use crate::matching::MatchProposer;
use crate::recovery::{FaultReport, GenerationHandle, LedgerGeneration};

pub use guard::{RunGuard, RunOutcome, RunPermit, RunRecord, RunRejected, TriggerOrigin};

/// Everything a run needs, captured once when it is admitted.
///
/// A key rotation or connector reset during the run does not affect it.
pub struct RunContext {
    pub generation: Arc<LedgerGeneration>,
    pub credential: Arc<AgentCredential>,
    pub contract: String,
}

/// Drives one reconciliation cycle: snapshot, propose, commit
pub struct Reconciler {
    guard: RunGuard,
    generations: Arc<GenerationHandle>,
    credentials: CredentialProvider,
    proposer: MatchProposer,
    pipeline: CommitPipeline,
    contract: String,
    faults: mpsc::Sender<FaultReport>,
}

impl Reconciler {
    pub fn new(
        generations: Arc<GenerationHandle>,
        credentials: CredentialProvider,
        proposer: MatchProposer,
        pipeline: CommitPipeline,
        contract: String,
        faults: mpsc::Sender<FaultReport>,
    ) -> Self {
        Self {
            guard: RunGuard::new(),
            generations,
            credentials,
            proposer,
            pipeline,
            contract,
            faults,
        }
    }

    pub fn last_record(&self) -> Option<RunRecord> {
        self.guard.last_record()
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Run one cycle and wait for it. Rejected if a run is already in flight.
    pub async fn trigger(&self, origin: TriggerOrigin) -> Result<RunRecord, RunRejected> {
        let permit = self.guard.try_start(origin)?;
        let outcome = self.execute(&permit).await;
        let record = permit.finish(outcome);

        info!(
            "Run {} ({}) finished: {}",
            record.run_id,
            record.origin,
            record
                .outcome
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        );
        Ok(record)
    }

    /// Run one cycle on its own task.
    ///
    /// Dropping the returned handle does not cancel the run, so a caller that
    /// goes away mid-run cannot leave a submitted match untracked.
    pub fn trigger_detached(
        self: &Arc<Self>,
        origin: TriggerOrigin,
    ) -> JoinHandle<Result<RunRecord, RunRejected>> {
        let reconciler = self.clone();
        tokio::spawn(async move { reconciler.trigger(origin).await })
    }

    /// Fire-and-forget trigger used by the timer, the subscription and recovery
    pub fn trigger_background(self: &Arc<Self>, origin: TriggerOrigin) {
        let reconciler = self.clone();
        tokio::spawn(async move {
            if reconciler.trigger(origin).await.is_err() {
                debug!("{} trigger skipped: run already in progress", origin);
            }
        });
    }

    #[instrument(skip_all, fields(run_id = %permit.run_id(), origin = %permit.origin()))]
    async fn execute(&self, permit: &RunPermit) -> RunOutcome {
        let context = match self.context() {
            Ok(context) => context,
            Err(e) => {
                warn!("Run cannot start: {}", e);
                return RunOutcome::error(e.kind());
            }
        };

        match self.run(&context).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Run failed: {}", e);
                if let RunError::ConnectionFault(fault) = &e {
                    self.report_fault(context.generation.number(), fault.clone());
                }
                RunOutcome::error(e.kind())
            }
        }
    }

    fn context(&self) -> Result<RunContext, RunError> {
        let generation = self
            .generations
            .current()
            .ok_or(RunError::ConnectorUnavailable(0))?;

        if generation.is_retired() {
            return Err(RunError::ConnectorUnavailable(generation.number()));
        }

        let credential = self
            .credentials
            .resolve()
            .map_err(|e| RunError::Credential(e.to_string()))?;

        Ok(RunContext {
            generation,
            credential,
            contract: self.contract.clone(),
        })
    }

    async fn run(&self, context: &RunContext) -> Result<RunOutcome, RunError> {
        let Some(snapshot) = snapshot::collect(context.generation.as_ref()).await? else {
            return Ok(RunOutcome::NoItems);
        };

        let Some(pair) = self.proposer.propose(&snapshot).await else {
            return Ok(RunOutcome::NoMatch);
        };

        info!(
            "Committing match lost={} found={} ({})",
            pair.lost_id, pair.found_id, pair.confidence
        );

        let committed = self
            .pipeline
            .commit(
                context.generation.clone(),
                &context.credential,
                &context.contract,
                &pair,
            )
            .await;

        match committed {
            // Confirmation keeps running detached and reports through the log.
            Ok(receipt) => Ok(RunOutcome::MatchCommitted {
                tx_ref: receipt.tx_ref,
            }),
            Err(CommitError::Rejected { .. }) => Ok(RunOutcome::AlreadyMatched),
            Err(e) => Err(e.into()),
        }
    }

    fn report_fault(&self, generation: u64, error: LedgerError) {
        if let Err(e) = self.faults.try_send(FaultReport { generation, error }) {
            debug!("Fault report not delivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::recovery::SupervisorState;
    use crate::testing::{harness, wait_until, FakeLedger, Reply, ScriptedOracle};

    #[tokio::test]
    async fn test_empty_ledger_is_no_items() {
        let ledger = FakeLedger::new();
        let oracle = ScriptedOracle::proposing(1, 2, "high");
        let h = harness(&ledger, oracle.clone()).await;

        let record = h.reconciler.trigger(TriggerOrigin::Manual).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::NoItems));
        assert_eq!(oracle.calls(), 0);
        assert!(ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_high_confidence_pair_is_committed() {
        let ledger = FakeLedger::with_red_wallets();
        let h = harness(&ledger, ScriptedOracle::proposing(1, 2, "high")).await;

        let record = h.reconciler.trigger(TriggerOrigin::Manual).await.unwrap();

        let outcome = record.outcome.unwrap();
        assert!(outcome.to_string().starts_with("match-committed:0xtx"));
        let submissions = ledger.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!((submissions[0].lost_id, submissions[0].found_id), (1, 2));
        assert_eq!(submissions[0].contract, "0xlostfound");
    }

    #[tokio::test]
    async fn test_medium_confidence_writes_nothing() {
        let ledger = FakeLedger::with_red_wallets();
        let h = harness(&ledger, ScriptedOracle::proposing(1, 2, "medium")).await;

        let record = h.reconciler.trigger(TriggerOrigin::Manual).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::NoMatch));
        assert!(ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_committed_items_leave_the_next_snapshot() {
        let ledger = FakeLedger::with_red_wallets();
        let oracle = ScriptedOracle::proposing(1, 2, "high");
        let h = harness(&ledger, oracle.clone()).await;

        h.reconciler.trigger(TriggerOrigin::Manual).await.unwrap();
        let second = h.reconciler.trigger(TriggerOrigin::Timer).await.unwrap();

        // Both sides are now matched, so the oracle is not consulted again.
        assert_eq!(second.outcome, Some(RunOutcome::NoMatch));
        assert_eq!(oracle.calls(), 1);
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_side_rejection_is_benign() {
        let ledger = FakeLedger::with_red_wallets();
        // Another writer links the pair after our snapshot was taken.
        let oracle = ScriptedOracle::new(vec![Reply::propose(1, 2, "high")]);
        oracle.before_reply({
            let ledger = ledger.clone();
            move || ledger.link(1, 2)
        });
        let h = harness(&ledger, oracle).await;

        let record = h.reconciler.trigger(TriggerOrigin::Manual).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::AlreadyMatched));
        assert!(ledger.submissions().is_empty());
        assert_eq!(h.supervisor.status().state, SupervisorState::Connected);
    }

    #[tokio::test]
    async fn test_overlapping_manual_trigger_is_rejected() {
        let ledger = FakeLedger::with_red_wallets();
        let h = harness(&ledger, ScriptedOracle::new(vec![Reply::Hang])).await;

        let running = {
            let reconciler = h.reconciler.clone();
            tokio::spawn(async move { reconciler.trigger(TriggerOrigin::Timer).await })
        };
        wait_until(|| h.reconciler.is_running()).await;

        assert_eq!(
            h.reconciler.trigger(TriggerOrigin::Manual).await.err(),
            Some(RunRejected)
        );
        running.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_reset_mid_run_recovers_with_fresh_connector() {
        let ledger = FakeLedger::with_red_wallets();
        let h = harness(&ledger, ScriptedOracle::proposing(1, 2, "high")).await;

        // item_count succeeds, the first match_status read hits a reset.
        ledger.sever_after(1);
        let failed = h.reconciler.trigger(TriggerOrigin::Manual).await.unwrap();
        assert_eq!(failed.outcome, Some(RunOutcome::error("connection-fault")));

        let started = tokio::time::Instant::now();
        wait_until(|| h.supervisor.status().generation == 2).await;
        assert!(started.elapsed() >= Duration::from_secs(29));
        assert_eq!(ledger.connections(), 2);

        // The recovery catch-up runs against the new generation and commits.
        wait_until(|| ledger.matched_with(1) == Some(2)).await;
        wait_until(|| !h.reconciler.is_running()).await;
        let record = h.reconciler.last_record().unwrap();
        assert_eq!(record.origin, TriggerOrigin::Recovery);
        assert!(matches!(record.outcome, Some(RunOutcome::MatchCommitted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_reset_reports_unavailable_connector() {
        let ledger = FakeLedger::with_red_wallets();
        let h = harness(&ledger, ScriptedOracle::no_match()).await;

        ledger.sever();
        wait_until(|| h.supervisor.status().state == SupervisorState::Faulted).await;

        let record = h.reconciler.trigger(TriggerOrigin::Manual).await.unwrap();
        assert_eq!(record.outcome, Some(RunOutcome::error("connector-unavailable")));
    }
}
