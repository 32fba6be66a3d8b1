use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Where a run request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOrigin {
    Manual,
    Timer,
    Subscription,
    /// Catch-up run issued by the fault supervisor after a reset
    Recovery,
}

impl fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerOrigin::Manual => "manual",
            TriggerOrigin::Timer => "timer",
            TriggerOrigin::Subscription => "subscription",
            TriggerOrigin::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    NoItems,
    NoMatch,
    MatchCommitted { tx_ref: String },
    /// The ledger refused the pair because one side was matched meanwhile
    AlreadyMatched,
    Error { kind: String },
}

impl RunOutcome {
    pub fn error(kind: impl Into<String>) -> Self {
        RunOutcome::Error { kind: kind.into() }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::NoItems => f.write_str("no-items"),
            RunOutcome::NoMatch => f.write_str("no-match"),
            RunOutcome::MatchCommitted { tx_ref } => write!(f, "match-committed:{}", tx_ref),
            RunOutcome::AlreadyMatched => f.write_str("already-matched"),
            RunOutcome::Error { kind } => write!(f, "error:{}", kind),
        }
    }
}

impl Serialize for RunOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The process-wide record of the most recent run
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub origin: TriggerOrigin,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while the run is in flight
    pub outcome: Option<RunOutcome>,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("already-running")]
pub struct RunRejected;

/// Admits at most one reconciliation run at a time.
///
/// Triggers arriving while a run is in flight are rejected, never queued.
#[derive(Clone, Default)]
pub struct RunGuard {
    slot: Arc<Mutex<()>>,
    last: Arc<RwLock<Option<RunRecord>>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_start(&self, origin: TriggerOrigin) -> Result<RunPermit, RunRejected> {
        let held = self.slot.clone().try_lock_owned().map_err(|_| RunRejected)?;

        let record = RunRecord {
            run_id: Uuid::new_v4(),
            origin,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        };
        *self.last.write() = Some(record.clone());

        Ok(RunPermit {
            _held: held,
            record,
            last: self.last.clone(),
            finished: false,
        })
    }

    pub fn last_record(&self) -> Option<RunRecord> {
        self.last.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.slot.try_lock().is_err()
    }
}

/// Proof of admission. Dropping it releases the guard.
pub struct RunPermit {
    _held: OwnedMutexGuard<()>,
    record: RunRecord,
    last: Arc<RwLock<Option<RunRecord>>>,
    finished: bool,
}

impl RunPermit {
    pub fn run_id(&self) -> Uuid {
        self.record.run_id
    }

    pub fn origin(&self) -> TriggerOrigin {
        self.record.origin
    }

    /// Store the terminal outcome, then release the guard.
    pub fn finish(mut self, outcome: RunOutcome) -> RunRecord {
        self.store(outcome);
        self.finished = true;
        self.record.clone()
    }

    fn store(&mut self, outcome: RunOutcome) {
        self.record.finished_at = Some(Utc::now());
        self.record.outcome = Some(outcome);
        *self.last.write() = Some(self.record.clone());
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        // Run future was cancelled or panicked before reaching an outcome.
        if !self.finished {
            self.store(RunOutcome::error("aborted"));
        }
    }
}
