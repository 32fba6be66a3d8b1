use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::matching::ProposalStrategy;
use crate::reconcile::RunRecord;
use crate::recovery::{SupervisorState, SupervisorStatus};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub ledger: SupervisorState,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub last_run: Option<RunRecord>,
    pub ledger: SupervisorStatus,
    pub strategy: ProposalStrategy,
    pub contract: String,
}
