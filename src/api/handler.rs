use axum::{extract::State, Json};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::models::*;
use crate::error::{AppError, AppResult};
use crate::matching::ProposalStrategy;
use crate::reconcile::{Reconciler, RunRecord, TriggerOrigin};
use crate::recovery::{FaultSupervisor, SupervisorState};

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub supervisor: Arc<FaultSupervisor>,
    pub strategy: ProposalStrategy,
    pub contract: String,
}

/// Run one reconciliation cycle and wait for its outcome
/// POST /api/v1/reconcile
///
/// A run failure is still a 200: the failure is carried in the record's
/// `error:<kind>` outcome. Only an overlapping run is refused (409).
/// The run lives on its own task and finishes even if the client disconnects.
pub async fn trigger_reconcile(State(state): State<AppState>) -> AppResult<Json<RunRecord>> {
    info!("Manual reconciliation requested");

    let record = state
        .reconciler
        .trigger_detached(TriggerOrigin::Manual)
        .await
        .map_err(|e| AppError::Internal(format!("reconciliation task failed: {}", e)))?
        .map_err(|_| AppError::AlreadyRunning)?;

    Ok(Json(record))
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: state.reconciler.is_running(),
        last_run: state.reconciler.last_record(),
        ledger: state.supervisor.status(),
        strategy: state.strategy,
        contract: state.contract.clone(),
    })
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ledger = state.supervisor.status().state;

    Json(HealthResponse {
        status: if ledger == SupervisorState::Connected {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        timestamp: Utc::now(),
        ledger,
    })
}
