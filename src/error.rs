use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Top-level error type for the agent
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("A reconciliation run is already in progress")]
    AlreadyRunning,
}

/// Ledger connector errors
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// Transport-level failure: reset, refused, closed socket, dropped generation.
    #[error("Connection fault: {0}")]
    Connection(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed ledger response: {0}")]
    Decode(String),

    #[error("Item {0} not found")]
    ItemNotFound(u64),
}

impl LedgerError {
    /// Only transport faults hand control to the supervisor.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, LedgerError::Connection(_))
    }

    /// The contract reverted `recordMatch` because one side is already linked.
    pub fn is_already_matched(&self) -> bool {
        match self {
            LedgerError::Rpc { code, message } => {
                *code == ALREADY_MATCHED_CODE
                    || message.to_ascii_lowercase().contains("already matched")
            }
            _ => false,
        }
    }
}

/// JSON-RPC error code the ledger node uses for a reverted duplicate match
pub const ALREADY_MATCHED_CODE: i64 = -32010;

/// Inference oracle errors. All of them degrade to "no match" for the run.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Oracle call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Oracle transport error: {0}")]
    Transport(String),

    #[error("Oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Oracle response violates schema: {0}")]
    Schema(String),
}

/// Content store errors. Non-fatal per item.
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Content fetch failed for {reference}: {message}")]
    Fetch { reference: String, message: String },

    #[error("Content {reference} exceeds {limit} bytes")]
    TooLarge { reference: String, limit: usize },
}

/// Commit pipeline errors
#[derive(Error, Debug)]
pub enum CommitError {
    /// The ledger's own guard refused the write: one side is already matched.
    #[error("Match rejected by ledger: lost={lost_id}, found={found_id}: {reason}")]
    Rejected {
        lost_id: u64,
        found_id: u64,
        reason: String,
    },

    #[error("Submission {tx_ref} not confirmed: {reason}")]
    Unconfirmed { tx_ref: String, reason: String },

    #[error("Submission failed: {0}")]
    Ledger(#[from] LedgerError),
}

/// Errors that end a reconciliation run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Connection fault: {0}")]
    ConnectionFault(LedgerError),

    #[error("Ledger read failed: {0}")]
    LedgerRead(LedgerError),

    #[error("Commit failed: {0}")]
    Commit(CommitError),

    #[error("Credential unavailable: {0}")]
    Credential(String),

    #[error("Ledger connector not available (generation {0} torn down)")]
    ConnectorUnavailable(u64),
}

impl RunError {
    /// Short kind used in `error:<kind>` run outcomes
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::ConnectionFault(_) => "connection-fault",
            RunError::LedgerRead(_) => "ledger-read",
            RunError::Commit(_) => "commit-failed",
            RunError::Credential(_) => "credential",
            RunError::ConnectorUnavailable(_) => "connector-unavailable",
        }
    }
}

impl From<LedgerError> for RunError {
    fn from(error: LedgerError) -> Self {
        if error.is_connection_fault() {
            RunError::ConnectionFault(error)
        } else {
            RunError::LedgerRead(error)
        }
    }
}

impl From<CommitError> for RunError {
    fn from(error: CommitError) -> Self {
        match error {
            CommitError::Ledger(inner) if inner.is_connection_fault() => {
                RunError::ConnectionFault(inner)
            }
            other => RunError::Commit(other),
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::AlreadyRunning => (
                StatusCode::CONFLICT,
                "ALREADY_RUNNING",
                "A reconciliation run is already in progress".to_string(),
                None,
            ),
            AppError::Config(_) | AppError::InvalidCredential(_) | AppError::Oracle(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIGURATION_ERROR",
                "Agent is misconfigured".to_string(),
                None,
            ),
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_classification() {
        let reset = LedgerError::Connection("connection reset by peer".to_string());
        let rpc = LedgerError::Rpc {
            code: -32000,
            message: "boom".to_string(),
        };

        assert!(matches!(RunError::from(reset), RunError::ConnectionFault(_)));
        assert!(matches!(RunError::from(rpc), RunError::LedgerRead(_)));
    }

    #[test]
    fn test_commit_transport_fault_becomes_connection_fault() {
        let err = CommitError::Ledger(LedgerError::Connection("closed".to_string()));
        let run = RunError::from(err);
        assert_eq!(run.kind(), "connection-fault");
    }

    #[test]
    fn test_already_running_is_conflict() {
        let response = AppError::AlreadyRunning.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = AppError::Internal("task panicked".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error_code"], "INTERNAL_ERROR");
        assert!(!body["error"].as_str().unwrap().contains("panicked"));
    }
}
