use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::matching::ProposalStrategy;

const ENV_PREFIX: &str = "RECONCILER";

/// Environment variable holding the hex-encoded agent signing seed
pub const AGENT_KEY_VAR: &str = "RECONCILER_AGENT_KEY";

/// Env file loaded at startup and re-read for key rotation
pub const ENV_FILE: &str = ".env";

/// How the agent credential is resolved for each run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialMode {
    /// Loaded once at startup and reused for the process lifetime
    Static,
    /// Re-read from the environment or key file at the start of every run
    ReloadEachRun,
}

/// Raw, flat settings as they arrive from the environment
#[derive(Debug, Deserialize)]
struct RawSettings {
    bind_address: String,
    ledger_url: String,
    ledger_contract: String,
    credential_mode: CredentialMode,
    agent_key_file: Option<String>,
    oracle_url: String,
    oracle_model: String,
    oracle_api_key: Option<String>,
    oracle_timeout_secs: u64,
    content_gateway: String,
    content_max_bytes: usize,
    strategy: ProposalStrategy,
    run_interval_secs: u64,
    fault_cooldown_secs: u64,
    confirmation_timeout_secs: u64,
    confirmation_poll_secs: u64,
    poll_interval_secs: u64,
    status_log_interval_secs: u64,
    manual_trigger_per_minute: u32,
    cors_origins: String,
}

/// Inference oracle settings
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Fully validated agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_address: String,
    pub ledger_url: String,
    pub ledger_contract: String,
    pub credential_mode: CredentialMode,
    pub agent_key_file: Option<PathBuf>,
    pub oracle: OracleConfig,
    pub content_gateway: String,
    pub content_max_bytes: usize,
    pub strategy: ProposalStrategy,
    pub run_interval: Duration,
    pub fault_cooldown: Duration,
    pub confirmation_timeout: Duration,
    pub confirmation_poll: Duration,
    /// Item-count polling period when the ledger endpoint is not streaming
    pub poll_interval: Duration,
    pub status_log_interval: Duration,
    pub manual_trigger_per_minute: u32,
    pub cors_origins: Vec<String>,
}

impl AgentConfig {
    /// Build the configuration from `RECONCILER_*` environment variables.
    ///
    /// Any failure here is a configuration fault: the process must not start.
    pub fn from_env() -> AppResult<Self> {
        let settings = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("ledger_contract", "")?
            .set_default("credential_mode", "static")?
            .set_default(
                "oracle_url",
                "https://generativelanguage.googleapis.com/v1beta",
            )?
            .set_default("oracle_model", "gemini-1.5-flash")?
            .set_default("oracle_timeout_secs", 180)?
            .set_default("content_gateway", "https://ipfs.io")?
            .set_default("content_max_bytes", 4 * 1024 * 1024)?
            .set_default("strategy", "all-at-once")?
            .set_default("run_interval_secs", 300)?
            .set_default("fault_cooldown_secs", 30)?
            .set_default("confirmation_timeout_secs", 120)?
            .set_default("confirmation_poll_secs", 3)?
            .set_default("poll_interval_secs", 15)?
            .set_default("status_log_interval_secs", 600)?
            .set_default("manual_trigger_per_minute", 6)?
            .set_default("cors_origins", "http://localhost:3000")?
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let raw: RawSettings = settings.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> AppResult<Self> {
        validate_ledger_url(&raw.ledger_url)?;

        if raw.oracle_timeout_secs == 0 {
            return Err(AppError::Config(
                "oracle_timeout_secs must be positive".to_string(),
            ));
        }
        if raw.run_interval_secs == 0 || raw.poll_interval_secs == 0 {
            return Err(AppError::Config(
                "run and poll intervals must be positive".to_string(),
            ));
        }
        if raw.manual_trigger_per_minute == 0 {
            return Err(AppError::Config(
                "manual_trigger_per_minute must be positive".to_string(),
            ));
        }

        Ok(Self {
            bind_address: raw.bind_address,
            ledger_url: raw.ledger_url,
            ledger_contract: raw.ledger_contract,
            credential_mode: raw.credential_mode,
            agent_key_file: raw
                .agent_key_file
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            oracle: OracleConfig {
                url: raw.oracle_url,
                model: raw.oracle_model,
                api_key: raw.oracle_api_key.filter(|key| !key.is_empty()),
                timeout: Duration::from_secs(raw.oracle_timeout_secs),
            },
            content_gateway: raw.content_gateway,
            content_max_bytes: raw.content_max_bytes,
            strategy: raw.strategy,
            run_interval: Duration::from_secs(raw.run_interval_secs),
            fault_cooldown: Duration::from_secs(raw.fault_cooldown_secs),
            confirmation_timeout: Duration::from_secs(raw.confirmation_timeout_secs),
            confirmation_poll: Duration::from_secs(raw.confirmation_poll_secs.max(1)),
            poll_interval: Duration::from_secs(raw.poll_interval_secs),
            status_log_interval: Duration::from_secs(raw.status_log_interval_secs.max(1)),
            manual_trigger_per_minute: raw.manual_trigger_per_minute,
            cors_origins: raw
                .cors_origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

fn validate_ledger_url(url: &str) -> AppResult<()> {
    let supported = ["ws://", "wss://", "http://", "https://"];
    if url.trim().is_empty() {
        return Err(AppError::Config("RECONCILER_LEDGER_URL must be set".to_string()));
    }
    if !supported.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(AppError::Config(format!(
            "Unsupported ledger endpoint scheme: {}",
            url
        )));
    }
    Ok(())
}
