use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    api::handler::AppState,
    config::AgentConfig,
    error::{AppError, AppResult},
    execution::{
        commit::{CommitConfig, CommitPipeline},
        signature::CredentialProvider,
    },
    ledger::rpc::{RpcConnectorFactory, RpcLedgerConfig},
    matching::{GeminiOracle, IpfsGateway, MatchProposer},
    reconcile::{
        scheduler::{ReconcileScheduler, ScheduleConfig},
        Reconciler,
    },
    recovery::{fault_channel, FaultSupervisor, GenerationHandle},
};

const CONTENT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Wired application plus the background tasks keeping it alive
pub struct Agent {
    pub state: AppState,
    pub tasks: Vec<JoinHandle<()>>,
}

pub async fn initialize_agent(config: &AgentConfig) -> AppResult<Agent> {
    info!("Initializing agent components ...");

    // Credential: a broken key refuses startup
    let credentials = CredentialProvider::from_config(config)?;
    let public_key = credentials.resolve()?.public_key_hex();
    info!(
        "✅ Agent credential loaded ({:?} mode), public key {}",
        config.credential_mode, public_key
    );

    // Inference oracle and content store
    let oracle = Arc::new(GeminiOracle::new(&config.oracle)?);
    let content = Arc::new(
        IpfsGateway::new(
            &config.content_gateway,
            config.content_max_bytes,
            CONTENT_FETCH_TIMEOUT,
        )
        .map_err(|e| AppError::Config(e.to_string()))?,
    );
    info!(
        "✅ Oracle {} at {} ({:?} strategy)",
        config.oracle.model, config.oracle.url, config.strategy
    );

    let proposer = MatchProposer::new(oracle, content, config.strategy, config.oracle.timeout);
    let pipeline = CommitPipeline::new(CommitConfig {
        confirmation_timeout: config.confirmation_timeout,
        poll_interval: config.confirmation_poll,
    });

    // Ledger generations and fault channel
    let generations = Arc::new(GenerationHandle::new());
    let (faults, reports) = fault_channel();

    let reconciler = Arc::new(Reconciler::new(
        generations.clone(),
        credentials,
        proposer,
        pipeline,
        config.ledger_contract.clone(),
        faults.clone(),
    ));

    let factory = Arc::new(RpcConnectorFactory::new(RpcLedgerConfig {
        endpoint: config.ledger_url.clone(),
        contract: config.ledger_contract.clone(),
        poll_interval: config.poll_interval,
        ..RpcLedgerConfig::default()
    }));
    let supervisor = Arc::new(FaultSupervisor::new(
        factory,
        generations,
        faults,
        config.fault_cooldown,
    ));

    info!("⚙️  Connecting to ledger at {}", config.ledger_url);
    let mut tasks = vec![supervisor.start(reconciler.clone(), reports).await];

    let scheduler = ReconcileScheduler::new(
        ScheduleConfig {
            run_interval: config.run_interval,
            status_log_interval: config.status_log_interval,
        },
        reconciler.clone(),
        supervisor.clone(),
    );
    tasks.extend(scheduler.start());
    info!("✅ Reconciliation scheduler started");

    Ok(Agent {
        state: AppState {
            reconciler,
            supervisor,
            strategy: config.strategy,
            contract: config.ledger_contract.clone(),
        },
        tasks,
    })
}
