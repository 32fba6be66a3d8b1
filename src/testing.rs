//! In-memory fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CredentialMode;
use crate::error::{ContentError, LedgerError, OracleError, ALREADY_MATCHED_CODE};
use crate::execution::commit::{CommitConfig, CommitPipeline};
use crate::execution::signature::{verify_match_signature, AgentCredential, CredentialProvider, KeySource};
use crate::ledger::connector::{ConnectorFactory, EventReceiver, LedgerConnector};
use crate::ledger::models::*;
use crate::matching::content::{Content, ContentStore};
use crate::matching::oracle::InferenceOracle;
use crate::matching::prompt::{MatchResponse, OracleRequest, ProposedMatch};
use crate::matching::{MatchProposer, ProposalStrategy};
use crate::reconcile::Reconciler;
use crate::recovery::{fault_channel, FaultSupervisor, GenerationHandle};

pub const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
pub const CONTRACT: &str = "0xlostfound";

pub fn credential() -> AgentCredential {
    AgentCredential::from_hex(SEED).unwrap()
}

pub fn lost_item(id: u64, title: &str) -> Item {
    Item {
        id,
        reporter: format!("0xreporter{}", id),
        is_lost: true,
        title: title.to_string(),
        description: format!("{} reported lost", title),
        content_ref: None,
    }
}

pub fn found_item(id: u64, title: &str) -> Item {
    Item {
        is_lost: false,
        description: format!("{} handed in", title),
        ..lost_item(id, title)
    }
}

impl Item {
    pub fn with_content(mut self, reference: &str) -> Self {
        self.content_ref = Some(reference.to_string());
        self
    }
}

/// Poll `condition` until it holds. Under a paused clock each poll advances time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

// ========== LEDGER ==========

type EventSender = mpsc::Sender<Result<LedgerEvent, LedgerError>>;

struct LedgerState {
    /// Index is the item id; slot 0 is the sentinel
    items: Vec<Option<Item>>,
    links: HashMap<u64, u64>,
    submissions: Vec<SignedMatch>,
    hold_confirmations: bool,
    refuse_connections: bool,
    connections: usize,
    /// Connectors opened under an older epoch have been severed
    epoch: u64,
    sever_after: Option<usize>,
    /// Subscriptions that fail as soon as they are opened
    broken_streams: usize,
    subscribers: Vec<(u64, EventSender)>,
}

impl LedgerState {
    fn sever(&mut self) {
        let severed = self.epoch;
        self.epoch += 1;
        self.sever_after = None;
        self.subscribers.retain(|(epoch, events)| {
            if *epoch == severed {
                let _ = events.try_send(Err(LedgerError::Connection(
                    "connection reset by peer".to_string(),
                )));
                false
            } else {
                true
            }
        });
    }

    fn emit(&mut self, event: LedgerEvent) {
        let epoch = self.epoch;
        self.subscribers.retain(|(e, events)| {
            *e == epoch && events.try_send(Ok(event.clone())).is_ok()
        });
    }

    fn push(&mut self, mut item: Item) -> u64 {
        let id = self.items.len() as u64;
        item.id = id;
        self.items.push(Some(item));
        self.emit(LedgerEvent::ItemReported { id });
        id
    }
}

/// In-memory ledger node. Clones share state.
#[derive(Clone)]
pub struct FakeLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                items: vec![None],
                links: HashMap::new(),
                submissions: Vec::new(),
                hold_confirmations: false,
                refuse_connections: false,
                connections: 0,
                epoch: 0,
                sever_after: None,
                broken_streams: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// lost#1 "Red Wallet" and found#2 "Red Wallet"
    pub fn with_red_wallets() -> Self {
        let ledger = Self::new();
        ledger.report_lost("Red Wallet");
        ledger.report_found("Red Wallet");
        ledger
    }

    pub fn report_lost(&self, title: &str) -> u64 {
        self.state.lock().push(lost_item(0, title))
    }

    pub fn report_found(&self, title: &str) -> u64 {
        self.state.lock().push(found_item(0, title))
    }

    /// Link two items directly, bypassing submission
    pub fn link(&self, a: u64, b: u64) {
        let mut state = self.state.lock();
        state.links.insert(a, b);
        state.links.insert(b, a);
    }

    pub fn matched_with(&self, id: u64) -> Option<u64> {
        self.state.lock().links.get(&id).copied()
    }

    pub fn submissions(&self) -> Vec<SignedMatch> {
        self.state.lock().submissions.clone()
    }

    pub fn hold_confirmations(&self) {
        self.state.lock().hold_confirmations = true;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Reset every open connection now
    pub fn sever(&self) {
        self.state.lock().sever();
    }

    /// Let `calls` more calls through, then reset every open connection
    pub fn sever_after(&self, calls: usize) {
        self.state.lock().sever_after = Some(calls);
    }

    /// The next `count` subscriptions deliver a connection fault straight away
    pub fn break_next_streams(&self, count: usize) {
        self.state.lock().broken_streams = count;
    }

    pub fn connector(&self) -> Arc<dyn LedgerConnector> {
        let mut state = self.state.lock();
        state.connections += 1;
        Arc::new(FakeConnector {
            epoch: state.epoch,
            state: self.state.clone(),
        })
    }

    pub fn factory(&self) -> Arc<dyn ConnectorFactory> {
        Arc::new(FakeFactory {
            ledger: self.clone(),
        })
    }
}

struct FakeFactory {
    ledger: FakeLedger,
}

#[async_trait]
impl ConnectorFactory for FakeFactory {
    async fn connect(&self) -> Result<Arc<dyn LedgerConnector>, LedgerError> {
        if self.ledger.state.lock().refuse_connections {
            return Err(LedgerError::Connection("connection refused".to_string()));
        }
        Ok(self.ledger.connector())
    }
}

struct FakeConnector {
    epoch: u64,
    state: Arc<Mutex<LedgerState>>,
}

impl FakeConnector {
    /// Run `f` against the ledger unless this connection has been reset
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut state = self.state.lock();
        let reset = || LedgerError::Connection("connection reset by peer".to_string());

        if state.epoch != self.epoch {
            return Err(reset());
        }
        match state.sever_after {
            Some(0) => {
                state.sever();
                return Err(reset());
            }
            Some(remaining) => state.sever_after = Some(remaining - 1),
            None => {}
        }
        f(&mut state)
    }
}

#[async_trait]
impl LedgerConnector for FakeConnector {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Streaming
    }

    async fn item_count(&self) -> Result<u64, LedgerError> {
        self.with_state(|state| Ok(state.items.len() as u64))
    }

    async fn get_item(&self, id: u64) -> Result<Item, LedgerError> {
        self.with_state(|state| {
            state
                .items
                .get(id as usize)
                .cloned()
                .flatten()
                .ok_or(LedgerError::ItemNotFound(id))
        })
    }

    async fn match_status(&self, id: u64) -> Result<u64, LedgerError> {
        self.with_state(|state| Ok(state.links.get(&id).copied().unwrap_or(UNMATCHED)))
    }

    async fn record_match(&self, submission: &SignedMatch) -> Result<String, LedgerError> {
        self.with_state(|state| {
            if !verify_match_signature(submission).unwrap_or(false) {
                return Err(LedgerError::Rpc {
                    code: -32602,
                    message: "bad signature".to_string(),
                });
            }
            if state.links.contains_key(&submission.lost_id)
                || state.links.contains_key(&submission.found_id)
            {
                return Err(LedgerError::Rpc {
                    code: ALREADY_MATCHED_CODE,
                    message: "execution reverted: item already matched".to_string(),
                });
            }

            state.links.insert(submission.lost_id, submission.found_id);
            state.links.insert(submission.found_id, submission.lost_id);
            state.submissions.push(submission.clone());
            state.emit(LedgerEvent::MatchFound {
                lost_id: submission.lost_id,
                found_id: submission.found_id,
            });
            Ok(format!("0xtx{:04}", state.submissions.len()))
        })
    }

    async fn transaction_status(&self, _tx_ref: &str) -> Result<TxStatus, LedgerError> {
        self.with_state(|state| {
            Ok(if state.hold_confirmations {
                TxStatus::Pending
            } else {
                TxStatus::Confirmed
            })
        })
    }

    async fn subscribe(&self) -> Result<EventReceiver, LedgerError> {
        self.with_state(|state| {
            let (events, receiver) = mpsc::channel(16);
            if state.broken_streams > 0 {
                state.broken_streams -= 1;
                let _ = events.try_send(Err(LedgerError::Connection(
                    "event stream dropped".to_string(),
                )));
            } else {
                let epoch = state.epoch;
                state.subscribers.push((epoch, events));
            }
            Ok(receiver)
        })
    }
}

// ========== ORACLE ==========

#[derive(Clone)]
pub enum Reply {
    Respond(MatchResponse),
    Fail(String),
    /// Never answers
    Hang,
}

impl Reply {
    pub fn propose(lost_id: u64, found_id: u64, confidence: &str) -> Self {
        Reply::Respond(MatchResponse {
            proposed: Some(ProposedMatch {
                lost_id,
                found_id,
                confidence: Some(confidence.to_string()),
            }),
        })
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Oracle answering from a script, then from a fixed fallback
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<OracleRequest>>,
    before_reply: Mutex<Option<Hook>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            fallback: Reply::Respond(MatchResponse::none()),
            requests: Mutex::new(Vec::new()),
            before_reply: Mutex::new(None),
        })
    }

    pub fn proposing(lost_id: u64, found_id: u64, confidence: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Reply::propose(lost_id, found_id, confidence),
            requests: Mutex::new(Vec::new()),
            before_reply: Mutex::new(None),
        })
    }

    pub fn no_match() -> Arc<Self> {
        Self::new(Vec::new())
    }

    /// Run `hook` on every call before replying
    pub fn before_reply(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.before_reply.lock() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl InferenceOracle for ScriptedOracle {
    async fn infer(&self, request: &OracleRequest) -> Result<MatchResponse, OracleError> {
        self.requests.lock().push(request.clone());
        if let Some(hook) = self.before_reply.lock().as_ref() {
            hook();
        }

        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Respond(response) => Ok(response),
            Reply::Fail(message) => Err(OracleError::Transport(message)),
            Reply::Hang => std::future::pending().await,
        }
    }
}

// ========== CONTENT ==========

#[derive(Default)]
pub struct FakeContentStore {
    blobs: Mutex<HashMap<String, Content>>,
    stalled: Mutex<Vec<String>>,
    fetches: AtomicUsize,
}

impl FakeContentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, reference: &str, mime_type: &str, bytes: Vec<u8>) {
        self.blobs.lock().insert(
            reference.to_string(),
            Content {
                mime_type: mime_type.to_string(),
                bytes,
            },
        );
    }

    /// Fetches of `reference` never complete
    pub fn stall(&self, reference: &str) {
        self.stalled.lock().push(reference.to_string());
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for FakeContentStore {
    async fn fetch(&self, reference: &str) -> Result<Content, ContentError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let stalled = self.stalled.lock().iter().any(|stalled| stalled == reference);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.blobs
            .lock()
            .get(reference)
            .cloned()
            .ok_or_else(|| ContentError::Fetch {
                reference: reference.to_string(),
                message: "gateway returned HTTP 404".to_string(),
            })
    }
}

// ========== WIRING ==========

pub struct Harness {
    pub reconciler: Arc<Reconciler>,
    pub supervisor: Arc<FaultSupervisor>,
    pub listener: JoinHandle<()>,
}

/// Reconciler and supervisor wired to fakes, first generation connected
pub async fn harness(ledger: &FakeLedger, oracle: Arc<ScriptedOracle>) -> Harness {
    let generations = Arc::new(GenerationHandle::new());
    let (faults, reports) = fault_channel();

    let credentials =
        CredentialProvider::new(KeySource::Inline(SEED.to_string()), CredentialMode::Static)
            .unwrap();
    let proposer = MatchProposer::new(
        oracle,
        FakeContentStore::new(),
        ProposalStrategy::AllAtOnce,
        Duration::from_secs(180),
    );
    let pipeline = CommitPipeline::new(CommitConfig {
        confirmation_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(100),
    });

    let reconciler = Arc::new(Reconciler::new(
        generations.clone(),
        credentials,
        proposer,
        pipeline,
        CONTRACT.to_string(),
        faults.clone(),
    ));
    let supervisor = Arc::new(FaultSupervisor::new(
        ledger.factory(),
        generations,
        faults,
        Duration::from_secs(30),
    ));
    let listener = supervisor.start(reconciler.clone(), reports).await;

    Harness {
        reconciler,
        supervisor,
        listener,
    }
}
