//! JSON-RPC ledger connector
//!
//! `ws://` / `wss://` endpoints get a single WebSocket carrying both calls and
//! subscription notifications. `http://` / `https://` endpoints are called per
//! request and notifications are emulated by polling the item count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;
use crate::ledger::connector::{ConnectorFactory, EventReceiver, LedgerConnector};
use crate::ledger::models::*;

const SUBSCRIPTION_METHOD: &str = "ledger_subscription";
const EVENT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RpcLedgerConfig {
    pub endpoint: String,
    pub contract: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RpcLedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8546".to_string(),
            contract: String::new(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(15),
        }
    }
}

/// JSON-RPC envelope for both responses and notifications
#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcErrorObject>,
    method: Option<String>,
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItem {
    id: u64,
    reporter: String,
    is_lost: bool,
    title: String,
    description: String,
    #[serde(default)]
    content_ref: Option<String>,
}

impl From<RawItem> for Item {
    fn from(raw: RawItem) -> Self {
        Item {
            id: raw.id,
            reporter: raw.reporter,
            is_lost: raw.is_lost,
            title: raw.title,
            description: raw.description,
            content_ref: raw.content_ref.filter(|r| !r.trim().is_empty()),
        }
    }
}

fn request_envelope(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

fn into_result(envelope: RpcEnvelope) -> Result<Value, LedgerError> {
    if let Some(err) = envelope.error {
        return Err(LedgerError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    envelope
        .result
        .ok_or_else(|| LedgerError::Decode("response carries neither result nor error".to_string()))
}

fn value_as_u64(value: &Value) -> Result<u64, LedgerError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| LedgerError::Decode(format!("not an unsigned integer: {}", n))),
        Value::String(s) => s
            .parse::<u64>()
            .map_err(|_| LedgerError::Decode(format!("not an unsigned integer: {}", s))),
        other => Err(LedgerError::Decode(format!("expected integer, got {}", other))),
    }
}

fn parse_event(params: &Value) -> Option<LedgerEvent> {
    let result = params.get("result")?;
    match result.get("event")?.as_str()? {
        "ItemReported" => Some(LedgerEvent::ItemReported {
            id: value_as_u64(result.get("id")?).ok()?,
        }),
        "MatchFound" => Some(LedgerEvent::MatchFound {
            lost_id: value_as_u64(result.get("lostId")?).ok()?,
            found_id: value_as_u64(result.get("foundId")?).ok()?,
        }),
        _ => None,
    }
}

// ========== HTTP TRANSPORT ==========

#[derive(Clone)]
struct HttpRpc {
    client: reqwest::Client,
    endpoint: String,
    next_id: Arc<AtomicU64>,
}

impl HttpRpc {
    fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Connection(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request_envelope(id, method, params))
            .send()
            .await
            .map_err(|e| LedgerError::Connection(format!("{} failed: {}", method, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LedgerError::Connection(format!(
                "{} failed: node returned HTTP {}",
                method, status
            )));
        }
        if !status.is_success() {
            return Err(LedgerError::Rpc {
                code: i64::from(status.as_u16()),
                message: format!("{} rejected with HTTP {}", method, status),
            });
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(format!("{}: {}", method, e)))?;
        into_result(envelope)
    }
}

/// Emulated subscription: report every new slot as `ItemReported`.
///
/// The first count read is only a baseline, so items that already existed
/// are never reported.
async fn poll_item_count(
    http: HttpRpc,
    contract: String,
    period: Duration,
    events: mpsc::Sender<Result<LedgerEvent, LedgerError>>,
) {
    let params = json!({ "contract": contract });
    let mut baseline: Option<u64> = None;

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(ticker);

    while ticks.next().await.is_some() {
        if events.is_closed() {
            return;
        }

        let count = match http.call("ledger_itemCount", params.clone()).await {
            Ok(value) => value_as_u64(&value),
            Err(e) => Err(e),
        };

        match (count, baseline) {
            (Ok(count), Some(last)) if count > last => {
                for id in last.max(1)..count {
                    if events.send(Ok(LedgerEvent::ItemReported { id })).await.is_err() {
                        return;
                    }
                }
                baseline = Some(count);
            }
            (Ok(_), Some(_)) => {}
            (Ok(count), None) => {
                debug!("Item-count poller baseline: {}", count);
                baseline = Some(count);
            }
            (Err(e), _) if e.is_connection_fault() => {
                warn!("Item-count poller lost the ledger node: {}", e);
                let _ = events.send(Err(e)).await;
                return;
            }
            (Err(e), _) => warn!("Item-count poll failed: {}", e),
        }
    }
}

// ========== WEBSOCKET TRANSPORT ==========

type PendingCalls = HashMap<u64, oneshot::Sender<Result<Value, LedgerError>>>;

struct SocketCommand {
    id: u64,
    payload: String,
    respond_to: oneshot::Sender<Result<Value, LedgerError>>,
}

struct SocketRpc {
    commands: mpsc::Sender<SocketCommand>,
    events: parking_lot::Mutex<Option<EventReceiver>>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl SocketRpc {
    async fn open(endpoint: &str) -> Result<Self, LedgerError> {
        let (ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| LedgerError::Connection(format!("WebSocket connect failed: {}", e)))?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(socket_loop(ws, commands_rx, events_tx));

        Ok(Self {
            commands: commands_tx,
            events: parking_lot::Mutex::new(Some(events_rx)),
            next_id: AtomicU64::new(1),
            task,
        })
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        request_timeout: Duration,
    ) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (respond_to, response) = oneshot::channel();

        self.commands
            .send(SocketCommand {
                id,
                payload: request_envelope(id, method, params).to_string(),
                respond_to,
            })
            .await
            .map_err(|_| LedgerError::Connection("ledger socket closed".to_string()))?;

        match timeout(request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LedgerError::Connection(
                "ledger socket dropped the pending call".to_string(),
            )),
            Err(_) => Err(LedgerError::Connection(format!(
                "{} timed out after {:?}",
                method, request_timeout
            ))),
        }
    }
}

impl Drop for SocketRpc {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn socket_loop<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut commands: mpsc::Receiver<SocketCommand>,
    events: mpsc::Sender<Result<LedgerEvent, LedgerError>>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut pending: PendingCalls = HashMap::new();

    let fault = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = sink.send(Message::Text(command.payload)).await {
                        let _ = command.respond_to.send(Err(LedgerError::Connection(e.to_string())));
                        break format!("send failed: {}", e);
                    }
                    pending.insert(command.id, command.respond_to);
                }
                None => {
                    // Connector dropped: orderly shutdown, nobody left to notify.
                    let _ = sink.close().await;
                    return;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => dispatch(&text, &mut pending, &events),
                Some(Ok(Message::Close(frame))) => {
                    break format!("closed by node: {:?}", frame);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            },
        }
    };

    error!("Ledger socket fault: {}", fault);
    for (_, respond_to) in pending.drain() {
        let _ = respond_to.send(Err(LedgerError::Connection(fault.clone())));
    }
    let _ = events.send(Err(LedgerError::Connection(fault))).await;
}

fn dispatch(
    text: &str,
    pending: &mut PendingCalls,
    events: &mpsc::Sender<Result<LedgerEvent, LedgerError>>,
) {
    let envelope: RpcEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Ignoring undecodable ledger message: {}", e);
            return;
        }
    };

    if let Some(id) = envelope.id {
        match pending.remove(&id) {
            Some(respond_to) => {
                let _ = respond_to.send(into_result(envelope));
            }
            None => debug!("Response for unknown call id {}", id),
        }
        return;
    }

    if envelope.method.as_deref() != Some(SUBSCRIPTION_METHOD) {
        return;
    }

    match envelope.params.as_ref().and_then(parse_event) {
        Some(event) => {
            // A full channel already holds a pending trigger; dropping is harmless.
            if events.try_send(Ok(event)).is_err() {
                debug!("Ledger event channel full, dropping notification");
            }
        }
        None => warn!("Unrecognised ledger notification: {}", text),
    }
}

// ========== CONNECTOR ==========

enum Transport {
    Http(HttpRpc),
    Socket(SocketRpc),
}

/// Ledger connector speaking JSON-RPC to a single node
pub struct RpcLedger {
    config: RpcLedgerConfig,
    transport: Transport,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RpcLedger {
    /// Open a connection and probe it with an item-count read.
    pub async fn connect(config: RpcLedgerConfig) -> Result<Self, LedgerError> {
        let mode = ConnectionMode::for_endpoint(&config.endpoint);
        info!("Connecting to ledger node at {} ({:?})", config.endpoint, mode);

        let transport = match mode {
            ConnectionMode::Streaming => Transport::Socket(SocketRpc::open(&config.endpoint).await?),
            ConnectionMode::Polling => {
                Transport::Http(HttpRpc::new(&config.endpoint, config.request_timeout)?)
            }
        };

        let ledger = Self {
            config,
            transport,
            poller: parking_lot::Mutex::new(None),
        };

        let count = ledger.item_count().await?;
        info!("Ledger node reachable, {} item slots", count);

        Ok(ledger)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        match &self.transport {
            Transport::Http(http) => http.call(method, params).await,
            Transport::Socket(socket) => {
                socket
                    .call(method, params, self.config.request_timeout)
                    .await
            }
        }
    }

    fn contract_params(&self) -> Value {
        json!({ "contract": self.config.contract })
    }
}

impl Drop for RpcLedger {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
    }
}

#[async_trait]
impl LedgerConnector for RpcLedger {
    fn mode(&self) -> ConnectionMode {
        match self.transport {
            Transport::Http(_) => ConnectionMode::Polling,
            Transport::Socket(_) => ConnectionMode::Streaming,
        }
    }

    async fn item_count(&self) -> Result<u64, LedgerError> {
        let value = self.call("ledger_itemCount", self.contract_params()).await?;
        value_as_u64(&value)
    }

    async fn get_item(&self, id: u64) -> Result<Item, LedgerError> {
        let value = self
            .call(
                "ledger_getItem",
                json!({ "contract": self.config.contract, "id": id }),
            )
            .await?;

        if value.is_null() {
            return Err(LedgerError::ItemNotFound(id));
        }

        let raw: RawItem = serde_json::from_value(value)
            .map_err(|e| LedgerError::Decode(format!("item {}: {}", id, e)))?;
        Ok(raw.into())
    }

    async fn match_status(&self, id: u64) -> Result<u64, LedgerError> {
        let value = self
            .call(
                "ledger_matchStatus",
                json!({ "contract": self.config.contract, "id": id }),
            )
            .await?;
        value_as_u64(&value)
    }

    async fn record_match(&self, submission: &SignedMatch) -> Result<String, LedgerError> {
        let params = serde_json::to_value(submission)
            .map_err(|e| LedgerError::Decode(format!("submission encoding: {}", e)))?;
        let value = self.call("ledger_recordMatch", params).await?;

        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LedgerError::Decode(format!("expected tx reference, got {}", value)))
    }

    async fn transaction_status(&self, tx_ref: &str) -> Result<TxStatus, LedgerError> {
        let value = self
            .call(
                "ledger_getTransactionStatus",
                json!({ "contract": self.config.contract, "txRef": tx_ref }),
            )
            .await?;

        serde_json::from_value(value)
            .map_err(|e| LedgerError::Decode(format!("transaction status: {}", e)))
    }

    async fn subscribe(&self) -> Result<EventReceiver, LedgerError> {
        match &self.transport {
            Transport::Socket(socket) => {
                let receiver = socket.events.lock().take().ok_or_else(|| {
                    LedgerError::Decode("ledger events already subscribed".to_string())
                })?;

                for topic in ["ItemReported", "MatchFound"] {
                    let subscription = self
                        .call(
                            "ledger_subscribe",
                            json!({ "contract": self.config.contract, "event": topic }),
                        )
                        .await?;
                    info!("Subscribed to {} (subscription {})", topic, subscription);
                }

                Ok(receiver)
            }
            Transport::Http(http) => {
                let mut poller = self.poller.lock();
                if poller.is_some() {
                    return Err(LedgerError::Decode(
                        "ledger events already subscribed".to_string(),
                    ));
                }

                let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
                *poller = Some(tokio::spawn(poll_item_count(
                    http.clone(),
                    self.config.contract.clone(),
                    self.config.poll_interval,
                    events_tx,
                )));

                info!(
                    "Polling ledger item count every {:?} in place of a subscription",
                    self.config.poll_interval
                );
                Ok(events_rx)
            }
        }
    }
}

/// Factory producing fresh [`RpcLedger`] connections
pub struct RpcConnectorFactory {
    config: RpcLedgerConfig,
}

impl RpcConnectorFactory {
    pub fn new(config: RpcLedgerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectorFactory for RpcConnectorFactory {
    async fn connect(&self) -> Result<Arc<dyn LedgerConnector>, LedgerError> {
        let ledger = RpcLedger::connect(self.config.clone()).await?;
        Ok(Arc::new(ledger))
    }
}
