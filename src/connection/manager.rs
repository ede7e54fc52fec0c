//! Connection Manager (§4.2): one WebSocket session with combined-stream
//! multiplexing, Binance-family heartbeat, exponential-backoff reconnect,
//! and debounced stream add/remove.
//!
//! Grounded in the teacher's `collector/runner.rs::run_ws_loop` (connect,
//! subscribe, read loop, reconnect-on-error), restructured into an owned
//! object with the reader/writer/heartbeat task split §5 requires instead
//! of one inline loop, and the teacher's `master_sender.rs::MasterSender`
//! (reconnect-safe, queue-backed sender) for the writer-task shape.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::ConnectionPolicy;
use crate::connection::backoff;
use crate::connection::events::CmEvent;
use crate::connection::transport::{Connector, InboundFrame, OutboundFrame, WsReader, WsWriter};
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
    Error,
}

#[derive(Default)]
pub struct ConnectionMetrics {
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub messages_recv: AtomicUsize,
    pub reconnect_attempts: AtomicU32,
    pub last_ping_ts: AtomicI64,
    pub rtt_ms: AtomicI64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ConnectionMetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub messages_recv: usize,
    pub reconnect_attempts: u32,
    pub last_ping_ts: i64,
    pub rtt_ms: i64,
}

impl ConnectionMetrics {
    fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            messages_recv: self.messages_recv.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_ping_ts: self.last_ping_ts.load(Ordering::Relaxed),
            rtt_ms: self.rtt_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Health {
    pub healthy: bool,
    pub state: ConnectionState,
    pub millis_since_last_frame: i64,
    pub error_rate_per_min: f64,
}

enum Command {
    AddStream(String),
    RemoveStream(String),
    Send(Value),
    Ping(oneshot::Sender<EngineResult<Duration>>),
    ForceReconnect,
    Shutdown(oneshot::Sender<()>),
}

struct PendingPing {
    payload: Vec<u8>,
    started_at: Instant,
    reply: Option<oneshot::Sender<EngineResult<Duration>>>,
}

/// Builds the Binance-family combined-stream URL: `<base>/stream?streams=a/b/c`.
/// A single stream is still wrapped in the combined form (§4.2: "either form
/// is acceptable; combined is default").
pub fn build_combined_url(base_url: &str, streams: &HashSet<String>) -> String {
    let mut names: Vec<&str> = streams.iter().map(String::as_str).collect();
    names.sort_unstable();
    format!("{base_url}/stream?streams={}", names.join("/"))
}

pub struct ConnectionManager {
    pub id: String,
    base_url: String,
    connector: Arc<dyn Connector>,
    policy: ConnectionPolicy,
    clock: Arc<dyn Clock>,

    state: RwLock<ConnectionState>,
    active_streams: RwLock<HashSet<String>>,
    intent_streams: Mutex<HashSet<String>>,
    last_frame_at: AtomicI64,
    error_count: AtomicUsize,
    started_at_ms: i64,

    pub metrics: ConnectionMetrics,
    events_tx: broadcast::Sender<CmEvent>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    driver_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
}

impl ConnectionManager {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ConnectionPolicy,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(1024);
        let now = clock.now_ms();
        Arc::new(Self {
            id: id.into(),
            base_url: base_url.into(),
            connector,
            policy,
            clock,
            state: RwLock::new(ConnectionState::Idle),
            active_streams: RwLock::new(HashSet::new()),
            intent_streams: Mutex::new(HashSet::new()),
            last_frame_at: AtomicI64::new(now),
            error_count: AtomicUsize::new(0),
            started_at_ms: now,
            metrics: ConnectionMetrics::default(),
            events_tx,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            driver_handle: Mutex::new(None),
            shutdown: Notify::new(),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CmEvent> {
        self.events_tx.subscribe()
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn active_streams(&self) -> HashSet<String> {
        self.active_streams.read().await.clone()
    }

    fn emit(&self, event: CmEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn set_state(&self, to: ConnectionState) {
        let mut guard = self.state.write().await;
        let from = *guard;
        if from == to {
            return;
        }
        *guard = to;
        drop(guard);
        self.emit(CmEvent::StateChange { from, to });
    }

    /// Starts the CM's long-lived driver task, which itself owns
    /// reader/writer/heartbeat sub-tasks for the current socket (§5). Each
    /// call to `connect` may only be issued once per `ConnectionManager`.
    pub async fn connect(self: &Arc<Self>, initial_streams: HashSet<String>) -> EngineResult<()> {
        {
            let mut intent = self.intent_streams.lock().await;
            *intent = initial_streams;
        }
        let mut rx_slot = self.command_rx.lock().await;
        let command_rx = rx_slot.take().ok_or_else(|| {
            EngineError::FatalInit { message: format!("connection {} already started", self.id) }
        })?;
        drop(rx_slot);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.drive(command_rx).await });
        *self.driver_handle.lock().await = Some(handle);
        Ok(())
    }

    pub fn add_stream(&self, name: impl Into<String>) {
        let _ = self.command_tx.send(Command::AddStream(name.into()));
    }

    pub fn remove_stream(&self, name: impl Into<String>) {
        let _ = self.command_tx.send(Command::RemoveStream(name.into()));
    }

    pub async fn send(&self, msg: Value) -> EngineResult<()> {
        self.command_tx
            .send(Command::Send(msg))
            .map_err(|_| EngineError::transport("connection manager driver has stopped"))
    }

    /// Sends an outbound ping and waits for the matching pong, returning the
    /// measured RTT (§4.2: "CM MUST measure RTT from its own outbound ping").
    pub async fn ping(&self) -> EngineResult<Duration> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Ping(tx))
            .map_err(|_| EngineError::transport("connection manager driver has stopped"))?;
        rx.await.map_err(|_| EngineError::Timeout { millis: self.policy.heartbeat_timeout_ms })?
    }

    pub async fn reconnect(&self) -> EngineResult<()> {
        self.command_tx
            .send(Command::ForceReconnect)
            .map_err(|_| EngineError::transport("connection manager driver has stopped"))
    }

    /// Composite health check: state + heartbeat freshness + error rate, all
    /// pure (no I/O) so Control Surface can call it without blocking ingress.
    pub async fn healthcheck(&self) -> Health {
        let state = self.state().await;
        let now = self.clock.now_ms();
        let millis_since_last_frame = now - self.last_frame_at.load(Ordering::Relaxed);
        let uptime_min = ((now - self.started_at_ms).max(1) as f64) / 60_000.0;
        let error_rate_per_min = self.error_count.load(Ordering::Relaxed) as f64 / uptime_min;

        let healthy = matches!(state, ConnectionState::Connected)
            && millis_since_last_frame < self.policy.heartbeat_timeout_ms as i64
            && error_rate_per_min < 10.0;

        Health { healthy, state, millis_since_last_frame, error_rate_per_min }
    }

    pub fn metrics_snapshot(&self) -> ConnectionMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn destroy(&self, grace: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = tokio::time::timeout(grace, rx).await;
        }
        self.shutdown.notify_waiters();
        if let Some(handle) = self.driver_handle.lock().await.take() {
            handle.abort();
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// The CM's own long-lived task: owns `active_streams` exclusively
    /// (§3 invariant), processes commands, and supervises one connection
    /// attempt at a time, reconnecting with backoff on failure.
    async fn drive(self: Arc<Self>, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let mut attempt: u32 = 0;
        let pending_ping: Arc<Mutex<Option<PendingPing>>> = Arc::new(Mutex::new(None));

        'reconnect: loop {
            self.set_state(ConnectionState::Connecting).await;
            let intent = self.intent_streams.lock().await.clone();
            let url = build_combined_url(&self.base_url, &intent);

            let connected = match self.connector.connect(&url).await {
                Ok(pair) => pair,
                Err(e) => {
                    attempt += 1;
                    self.metrics.reconnect_attempts.store(attempt, Ordering::Relaxed);
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    self.emit(CmEvent::Error { kind: e.kind(), message: e.to_string() });
                    if attempt > self.policy.max_retries {
                        self.set_state(ConnectionState::Error).await;
                        return;
                    }
                    self.set_state(ConnectionState::Reconnecting).await;
                    self.emit(CmEvent::Reconnecting { attempt });
                    tokio::time::sleep(backoff::delay_for(&self.policy, attempt - 1)).await;
                    continue 'reconnect;
                }
            };
            let (mut writer, mut reader) = connected;

            *self.active_streams.write().await = intent.clone();
            self.last_frame_at.store(self.clock.now_ms(), Ordering::Relaxed);
            self.set_state(ConnectionState::Connected).await;
            if attempt > 0 {
                self.emit(CmEvent::Reconnected);
            }
            attempt = 0;
            self.metrics.reconnect_attempts.store(0, Ordering::Relaxed);

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
            let (in_tx, mut in_rx) = mpsc::unbounded_channel::<InboundFrame>();
            let socket_closed = Arc::new(Notify::new());

            // Writer task: drains the outbound queue onto the socket.
            let writer_closed = socket_closed.clone();
            let writer_task: JoinHandle<()> = tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                let _ = writer.close().await;
                writer_closed.notify_waiters();
            });

            // Reader task: drains the socket, forwards frames to the driver.
            let reader_closed = socket_closed.clone();
            let reader_task: JoinHandle<()> = tokio::spawn(async move {
                loop {
                    match reader.recv().await {
                        Some(Ok(frame)) => {
                            let is_close = matches!(frame, InboundFrame::Close);
                            if in_tx.send(frame).is_err() || is_close {
                                break;
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
                reader_closed.notify_waiters();
            });

            // Heartbeat task: liveness watchdog only; the mandatory
            // ping-echo happens inline in the driver loop below so it can
            // never be delayed behind a stalled heartbeat tick.
            let heartbeat_policy = self.policy.clone();
            let heartbeat_cm = Arc::clone(&self);
            let heartbeat_closed = socket_closed.clone();
            let heartbeat_task: JoinHandle<()> = tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(
                    heartbeat_policy.heartbeat_timeout_ms / 3,
                ));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let now = heartbeat_cm.clock.now_ms();
                            let since = now - heartbeat_cm.last_frame_at.load(Ordering::Relaxed);
                            if since > heartbeat_policy.heartbeat_timeout_ms as i64 {
                                heartbeat_cm.emit(CmEvent::Error {
                                    kind: "heartbeat_timeout",
                                    message: format!("no frame for {since}ms"),
                                });
                                heartbeat_closed.notify_waiters();
                                return;
                            }
                        }
                        _ = heartbeat_closed.notified() => return,
                    }
                }
            });

            let mut debounce_deadline: Option<tokio::time::Instant> = None;

            let socket_error = 'connection: loop {
                let debounce_sleep = async {
                    match debounce_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    biased;

                    _ = socket_closed.notified() => {
                        break 'connection true;
                    }

                    maybe_frame = in_rx.recv() => {
                        match maybe_frame {
                            Some(InboundFrame::Text(text)) => {
                                self.last_frame_at.store(self.clock.now_ms(), Ordering::Relaxed);
                                self.metrics.messages_recv.fetch_add(1, Ordering::Relaxed);
                                self.metrics.bytes_recv.fetch_add(text.len() as u64, Ordering::Relaxed);
                                match serde_json::from_str::<Value>(&text) {
                                    Ok(value) => self.emit(CmEvent::RawMessage(value)),
                                    Err(_) => {
                                        // Malformed envelope JSON: handled locally
                                        // (§4.2 failure taxonomy), never tears down
                                        // the connection.
                                        self.error_count.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                            }
                            Some(InboundFrame::Ping(payload)) => {
                                self.last_frame_at.store(self.clock.now_ms(), Ordering::Relaxed);
                                // Mandatory byte-exact pong reply (§4.2).
                                let _ = out_tx.send(OutboundFrame::Pong(payload));
                            }
                            Some(InboundFrame::Pong(payload)) => {
                                self.last_frame_at.store(self.clock.now_ms(), Ordering::Relaxed);
                                let mut pending = pending_ping.lock().await;
                                if let Some(p) = pending.take() {
                                    if p.payload == payload {
                                        let rtt = p.started_at.elapsed();
                                        self.metrics.rtt_ms.store(rtt.as_millis() as i64, Ordering::Relaxed);
                                        if let Some(reply) = p.reply {
                                            let _ = reply.send(Ok(rtt));
                                        }
                                    } else {
                                        *pending = Some(p);
                                    }
                                }
                            }
                            Some(InboundFrame::Close) | None => break 'connection true,
                        }
                    }

                    _ = debounce_sleep => {
                        debounce_deadline = None;
                        let intent = self.intent_streams.lock().await.clone();
                        let active = self.active_streams.read().await.clone();
                        if intent != active {
                            break 'connection false; // reconnect with the new intent set
                        }
                    }

                    command = command_rx.recv() => {
                        match command {
                            Some(Command::AddStream(name)) => {
                                self.intent_streams.lock().await.insert(name.clone());
                                self.emit(CmEvent::StreamAdded(name));
                                debounce_deadline = Some(tokio::time::Instant::now() + Duration::from_millis(self.policy.debounce_ms));
                            }
                            Some(Command::RemoveStream(name)) => {
                                self.intent_streams.lock().await.remove(&name);
                                self.emit(CmEvent::StreamRemoved(name));
                                debounce_deadline = Some(tokio::time::Instant::now() + Duration::from_millis(self.policy.debounce_ms));
                            }
                            Some(Command::Send(value)) => {
                                let text = value.to_string();
                                self.metrics.bytes_sent.fetch_add(text.len() as u64, Ordering::Relaxed);
                                let _ = out_tx.send(OutboundFrame::Text(text));
                            }
                            Some(Command::Ping(reply)) => {
                                let payload: Vec<u8> = self.clock.now_ms().to_le_bytes().to_vec();
                                *pending_ping.lock().await = Some(PendingPing {
                                    payload: payload.clone(),
                                    started_at: Instant::now(),
                                    reply: Some(reply),
                                });
                                self.metrics.last_ping_ts.store(self.clock.now_ms(), Ordering::Relaxed);
                                let _ = out_tx.send(OutboundFrame::Ping(payload));
                            }
                            Some(Command::ForceReconnect) => break 'connection false,
                            Some(Command::Shutdown(ack)) => {
                                self.set_state(ConnectionState::Disconnecting).await;
                                drop(out_tx);
                                socket_closed.notify_waiters();
                                let _ = ack.send(());
                                writer_task.abort();
                                reader_task.abort();
                                heartbeat_task.abort();
                                return;
                            }
                            None => break 'connection true,
                        }
                    }
                }
            };

            writer_task.abort();
            reader_task.abort();
            heartbeat_task.abort();

            if socket_error {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
            self.set_state(ConnectionState::Reconnecting).await;
            self.emit(CmEvent::Reconnecting { attempt: attempt + 1 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::connection::transport::mock::MockConnector;

    fn test_policy() -> ConnectionPolicy {
        ConnectionPolicy {
            max_streams_per_connection: 10,
            debounce_ms: 20,
            heartbeat_timeout_ms: 500,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_multiplier: 2.0,
            full_jitter: false,
            max_retries: 5,
        }
    }

    #[tokio::test]
    async fn connect_establishes_active_streams_from_intent() {
        let connector = MockConnector::new(0);
        let mut incoming = connector.next_connection();
        let clock = TestClock::new(0);
        let cm = ConnectionManager::new("c1", "wss://example", connector, test_policy(), clock);

        let mut intent = HashSet::new();
        intent.insert("btcusdt@trade".to_string());
        cm.connect(intent.clone()).await.unwrap();

        let _handle = incoming.recv().await.expect("mock connection established");
        // give the driver a beat to flip state after connecting
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cm.state().await, ConnectionState::Connected);
        assert_eq!(cm.active_streams().await, intent);
    }

    #[tokio::test]
    async fn ping_echoes_byte_exact_pong_payload() {
        let connector = MockConnector::new(0);
        let mut incoming = connector.next_connection();
        let clock = TestClock::new(0);
        let cm = ConnectionManager::new("c1", "wss://example", connector, test_policy(), clock);
        cm.connect(HashSet::new()).await.unwrap();
        let mut handle = incoming.recv().await.unwrap();

        // Simulate the server sending an application ping; the driver must
        // reply with a pong carrying the identical payload.
        let payload = vec![1, 2, 3, 4, 5];
        handle.to_client.send(InboundFrame::Ping(payload.clone())).unwrap();

        let echoed = tokio::time::timeout(Duration::from_millis(200), handle.from_client.recv())
            .await
            .expect("pong should arrive before timeout")
            .expect("writer channel open");

        match echoed {
            OutboundFrame::Pong(p) => assert_eq!(p, payload),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_stream_converges_active_set_after_debounce() {
        let connector = MockConnector::new(0);
        let mut incoming = connector.next_connection();
        let clock = TestClock::new(0);
        let cm = ConnectionManager::new("c1", "wss://example", connector, test_policy(), clock);
        cm.connect(HashSet::new()).await.unwrap();
        let _first = incoming.recv().await.unwrap();

        cm.add_stream("ethusdt@trade");
        // Reconnect happens debounce_ms after the add; the mock hands back a
        // second handle once the driver reconnects with the new stream set.
        let _second = tokio::time::timeout(Duration::from_millis(500), incoming.recv())
            .await
            .expect("reconnect should happen within the debounce window");

        let active = cm.active_streams().await;
        assert!(active.contains("ethusdt@trade"));
    }
}
