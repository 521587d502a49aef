//! Resilient JSON-RPC 2.0 client over WebSocket.
//!
//! One supervisor task owns the socket and routes frames; a heartbeat task
//! proves liveness and force-closes zombie connections. Callers correlate
//! requests to replies through a pending map of oneshot senders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use keel_config::TransportConfig;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::protocol::{RpcFrame, RpcRequest};

type HmacSha256 = Hmac<Sha256>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingMap = HashMap<u64, oneshot::Sender<TransportResult<Value>>>;

const SUBSCRIPTION_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 256;

/// API credentials consumed at connect time.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    /// HMAC-SHA256 signature over `{timestamp}\n{nonce}\n{data}`.
    fn sign(&self, timestamp: i64, nonce: &str, data: &str) -> TransportResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.client_secret.as_bytes())
            .map_err(|err| TransportError::Authentication(format!("signer init: {err}")))?;
        mac.update(format!("{timestamp}\n{nonce}\n{data}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Observable lifecycle of one client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
}

enum Outbound {
    Frame(String),
    ForceClose,
}

/// Handle to a live exchange connection. Cheap to clone; all clones share
/// the same socket, pending map and subscription set. The handles hold the
/// only strong ends of the outbound channel, so dropping the last one closes
/// the channel and the supervisor tears the connection down.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
    outbound_tx: mpsc::Sender<Outbound>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.shared.endpoint)
            .finish_non_exhaustive()
    }
}

struct Shared {
    endpoint: String,
    credentials: Credentials,
    config: TransportConfig,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    subscriptions: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    state_tx: watch::Sender<ConnectionState>,
    operator_latch: AtomicBool,
    last_inbound: Mutex<Instant>,
    // Weak so the background tasks never keep the channel alive themselves.
    outbound: mpsc::WeakSender<Outbound>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RpcClient {
    /// Dial, authenticate and start the supervisor and heartbeat tasks.
    pub async fn connect(
        endpoint: impl Into<String>,
        credentials: Credentials,
        config: TransportConfig,
    ) -> TransportResult<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            endpoint: endpoint.into(),
            credentials,
            config,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            state_tx,
            operator_latch: AtomicBool::new(false),
            last_inbound: Mutex::new(Instant::now()),
            outbound: outbound_tx.downgrade(),
        });

        let socket = shared.establish().await?;
        shared.set_state(ConnectionState::Ready);
        tokio::spawn(run_supervisor(Arc::clone(&shared), socket, outbound_rx));
        tokio::spawn(run_heartbeat(Arc::clone(&shared)));
        Ok(Self { shared, outbound_tx })
    }

    /// Issue one request and await its correlated reply.
    pub async fn call(&self, method: &str, params: Value) -> TransportResult<Value> {
        self.shared.call(method, params).await
    }

    /// Retry `call` with exponential backoff, but only for transient
    /// failure kinds. Business rejections surface immediately.
    pub async fn call_with_retry(
        &self,
        method: &str,
        params: Value,
        max_attempts: u32,
    ) -> TransportResult<Value> {
        let mut delay = self.shared.config.initial_reconnect_delay();
        let mut attempt = 1;
        loop {
            match self.shared.call(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(method, attempt, error = %err, "retrying transient failure");
                    tokio::time::sleep(delay).await;
                    delay = (delay.mul_f64(self.shared.config.backoff_multiplier))
                        .min(self.shared.config.max_reconnect_delay());
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Subscribe to a push channel. Repeat subscriptions to the same channel
    /// share one upstream subscription and fan out locally.
    pub async fn subscribe(&self, channel: &str) -> TransportResult<broadcast::Receiver<Value>> {
        if let Some(tx) = lock(&self.shared.subscriptions).get(channel) {
            return Ok(tx.subscribe());
        }
        self.shared
            .call("private/subscribe", json!({ "channels": [channel] }))
            .await?;
        let mut subs = lock(&self.shared.subscriptions);
        let tx = subs
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0);
        Ok(tx.subscribe())
    }

    /// Operator-initiated disconnect. Latches the client: no reconnect will
    /// ever be attempted; a fresh `connect` is required afterwards.
    pub async fn disconnect(&self) {
        self.shared.operator_latch.store(true, Ordering::SeqCst);
        let mut state_rx = self.shared.state_tx.subscribe();
        let _ = self.outbound_tx.send(Outbound::ForceClose).await;
        while *state_rx.borrow() != ConnectionState::Disconnected {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch every state transition (used by reconnect-aware callers).
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    async fn call(&self, method: &str, params: Value) -> TransportResult<Value> {
        if self.operator_latch.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost(
                "client was disconnected by operator".into(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let text = match serde_json::to_string(&RpcRequest::new(id, method, params)) {
            Ok(text) => text,
            Err(err) => {
                lock(&self.pending).remove(&id);
                return Err(TransportError::InvalidParams(err.to_string()));
            }
        };
        let Some(outbound) = self.outbound.upgrade() else {
            lock(&self.pending).remove(&id);
            return Err(TransportError::ConnectionLost(
                "all client handles dropped".into(),
            ));
        };
        if outbound.send(Outbound::Frame(text)).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(TransportError::ConnectionLost("writer task gone".into()));
        }

        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::ConnectionLost(
                "connection dropped before reply".into(),
            )),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Dial + authenticate + heartbeat setup + subscription replay. Used for
    /// the initial connect and for every reconnect attempt.
    async fn establish(&self) -> TransportResult<WsStream> {
        self.set_state(ConnectionState::Connecting);
        let (mut socket, _) = connect_async(&self.endpoint)
            .await
            .map_err(|err| TransportError::ConnectionLost(err.to_string()))?;

        self.set_state(ConnectionState::Authenticating);
        self.authenticate(&mut socket).await?;
        self.configure_server_heartbeat(&mut socket).await?;
        self.replay_subscriptions(&mut socket).await?;
        *lock(&self.last_inbound) = Instant::now();
        Ok(socket)
    }

    async fn authenticate(&self, socket: &mut WsStream) -> TransportResult<()> {
        let timestamp = Utc::now().timestamp_millis();
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let signature = self.credentials.sign(timestamp, &nonce, "")?;
        self.request_on(
            socket,
            "public/auth",
            json!({
                "grant_type": "client_signature",
                "client_id": self.credentials.client_id,
                "timestamp": timestamp,
                "nonce": nonce,
                "data": "",
                "signature": signature,
            }),
        )
        .await
        .map_err(|err| match err {
            TransportError::Unknown { message, .. } => TransportError::Authentication(message),
            other => other,
        })?;
        Ok(())
    }

    async fn configure_server_heartbeat(&self, socket: &mut WsStream) -> TransportResult<()> {
        let interval = self.config.heartbeat_interval_secs.max(10);
        self.request_on(socket, "public/set_heartbeat", json!({ "interval": interval }))
            .await?;
        Ok(())
    }

    async fn replay_subscriptions(&self, socket: &mut WsStream) -> TransportResult<()> {
        let channels: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        if channels.is_empty() {
            return Ok(());
        }
        self.request_on(socket, "private/subscribe", json!({ "channels": channels.clone() }))
            .await?;
        info!(count = channels.len(), "replayed subscriptions");
        Ok(())
    }

    /// Blocking request/reply on a socket the supervisor does not own yet.
    /// Push frames arriving mid-handshake are routed, not dropped.
    async fn request_on(
        &self,
        socket: &mut WsStream,
        method: &str,
        params: Value,
    ) -> TransportResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = serde_json::to_string(&RpcRequest::new(id, method, params))
            .map_err(|err| TransportError::InvalidParams(err.to_string()))?;
        socket
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::ConnectionLost(err.to_string()))?;

        let timeout = self.config.call_timeout();
        let reply = tokio::time::timeout(timeout, async {
            while let Some(frame) = socket.next().await {
                let message = frame.map_err(|err| TransportError::ConnectionLost(err.to_string()))?;
                let Message::Text(text) = message else {
                    continue;
                };
                match serde_json::from_str::<RpcFrame>(&text) {
                    Ok(RpcFrame::Reply(reply)) if reply.id == id => {
                        return match reply.error {
                            Some(err) => Err(TransportError::from_remote(err.code, &err.message)),
                            None => Ok(reply.result.unwrap_or(Value::Null)),
                        };
                    }
                    Ok(RpcFrame::Reply(reply)) => {
                        debug!(id = reply.id, "out-of-band reply during handshake");
                    }
                    Ok(RpcFrame::Notification(notification)) => {
                        self.route_notification(&notification);
                    }
                    Err(err) => warn!(error = %err, "undecodable frame during handshake"),
                }
            }
            Err(TransportError::ConnectionLost(
                "socket closed during handshake".into(),
            ))
        })
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
        Ok(reply)
    }

    fn handle_incoming(&self, text: &str) {
        *lock(&self.last_inbound) = Instant::now();
        match serde_json::from_str::<RpcFrame>(text) {
            Ok(RpcFrame::Reply(reply)) => {
                let sender = lock(&self.pending).remove(&reply.id);
                match sender {
                    Some(tx) => {
                        let outcome = match reply.error {
                            Some(err) => Err(TransportError::from_remote(err.code, &err.message)),
                            None => Ok(reply.result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => debug!(id = reply.id, "reply for expired or unknown request"),
                }
            }
            Ok(RpcFrame::Notification(notification)) => self.route_notification(&notification),
            Err(err) => warn!(error = %err, "undecodable inbound frame"),
        }
    }

    fn route_notification(&self, notification: &crate::protocol::RpcNotification) {
        if notification.is_test_request() {
            // Answer the liveness probe; the reply itself carries no payload
            // we need, so the id is deliberately left uncorrelated.
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if let (Some(outbound), Ok(text)) = (
                self.outbound.upgrade(),
                serde_json::to_string(&RpcRequest::new(id, "public/test", json!({}))),
            ) {
                let _ = outbound.try_send(Outbound::Frame(text));
            }
            return;
        }
        if let Some(push) = notification.subscription() {
            match lock(&self.subscriptions).get(&push.channel) {
                Some(tx) => {
                    let _ = tx.send(push.data);
                }
                None => debug!(channel = %push.channel, "push for unknown channel"),
            }
            return;
        }
        debug!(method = %notification.method, "unhandled notification");
    }

    /// Every caller still waiting gets `ConnectionLost`; replies to those
    /// ids arriving after a reconnect are dropped as unknown.
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), reason, "failing in-flight requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(TransportError::ConnectionLost(reason.to_string())));
        }
    }

    async fn reconnect_with_backoff(&self) -> Option<WsStream> {
        let mut delay = self.config.initial_reconnect_delay();
        for attempt in 1..=self.config.max_reconnect_attempts {
            if self.operator_latch.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return None;
            }
            tokio::time::sleep(jittered(delay, self.config.backoff_jitter)).await;
            match self.establish().await {
                Ok(socket) => {
                    info!(attempt, "reconnected");
                    self.set_state(ConnectionState::Ready);
                    return Some(socket);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                    delay = delay
                        .mul_f64(self.config.backoff_multiplier)
                        .min(self.config.max_reconnect_delay());
                }
            }
        }
        error!(
            attempts = self.config.max_reconnect_attempts,
            "reconnect attempts exhausted, giving up"
        );
        self.set_state(ConnectionState::Disconnected);
        None
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..1.0 + jitter);
    delay.mul_f64(factor.max(0.0))
}

async fn run_supervisor(
    shared: Arc<Shared>,
    mut socket: WsStream,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    loop {
        let (sink, stream) = socket.split();
        let reason = pump_connection(&shared, sink, stream, &mut outbound_rx).await;
        let Some(reason) = reason else {
            // Every client handle dropped; nothing left to serve.
            shared.set_state(ConnectionState::Disconnected);
            return;
        };

        shared.fail_pending(&reason);
        if shared.operator_latch.load(Ordering::SeqCst) {
            info!("operator disconnect, supervisor exiting");
            shared.set_state(ConnectionState::Disconnected);
            return;
        }

        warn!(reason = %reason, "connection lost");
        shared.set_state(ConnectionState::Reconnecting);
        match shared.reconnect_with_backoff().await {
            Some(fresh) => socket = fresh,
            None => return,
        }
    }
}

/// Drive one live socket until it dies. Returns `None` when all client
/// handles are gone, otherwise the reason the connection ended.
async fn pump_connection(
    shared: &Shared,
    mut sink: WsSink,
    mut stream: SplitStream<WsStream>,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
) -> Option<String> {
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Frame(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        return Some(format!("send failed: {err}"));
                    }
                }
                Some(Outbound::ForceClose) => {
                    let _ = sink.close().await;
                    return Some("forced close".to_string());
                }
                None => {
                    let _ = sink.close().await;
                    return None;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.handle_incoming(&text),
                Some(Ok(Message::Close(_))) => return Some("server closed connection".to_string()),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Some(format!("stream error: {err}")),
                None => return Some("stream ended".to_string()),
            },
        }
    }
}

/// Probe the venue while `Ready`; if nothing has been heard inside the
/// staleness window, force-close so the supervisor reconnects.
async fn run_heartbeat(shared: Arc<Shared>) {
    let interval = shared.config.heartbeat_interval();
    let stale_after = shared.config.stale_after();
    loop {
        tokio::time::sleep(interval).await;
        if shared.operator_latch.load(Ordering::SeqCst) {
            return;
        }
        let state = *shared.state_tx.borrow();
        match state {
            ConnectionState::Disconnected => return,
            ConnectionState::Ready => {}
            _ => continue,
        }

        if let Err(err) = shared.call("public/test", json!({})).await {
            warn!(error = %err, "heartbeat probe failed");
        }
        let silence = lock(&shared.last_inbound).elapsed();
        if silence > stale_after {
            warn!(?silence, "connection stale, forcing reconnect");
            if let Some(outbound) = shared.outbound.upgrade() {
                let _ = outbound.try_send(Outbound::ForceClose);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_inside_the_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let delayed = jittered(base, 0.2);
            assert!(delayed >= Duration::from_secs(8));
            assert!(delayed <= Duration::from_secs(12));
        }
        assert_eq!(jittered(base, 0.0), base);
    }

    #[test]
    fn signature_is_deterministic() {
        let creds = Credentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        };
        let a = creds.sign(1_700_000_000_000, "nonce", "").unwrap();
        let b = creds.sign(1_700_000_000_000, "nonce", "").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let c = creds.sign(1_700_000_000_001, "nonce", "").unwrap();
        assert_ne!(a, c);
    }
}
