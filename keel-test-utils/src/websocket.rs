//! Real JSON-RPC WebSocket server for transport integration tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

enum ConnCommand {
    Send(String),
    Close,
}

struct ConnHandle {
    index: usize,
    tx: mpsc::UnboundedSender<ConnCommand>,
}

struct MethodFault {
    code: i64,
    message: String,
    /// `u32::MAX` means the fault never clears on its own.
    remaining: u32,
}

#[derive(Default)]
struct Faults {
    /// Methods the server silently never answers.
    ignored: HashSet<String>,
    /// Methods answered with an error instead of a result.
    failing: HashMap<String, MethodFault>,
}

#[derive(Default)]
struct ServerShared {
    accepted: AtomicUsize,
    order_seq: AtomicU64,
    conns: Mutex<Vec<ConnHandle>>,
    /// Channels subscribed per accepted connection, in arrival order.
    subscription_log: Mutex<Vec<Vec<String>>>,
    /// Currently active channels per live connection index.
    active_subs: Mutex<HashMap<usize, HashSet<String>>>,
    method_log: Mutex<Vec<String>>,
    faults: Mutex<Faults>,
    expected_secret: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable venue speaking the same dialect as the production endpoint.
pub struct MockRpcServer {
    addr: SocketAddr,
    shared: Arc<ServerShared>,
    accept_task: JoinHandle<()>,
}

impl MockRpcServer {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("binding mock server")?;
        let addr = listener.local_addr().context("mock server addr")?;
        let shared = Arc::new(ServerShared::default());

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                let index = accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                lock(&accept_shared.subscription_log).push(Vec::new());
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&accept_shared.conns).push(ConnHandle {
                    index,
                    tx: tx.clone(),
                });
                tokio::spawn(run_connection(Arc::clone(&accept_shared), ws, index, tx, rx));
            }
        });

        Ok(Self {
            addr,
            shared,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Total connections accepted since spawn, including dropped ones.
    pub fn connection_count(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Connections still open right now.
    pub fn live_connection_count(&self) -> usize {
        lock(&self.shared.conns).len()
    }

    /// Channels each connection subscribed to, in order of arrival.
    pub fn subscription_log(&self) -> Vec<Vec<String>> {
        lock(&self.shared.subscription_log).clone()
    }

    /// Every RPC method received, across all connections.
    pub fn method_log(&self) -> Vec<String> {
        lock(&self.shared.method_log).clone()
    }

    /// Sever every live socket without warning (network-style drop).
    pub fn drop_all(&self) {
        let conns = std::mem::take(&mut *lock(&self.shared.conns));
        for conn in conns {
            let _ = conn.tx.send(ConnCommand::Close);
        }
        lock(&self.shared.active_subs).clear();
    }

    /// Push a subscription notification to every connection on `channel`.
    pub fn push(&self, channel: &str, data: Value) {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": { "channel": channel, "data": data },
        })
        .to_string();
        let active = lock(&self.shared.active_subs);
        for conn in lock(&self.shared.conns).iter() {
            let subscribed = active
                .get(&conn.index)
                .map_or(false, |subs| subs.contains(channel));
            if subscribed {
                let _ = conn.tx.send(ConnCommand::Send(frame.clone()));
            }
        }
    }

    /// Send the server-initiated liveness probe to every live connection.
    pub fn send_test_request(&self) {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "heartbeat",
            "params": { "type": "test_request" },
        })
        .to_string();
        for conn in lock(&self.shared.conns).iter() {
            let _ = conn.tx.send(ConnCommand::Send(frame.clone()));
        }
    }

    /// Stop answering `method` entirely (timeout tests).
    pub fn ignore_method(&self, method: &str) {
        lock(&self.shared.faults).ignored.insert(method.to_string());
    }

    /// Answer `method` with an error reply until faults are cleared.
    pub fn fail_method(&self, method: &str, code: i64, message: &str) {
        lock(&self.shared.faults).failing.insert(
            method.to_string(),
            MethodFault {
                code,
                message: message.to_string(),
                remaining: u32::MAX,
            },
        );
    }

    /// Answer `method` with an error reply `times` times, then recover.
    pub fn fail_method_times(&self, method: &str, code: i64, message: &str, times: u32) {
        lock(&self.shared.faults).failing.insert(
            method.to_string(),
            MethodFault {
                code,
                message: message.to_string(),
                remaining: times.max(1),
            },
        );
    }

    pub fn clear_faults(&self) {
        let mut faults = lock(&self.shared.faults);
        faults.ignored.clear();
        faults.failing.clear();
    }

    /// Require auth signatures to verify against this secret.
    pub fn require_secret(&self, secret: &str) {
        *lock(&self.shared.expected_secret) = Some(secret.to_string());
    }
}

impl Drop for MockRpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_all();
    }
}

async fn run_connection(
    shared: Arc<ServerShared>,
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    index: usize,
    tx: mpsc::UnboundedSender<ConnCommand>,
    mut rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ConnCommand::Send(frame)) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(ConnCommand::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    for reply in handle_request(&shared, index, &text) {
                        let _ = tx.send(ConnCommand::Send(reply));
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    lock(&shared.conns).retain(|conn| conn.index != index);
    lock(&shared.active_subs).remove(&index);
    debug!(index, "mock connection closed");
}

fn handle_request(shared: &ServerShared, index: usize, text: &str) -> Vec<String> {
    let Ok(request) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    let Some(method) = request["method"].as_str().map(str::to_string) else {
        return Vec::new();
    };
    let id = request["id"].clone();
    lock(&shared.method_log).push(method.clone());

    {
        let mut faults = lock(&shared.faults);
        if faults.ignored.contains(&method) {
            return Vec::new();
        }
        if let Some(fault) = faults.failing.get_mut(&method) {
            let reply = error_reply(&id, fault.code, &fault.message);
            let exhausted = if fault.remaining == u32::MAX {
                false
            } else {
                fault.remaining -= 1;
                fault.remaining == 0
            };
            if exhausted {
                faults.failing.remove(&method);
            }
            return vec![reply];
        }
    }

    let result = match method.as_str() {
        "public/auth" => match verify_auth(shared, &request["params"]) {
            Ok(()) => json!({ "access_token": "mock-token", "expires_in": 900 }),
            Err(message) => return vec![error_reply(&id, 13004, &message)],
        },
        "public/set_heartbeat" => json!("ok"),
        "public/test" => json!({ "version": "mock" }),
        "private/subscribe" => {
            let channels: Vec<String> = request["params"]["channels"]
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if let Some(log) = lock(&shared.subscription_log).get_mut(index) {
                log.extend(channels.iter().cloned());
            }
            lock(&shared.active_subs)
                .entry(index)
                .or_default()
                .extend(channels.iter().cloned());
            json!(channels)
        }
        "private/buy" | "private/sell" => {
            let seq = shared.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let params = &request["params"];
            json!({
                "order": {
                    "order_id": format!("srv-{seq}"),
                    "label": params["label"],
                    "instrument_name": params["instrument_name"],
                    "direction": if method.ends_with("buy") { "buy" } else { "sell" },
                    "amount": params["amount"],
                    "filled_amount": "0",
                    "price": params["price"],
                    "order_state": "open",
                    "reduce_only": params["reduce_only"].as_bool().unwrap_or(false),
                },
                "trades": [],
            })
        }
        "private/cancel" => json!("ok"),
        "private/get_open_orders_by_instrument" => json!([]),
        "private/get_position" => Value::Null,
        "private/get_account_summary" => json!({ "equity": "10000" }),
        _ => Value::Null,
    };

    vec![json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()]
}

fn verify_auth(shared: &ServerShared, params: &Value) -> Result<(), String> {
    let Some(secret) = lock(&shared.expected_secret).clone() else {
        return Ok(());
    };
    let timestamp = params["timestamp"].as_i64().unwrap_or_default();
    let nonce = params["nonce"].as_str().unwrap_or_default();
    let data = params["data"].as_str().unwrap_or_default();
    let signature = params["signature"].as_str().unwrap_or_default();

    use hmac::{Hmac, Mac};
    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|err| err.to_string())?;
    mac.update(format!("{timestamp}\n{nonce}\n{data}").as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    if expected == signature {
        Ok(())
    } else {
        Err("invalid_credentials".to_string())
    }
}

fn error_reply(id: &Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}
