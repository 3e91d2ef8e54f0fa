//! Signaling relay client
//!
//! Peers discover each other through a relay that only ever sees opaque
//! publish/subscribe traffic: `{type: subscribe|unsubscribe, topics}` and
//! `{type: publish, topic, data}`, with periodic pongs from the server.
//! One [`SignalingConnection`] is kept per relay URL and shared by every
//! room using that URL; the [`SignalingRegistry`] reference-counts them.
//!
//! When a room has a password, the `data` field of a publish is the base64 of
//! an encrypted envelope instead of a plaintext object; the relay cannot read
//! announce/signal payloads in that case.
//!
//! The connection auto-reconnects with capped exponential backoff, and on
//! every (re)connect resubscribes all topics and re-announces every room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::room::Room;

/// Interval between client pings
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect backoff bounds
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Messages exchanged with the signaling relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    /// Start receiving publishes for these topics
    Subscribe { topics: Vec<String> },
    /// Stop receiving publishes for these topics
    Unsubscribe { topics: Vec<String> },
    /// Deliver `data` to every other subscriber of `topic`
    Publish {
        topic: String,
        data: serde_json::Value,
    },
    /// Client keepalive
    Ping,
    /// Server keepalive reply
    Pong,
}

/// Rendezvous payloads carried inside a publish `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    /// "I am here": invites other subscribers to open a link to `from`
    Announce { from: String },
    /// Transport negotiation payload addressed to one peer
    Signal {
        from: String,
        to: String,
        signal: serde_json::Value,
    },
}

/// Outbound half of a signaling connection as seen by a room.
///
/// Rooms talk to relays only through this trait, so tests can substitute an
/// in-process relay and never open a socket.
pub trait SignalSink: Send + Sync {
    /// Whether the underlying relay connection is currently established
    fn is_connected(&self) -> bool;
    fn subscribe(&self, topic: &str);
    fn unsubscribe(&self, topic: &str);
    fn publish(&self, topic: &str, data: serde_json::Value);
}

/// One long-lived connection to a signaling relay URL, shared across every
/// room using that URL.
pub struct SignalingConnection {
    url: String,
    out_tx: mpsc::UnboundedSender<RelayMessage>,
    connected: AtomicBool,
    rooms: Mutex<HashMap<String, Weak<Room>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SignalingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingConnection")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SignalingConnection {
    /// Open a connection to `url` and keep it alive in the background
    pub fn spawn(url: impl Into<String>) -> Arc<Self> {
        let url = url.into();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            url: url.clone(),
            out_tx,
            connected: AtomicBool::new(false),
            rooms: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        let task = tokio::spawn(Self::run(url, weak, out_rx));
        *conn.task.lock() = Some(task);
        conn
    }

    /// The relay URL this connection serves
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Attach a room so publishes for its topic are dispatched to it.
    /// If the relay is already connected the topic is subscribed and the
    /// room announced immediately; otherwise that happens on (re)connect.
    pub fn register_room(self: &Arc<Self>, room: &Arc<Room>) {
        self.rooms
            .lock()
            .insert(room.name().to_string(), Arc::downgrade(room));
        if self.is_connected() {
            self.subscribe(room.name());
            let sink: Arc<dyn SignalSink> = self.clone();
            room.announce_to(&sink);
        }
    }

    /// Detach a room (its topic is unsubscribed on the relay)
    pub fn unregister_room(&self, room_name: &str) {
        self.rooms.lock().remove(room_name);
        self.unsubscribe(room_name);
    }

    fn send(&self, msg: RelayMessage) {
        // Queued while disconnected; flushed after the next reconnect.
        let _ = self.out_tx.send(msg);
    }

    /// Shut the background task down. Called by the registry once the last
    /// subscriber room released the connection.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(url = %self.url, "signaling connection shut down");
    }

    fn on_connected(self: &Arc<Self>) {
        self.connected.store(true, Ordering::SeqCst);

        let (topics, rooms): (Vec<_>, Vec<_>) = {
            let rooms = self.rooms.lock();
            (
                rooms.keys().cloned().collect(),
                rooms.values().cloned().collect(),
            )
        };
        info!(url = %self.url, topics = topics.len(), "signaling connected");
        if !topics.is_empty() {
            self.send(RelayMessage::Subscribe { topics });
        }
        let sink: Arc<dyn SignalSink> = self.clone();
        for room in rooms.iter().filter_map(Weak::upgrade) {
            room.announce_to(&sink);
        }
    }

    fn dispatch(self: &Arc<Self>, topic: &str, data: serde_json::Value) {
        let room = self.rooms.lock().get(topic).and_then(Weak::upgrade);
        match room {
            Some(room) => {
                let sink: Arc<dyn SignalSink> = self.clone();
                room.handle_signaling_data(&sink, data);
            }
            None => debug!(url = %self.url, topic, "publish for unknown topic"),
        }
    }

    fn handle_incoming(self: &Arc<Self>, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(url = %self.url, error = %e, "relay sent unparseable frame");
                return;
            }
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("publish") => {
                let topic = value.get("topic").and_then(|t| t.as_str());
                let data = value.get("data").cloned();
                if let (Some(topic), Some(data)) = (topic, data) {
                    self.dispatch(topic, data);
                }
            }
            Some("pong") => {}
            other => warn!(url = %self.url, msg_type = ?other, "unknown relay message type"),
        }
    }

    async fn run(
        url: String,
        weak: Weak<SignalingConnection>,
        mut out_rx: mpsc::UnboundedReceiver<RelayMessage>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    attempt = 0;
                    let (mut ws_tx, mut ws_rx) = ws.split();
                    if let Some(conn) = weak.upgrade() {
                        conn.on_connected();
                    } else {
                        return;
                    }

                    // First ping one interval after connect, not immediately.
                    let mut ping = tokio::time::interval_at(
                        tokio::time::Instant::now() + PING_INTERVAL,
                        PING_INTERVAL,
                    );
                    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                    loop {
                        tokio::select! {
                            _ = ping.tick() => {
                                let frame = match serde_json::to_string(&RelayMessage::Ping) {
                                    Ok(json) => WsMessage::Text(json),
                                    Err(_) => continue,
                                };
                                if ws_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            out = out_rx.recv() => match out {
                                Some(msg) => {
                                    let Ok(json) = serde_json::to_string(&msg) else { continue };
                                    if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                        break;
                                    }
                                }
                                // All senders gone: the connection was dropped.
                                None => return,
                            },
                            frame = ws_rx.next() => match frame {
                                Some(Ok(WsMessage::Text(text))) => {
                                    match weak.upgrade() {
                                        Some(conn) => conn.handle_incoming(&text),
                                        None => return,
                                    }
                                }
                                Some(Ok(WsMessage::Ping(payload))) => {
                                    let _ = ws_tx.send(WsMessage::Pong(payload)).await;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(url = %url, error = %e, "relay stream error");
                                    break;
                                }
                                None => break,
                            },
                        }
                    }

                    if let Some(conn) = weak.upgrade() {
                        conn.connected.store(false, Ordering::SeqCst);
                        info!(url = %url, "signaling disconnected");
                    } else {
                        return;
                    }
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "relay connect failed");
                }
            }

            if weak.upgrade().is_none() {
                return;
            }
            let backoff = BACKOFF_BASE
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(BACKOFF_MAX);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(backoff).await;
        }
    }
}

impl SignalSink for SignalingConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, topic: &str) {
        self.send(RelayMessage::Subscribe {
            topics: vec![topic.to_string()],
        });
    }

    fn unsubscribe(&self, topic: &str) {
        self.send(RelayMessage::Unsubscribe {
            topics: vec![topic.to_string()],
        });
    }

    fn publish(&self, topic: &str, data: serde_json::Value) {
        self.send(RelayMessage::Publish {
            topic: topic.to_string(),
            data,
        });
    }
}

struct RegistryEntry {
    conn: Arc<SignalingConnection>,
    refs: usize,
}

/// Injectable registry of shared signaling connections, keyed by URL.
///
/// A connection is created on the first acquire of its URL and torn down when
/// the last holder releases it.
#[derive(Default)]
pub struct SignalingRegistry {
    conns: Mutex<HashMap<String, RegistryEntry>>,
}

impl SignalingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or open) the shared connection for `url`
    pub fn acquire(&self, url: &str) -> Arc<SignalingConnection> {
        let mut conns = self.conns.lock();
        let entry = conns.entry(url.to_string()).or_insert_with(|| {
            debug!(url, "opening shared signaling connection");
            RegistryEntry {
                conn: SignalingConnection::spawn(url),
                refs: 0,
            }
        });
        entry.refs += 1;
        entry.conn.clone()
    }

    /// Release one hold on `url`; the connection is destroyed at zero holds
    pub fn release(&self, url: &str) {
        let mut conns = self.conns.lock();
        let Some(entry) = conns.get_mut(url) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            let entry = conns.remove(url);
            if let Some(entry) = entry {
                entry.conn.shutdown();
            }
        }
    }

    /// Number of live shared connections
    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
