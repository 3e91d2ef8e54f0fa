//! HTTP tunneling over the mesh
//!
//! One peer shares a local HTTP service ([`TunnelServer`]); every other peer
//! can reach it through a local listener ([`TunnelClient`]). Requests and
//! responses travel as JSON envelopes inside `TunneledRequest` /
//! `TunneledResponse` messages, addressed by the shared service's port.
//!
//! Envelopes carry a correlation id so concurrent in-flight requests to the
//! same port resolve to the right waiter; responses without one (older peers)
//! fall back to port-only matching. Binary bodies (image/video content types,
//! or byte-range responses) are base64-encoded inside the JSON envelope.
//!
//! Proxy failures never cross the tunnel as transport errors: the server side
//! answers with a synthetic 500 envelope instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::provider::ConnectionGuard;

/// How long the client side waits for a tunneled response
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest request body the client listener will forward
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// A tunneled HTTP request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Correlation id for concurrent in-flight requests. Optional on the
    /// wire for compatibility with peers that match by port alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// A tunneled HTTP response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl TunnelResponse {
    /// The synthetic failure envelope: proxy errors become a plain-text 500
    /// instead of a transport failure.
    fn internal_error(message: &str, request_id: Option<String>) -> Self {
        Self {
            ok: false,
            status: 500,
            status_text: "Internal Server Error".to_string(),
            headers: HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            data: format!("Tunnel error: {message}"),
            request_id,
        }
    }
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Whether a body must travel base64-encoded inside the JSON envelope.
fn is_binary(headers: &HashMap<String, String>) -> bool {
    if header(headers, "content-ranges").is_some_and(|v| v.contains("bytes")) {
        return true;
    }
    header(headers, "content-type")
        .is_some_and(|ct| ct.starts_with("image") || ct.starts_with("video"))
}

// ---- server side ----

/// Proxies tunneled requests for one shared port against the local service.
pub struct TunnelServer {
    port: u16,
    task: JoinHandle<()>,
}

impl TunnelServer {
    /// Announce `port` as shared and start serving tunneled requests for it
    /// against `http://localhost:{port}`.
    pub async fn share(guard: Arc<ConnectionGuard>, port: u16) -> Self {
        let mut events = guard.subscribe();
        guard.start_sharing_port(port).await;
        info!(port, "sharing local service over the mesh");

        let http = reqwest::Client::new();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(port, skipped, "tunnel server lagged on room events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let MeshEvent::TunneledRequest {
                    port: req_port,
                    data,
                } = event
                else {
                    continue;
                };
                if req_port != port {
                    continue;
                }
                // One task per request: a slow proxied request must not stall
                // the ones behind it.
                let http = http.clone();
                let guard = guard.clone();
                tokio::spawn(async move {
                    let response = proxy_to_local(&http, port, &data).await;
                    match serde_json::to_string(&response) {
                        Ok(payload) => guard.server_response(port, payload).await,
                        Err(e) => warn!(port, error = %e, "response envelope serialize failed"),
                    }
                });
            }
        });
        Self { port, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving. Peers holding the shared-port announcement will see
    /// timeouts until they drop it.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Run one tunneled request against the local service. Every failure is
/// folded into a synthetic 500 envelope.
async fn proxy_to_local(http: &reqwest::Client, port: u16, data: &str) -> TunnelResponse {
    let envelope: TunnelRequest = match serde_json::from_str(data) {
        Ok(envelope) => envelope,
        Err(e) => return TunnelResponse::internal_error(&e.to_string(), None),
    };
    let request_id = envelope.request_id.clone();
    match run_local_request(http, port, envelope).await {
        Ok(mut response) => {
            response.request_id = request_id;
            response
        }
        Err(e) => TunnelResponse::internal_error(&e.to_string(), request_id),
    }
}

async fn run_local_request(
    http: &reqwest::Client,
    port: u16,
    envelope: TunnelRequest,
) -> MeshResult<TunnelResponse> {
    let url = format!("http://localhost:{port}{}", envelope.url);
    let method = reqwest::Method::from_bytes(envelope.method.as_bytes())
        .map_err(|_| MeshError::Tunnel(format!("bad method {:?}", envelope.method)))?;

    let mut builder = http.request(method, &url);
    for (name, value) in &envelope.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = envelope.data {
        if !body.is_empty() {
            builder = builder.body(body);
        }
    }

    let response = builder
        .send()
        .await
        .map_err(|e| MeshError::Tunnel(e.to_string()))?;
    let status = response.status();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| MeshError::Tunnel(e.to_string()))?;
    let data = if is_binary(&headers) {
        BASE64.encode(&body)
    } else {
        String::from_utf8_lossy(&body).into_owned()
    };

    Ok(TunnelResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        data,
        request_id: None,
    })
}

// ---- client side ----

struct Waiter {
    seq: u64,
    tx: oneshot::Sender<TunnelResponse>,
}

/// In-flight waiters keyed by (port, correlation id). Insertion order is
/// kept so id-less responses can match the oldest waiter for a port.
#[derive(Default)]
struct PendingWaiters {
    next_seq: u64,
    waiters: HashMap<(u16, String), Waiter>,
}

impl PendingWaiters {
    fn insert(&mut self, key: (u16, String), tx: oneshot::Sender<TunnelResponse>) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.waiters.insert(key, Waiter { seq, tx });
    }

    fn remove(&mut self, key: &(u16, String)) -> Option<oneshot::Sender<TunnelResponse>> {
        self.waiters.remove(key).map(|waiter| waiter.tx)
    }

    fn remove_oldest_for_port(&mut self, port: u16) -> Option<oneshot::Sender<TunnelResponse>> {
        let key = self
            .waiters
            .iter()
            .filter(|((p, _), _)| *p == port)
            .min_by_key(|(_, waiter)| waiter.seq)
            .map(|(key, _)| key.clone())?;
        self.remove(&key)
    }

    fn clear(&mut self) {
        self.waiters.clear();
    }
}

type PendingMap = Arc<Mutex<PendingWaiters>>;

#[derive(Clone)]
struct ProxyState {
    remote_port: u16,
    guard: Arc<ConnectionGuard>,
    pending: PendingMap,
}

/// Opens a local listener per shared remote port and forwards its traffic
/// through the mesh.
pub struct TunnelClient {
    guard: Arc<ConnectionGuard>,
    pending: PendingMap,
    listeners: Mutex<HashMap<u16, SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelClient {
    /// Start reacting to shared-port announcements and tunneled responses on
    /// this connection.
    pub fn spawn(guard: Arc<ConnectionGuard>) -> Arc<Self> {
        let client = Arc::new(Self {
            guard: guard.clone(),
            pending: Arc::new(Mutex::new(PendingWaiters::default())),
            listeners: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut events = guard.subscribe();
        let this = client.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MeshEvent::PortShared { port }) => this.open_listener(port).await,
                    Ok(MeshEvent::TunneledResponse { port, data }) => {
                        this.resolve_response(port, &data)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "tunnel client lagged on room events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        client.tasks.lock().push(task);
        client
    }

    /// Local address serving a remote shared port, once its announcement
    /// arrived
    pub fn local_addr(&self, remote_port: u16) -> Option<SocketAddr> {
        self.listeners.lock().get(&remote_port).copied()
    }

    /// Stop all listeners and drop pending waiters
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending.lock().clear();
        self.listeners.lock().clear();
    }

    async fn open_listener(self: &Arc<Self>, remote_port: u16) {
        if self.listeners.lock().contains_key(&remote_port) {
            return;
        }
        let state = ProxyState {
            remote_port,
            guard: self.guard.clone(),
            pending: self.pending.clone(),
        };
        let listener = match tokio::net::TcpListener::bind(("127.0.0.1", 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(remote_port, error = %e, "tunnel listener bind failed");
                return;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(remote_port, error = %e, "tunnel listener address unavailable");
                return;
            }
        };
        self.listeners.lock().insert(remote_port, addr);
        info!(remote_port, local = %addr, "tunnel listener open");

        let app = Router::new().fallback(forward_request).with_state(state);
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(remote_port, error = %e, "tunnel listener stopped");
            }
        });
        self.tasks.lock().push(task);
    }

    /// Hand an inbound response envelope to its waiter. Exact match on the
    /// correlation id; responses without one match the oldest waiter for the
    /// port.
    fn resolve_response(&self, port: u16, data: &str) {
        let envelope: TunnelResponse = match serde_json::from_str(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(port, error = %e, "dropping malformed tunneled response");
                return;
            }
        };
        let waiter = {
            let mut pending = self.pending.lock();
            match &envelope.request_id {
                Some(id) => pending.remove(&(port, id.clone())),
                None => pending.remove_oldest_for_port(port),
            }
        };
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(envelope);
            }
            None => debug!(port, "tunneled response with no waiter"),
        }
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn forward_request(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return plain_response(400, &format!("unreadable request body: {e}")),
    };

    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let request_id = Ulid::new().to_string();
    let envelope = TunnelRequest {
        method: parts.method.to_string(),
        headers,
        url,
        data: if body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&body).into_owned())
        },
        request_id: Some(request_id.clone()),
    };
    let payload = match serde_json::to_string(&envelope) {
        Ok(payload) => payload,
        Err(e) => return plain_response(500, &format!("envelope serialize failed: {e}")),
    };

    let (tx, rx) = oneshot::channel();
    let key = (state.remote_port, request_id);
    state.pending.lock().insert(key.clone(), tx);
    state.guard.client_request(state.remote_port, payload).await;

    match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
        Ok(Ok(envelope)) => into_http_response(envelope),
        _ => {
            state.pending.lock().remove(&key);
            plain_response(504, "tunnel response timed out")
        }
    }
}

fn plain_response(status: u16, body: &str) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

/// Turn a response envelope back into a real HTTP response, decoding base64
/// bodies when the headers mark them binary.
fn into_http_response(envelope: TunnelResponse) -> Response {
    let body = if is_binary(&envelope.headers) {
        match BASE64.decode(&envelope.data) {
            Ok(bytes) => bytes,
            Err(_) => envelope.data.clone().into_bytes(),
        }
    } else {
        envelope.data.clone().into_bytes()
    };

    let mut builder = Response::builder().status(envelope.status);
    for (name, value) in &envelope.headers {
        // Length and framing are recomputed for the local hop.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| plain_response(500, "unrepresentable tunneled response"))
}
