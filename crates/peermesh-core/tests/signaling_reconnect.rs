//! Signaling connection behavior against a real websocket relay
//!
//! The relay here speaks actual websocket frames and deliberately drops the
//! first connection after the initial exchange, so the client's reconnect
//! path (resubscribe every topic, re-announce every room) gets exercised
//! end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use parking_lot::Mutex;
use peermesh_core::{
    InMemoryDoc, InMemoryPresence, MemoryTransportFactory, PeerId, Room, RoomConfig,
    SignalingConnection, MAX_CONNECTIONS,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct RecordedFrame {
    connection: usize,
    frame: serde_json::Value,
}

/// Accept loop that records every JSON frame per connection and kills the
/// first connection right after the client announced, forcing a reconnect.
async fn spawn_flaky_relay(frames: Arc<Mutex<Vec<RecordedFrame>>>) -> Result<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    let counter = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let connection = counter.fetch_add(1, Ordering::SeqCst);
            let frames = frames.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let WsMessage::Text(text) = msg else { continue };
                    let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    let is_publish = frame["type"] == "publish";
                    frames.lock().push(RecordedFrame { connection, frame });
                    if connection == 0 && is_publish {
                        // Drop the socket mid-session.
                        return;
                    }
                }
            });
        }
    });
    Ok(port)
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..800 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_reannounces() -> Result<()> {
    init_tracing();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let port = spawn_flaky_relay(frames.clone()).await?;

    let room = Room::new(RoomConfig {
        name: "docs".to_string(),
        peer_id: PeerId::random(),
        password: None,
        max_conns: MAX_CONNECTIONS,
        doc: Arc::new(InMemoryDoc::new()),
        presence: Arc::new(InMemoryPresence::new()),
        transport_factory: Arc::new(MemoryTransportFactory::new()),
    });

    let conn = SignalingConnection::spawn(format!("ws://127.0.0.1:{port}"));
    conn.register_room(&room);

    let exchange_on = |connection: usize| {
        let frames = frames.lock();
        let subscribed = frames.iter().any(|f| {
            f.connection == connection
                && f.frame["type"] == "subscribe"
                && f.frame["topics"][0] == "docs"
        });
        let announced = frames.iter().any(|f| {
            f.connection == connection
                && f.frame["type"] == "publish"
                && f.frame["topic"] == "docs"
                && f.frame["data"]["type"] == "announce"
        });
        subscribed && announced
    };

    wait_for("subscribe and announce on the first connection", || {
        exchange_on(0)
    })
    .await;

    // The relay dropped connection 0; after backoff the client must redo
    // the whole exchange on a fresh connection.
    wait_for("subscribe and announce after reconnect", || exchange_on(1)).await;
    Ok(())
}
