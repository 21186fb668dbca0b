//! Tunnel link — outbound WS connection from the gateway to the relay.
//!
//! Spawned on startup when `[tunnel] url` is configured. Maintains a
//! persistent WebSocket to the relay, driven by the reconnection manager
//! and watched by the heartbeat monitor. Forward frames are correlated to
//! their replies by operation id through a shared pending map; backend
//! sessions opened by the pool multiplex over the one link via
//! [`WsConnector`].

pub mod frame;
pub mod heartbeat;
pub mod reconnect;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ErrorCategory, TunnelError};
use crate::pool::session::{SessionConnector, SessionTransport};
use crate::state::LinkStats;
use frame::Frame;
use heartbeat::{HeartbeatExit, HeartbeatMonitor};
use reconnect::{LinkState, ReconnectionManager};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsMessage = tokio_tungstenite::tungstenite::Message;

/// How long the relay gets to answer the `hello` handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared between the live link and the sessions multiplexed on it.
///
/// The writer sender is swapped on every reconnect; sessions holding a
/// stale sender fail with a network error and get recycled by the pool.
pub struct LinkShared {
    out_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
}

impl LinkShared {
    pub fn new() -> Self {
        Self {
            out_tx: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn set_sender(&self, tx: mpsc::Sender<Frame>) {
        *self.out_tx.lock().expect("link sender lock poisoned") = Some(tx);
    }

    /// Drop the sender and fail every in-flight exchange.
    fn link_down(&self) {
        *self.out_tx.lock().expect("link sender lock poisoned") = None;
        let dropped = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            std::mem::take(&mut *pending)
        };
        // Dropping the oneshot senders wakes every waiter with an error.
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Failing in-flight exchanges on link loss");
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Frame>> {
        self.out_tx
            .lock()
            .expect("link sender lock poisoned")
            .clone()
    }

    fn register(&self, id: String) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);
        rx
    }

    fn unregister(&self, id: &str) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(id);
    }

    fn complete(&self, id: &str, reply: Frame) {
        let waiter = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(id, "Reply with no waiting exchange"),
        }
    }
}

impl Default for LinkShared {
    fn default() -> Self {
        Self::new()
    }
}

/// One logical backend session's view of the link.
pub struct WsTransport {
    shared: Arc<LinkShared>,
    max_frame_bytes: usize,
}

#[async_trait]
impl SessionTransport for WsTransport {
    async fn exchange(&self, frame: Frame) -> Result<Frame, TunnelError> {
        // Ceiling check before the frame leaves this task.
        frame.encode(self.max_frame_bytes)?;
        let id = frame
            .id()
            .ok_or_else(|| TunnelError::Protocol("frame kind cannot be exchanged".into()))?
            .to_string();

        let Some(out_tx) = self.shared.sender() else {
            return Err(TunnelError::Network("link is down".into()));
        };

        let rx = self.shared.register(id.clone());
        if out_tx.send(frame).await.is_err() {
            self.shared.unregister(&id);
            return Err(TunnelError::Network("link writer closed".into()));
        }

        match rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => Err(TunnelError::Network("link dropped before reply".into())),
        }
    }

    async fn close(&self) {}
}

/// Opens logical sessions multiplexed over the current link.
pub struct WsConnector {
    shared: Arc<LinkShared>,
    max_frame_bytes: usize,
}

impl WsConnector {
    pub fn new(shared: Arc<LinkShared>, max_frame_bytes: usize) -> Self {
        Self {
            shared,
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl SessionConnector for WsConnector {
    async fn connect(&self, identity: &str) -> Result<Box<dyn SessionTransport>, TunnelError> {
        if self.shared.sender().is_none() {
            return Err(TunnelError::Network(format!(
                "link down, cannot open session for {identity}"
            )));
        }
        Ok(Box::new(WsTransport {
            shared: Arc::clone(&self.shared),
            max_frame_bytes: self.max_frame_bytes,
        }))
    }
}

/// Spawn the link supervisor task. Returns a `JoinHandle` that runs until
/// shutdown.
pub fn spawn(
    dispatcher: Arc<Dispatcher>,
    reconnect: Arc<ReconnectionManager>,
    link_stats: Arc<LinkStats>,
    shared: Arc<LinkShared>,
    config: TunnelConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(link_supervisor_loop(
        dispatcher, reconnect, link_stats, shared, config, shutdown,
    ))
}

/// Main loop: reconnect cycle, run the link, flush the queue, repeat.
async fn link_supervisor_loop(
    dispatcher: Arc<Dispatcher>,
    reconnect: Arc<ReconnectionManager>,
    link_stats: Arc<LinkStats>,
    shared: Arc<LinkShared>,
    config: TunnelConfig,
    shutdown: CancellationToken,
) {
    let Some(relay_url) = config.url.clone() else {
        info!("No relay URL configured, operations will queue until restart");
        return;
    };

    let mut established_before = false;
    while !shutdown.is_cancelled() {
        let connected = reconnect
            .attempt_reconnect(|_attempt| connect_link(&relay_url, &config))
            .await;

        let ws_stream = match connected {
            Ok(ws) => ws,
            Err(TunnelError::Cancelled) => break,
            Err(e) => {
                // Attempts exhausted: terminal until externally re-armed
                // through the reconnection manager.
                warn!("Link failed: {e}, waiting for external retrigger");
                park_until_rearmed(&reconnect, &shutdown).await;
                continue;
            }
        };

        if established_before {
            link_stats.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        established_before = true;
        link_stats.connected.store(true, Ordering::Relaxed);

        // Link is up again — drain what buffered while it was down.
        dispatcher.flush().await;

        let reason = run_link(
            ws_stream,
            &config,
            &reconnect,
            &link_stats,
            &shared,
            &shutdown,
        )
        .await;

        link_stats.connected.store(false, Ordering::Relaxed);
        shared.link_down();
        reconnect.note_disconnected(reason);
        info!(reason, "Link lost");
    }

    link_stats.connected.store(false, Ordering::Relaxed);
    shared.link_down();
}

/// Block until the manager is re-armed (state left Failed) or shutdown.
async fn park_until_rearmed(reconnect: &ReconnectionManager, shutdown: &CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                if reconnect.state() != LinkState::Failed {
                    return;
                }
            }
        }
    }
}

/// One connection attempt: dial, handshake, retry the handshake once with
/// no optional features on a protocol mismatch.
async fn connect_link(relay_url: &str, config: &TunnelConfig) -> Result<WsStream, TunnelError> {
    match handshake(relay_url, config, &["compression"]).await {
        Err(e) if e.category() == ErrorCategory::Protocol => {
            warn!("Handshake failed ({e}), retrying with reduced feature set");
            handshake(relay_url, config, &[]).await
        }
        other => other,
    }
}

/// Dial the relay and run the `hello` exchange.
async fn handshake(
    relay_url: &str,
    config: &TunnelConfig,
    features: &[&str],
) -> Result<WsStream, TunnelError> {
    let (mut ws_stream, _response) = tokio_tungstenite::connect_async(relay_url)
        .await
        .map_err(|e| TunnelError::Network(format!("connect {relay_url}: {e}")))?;

    let hello = Frame::Hello {
        link_key: config.link_key.clone(),
        features: features.iter().map(ToString::to_string).collect(),
    };
    let text = hello.encode(config.max_frame_bytes)?;
    ws_stream
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| TunnelError::Network(format!("handshake send: {e}")))?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_stream.next())
        .await
        .map_err(|_| TunnelError::Network("handshake timed out".into()))?;

    match reply {
        Some(Ok(WsMessage::Text(text))) => match Frame::decode(&text)? {
            Frame::Hello { features, .. } => {
                debug!(?features, "Link handshake accepted");
                Ok(ws_stream)
            }
            Frame::Error {
                code,
                message,
                category,
                ..
            } => match category {
                ErrorCategory::Authentication => {
                    Err(TunnelError::Authentication(format!("{code}: {message}")))
                }
                _ => Err(TunnelError::Protocol(format!("{code}: {message}"))),
            },
            other => Err(TunnelError::Protocol(format!(
                "unexpected handshake reply: {other:?}"
            ))),
        },
        Some(Ok(other)) => Err(TunnelError::Protocol(format!(
            "non-text handshake reply: {other:?}"
        ))),
        Some(Err(e)) => Err(TunnelError::Network(format!("handshake read: {e}"))),
        None => Err(TunnelError::Network("connection closed during handshake".into())),
    }
}

/// Run an established link until it dies or shutdown. Returns the reason.
async fn run_link(
    ws_stream: WsStream,
    config: &TunnelConfig,
    reconnect: &ReconnectionManager,
    link_stats: &Arc<LinkStats>,
    shared: &Arc<LinkShared>,
    shutdown: &CancellationToken,
) -> &'static str {
    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
    let (pong_tx, pong_rx) = mpsc::channel::<(u64, u64)>(8);
    shared.set_sender(out_tx.clone());

    // Writer task: drains the outbound channel onto the socket.
    let writer_stats = Arc::clone(link_stats);
    let max_frame_bytes = config.max_frame_bytes;
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match frame.encode(max_frame_bytes) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping outbound frame: {e}");
                    writer_stats.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if ws_sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
            writer_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
    });

    // Heartbeat task: probes until the link dies or we shut down.
    let hb_shutdown = shutdown.child_token();
    let monitor = HeartbeatMonitor::new(
        Duration::from_secs(config.heartbeat_interval_secs),
        config.pong_timeout(),
        Arc::clone(link_stats),
    );
    let hb_out = out_tx.clone();
    let hb_cancel = hb_shutdown.clone();
    let mut heartbeat =
        tokio::spawn(async move { monitor.run(hb_out, pong_rx, hb_cancel).await });

    let reason = loop {
        tokio::select! {
            msg = ws_reader.next() => {
                let Some(msg) = msg else { break "closed" };
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        link_stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        reconnect.touch_activity();
                        handle_frame(&text, &out_tx, &pong_tx, shared).await;
                    }
                    Ok(WsMessage::Close(_)) => break "closed",
                    Ok(_) => {} // Binary/Ping/Pong at the WS layer — ignore
                    Err(e) => {
                        warn!("Link read error: {e}");
                        break "read_error";
                    }
                }
            }
            exit = &mut heartbeat => {
                match exit {
                    Ok(HeartbeatExit::Dead) => {
                        reconnect.note_pong_timeout();
                        break "pong_timeout";
                    }
                    Ok(HeartbeatExit::Shutdown) => break "shutdown",
                    Ok(HeartbeatExit::LinkClosed) | Err(_) => break "writer_failed",
                }
            }
            () = shutdown.cancelled() => break "shutdown",
        }
    };

    hb_shutdown.cancel();
    heartbeat.abort();
    writer.abort();
    reason
}

/// Dispatch one incoming frame.
async fn handle_frame(
    text: &str,
    out_tx: &mpsc::Sender<Frame>,
    pong_tx: &mpsc::Sender<(u64, u64)>,
    shared: &Arc<LinkShared>,
) {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dropping undecodable frame: {e}");
            return;
        }
    };

    match frame {
        Frame::Pong { seq, timestamp_ms } => {
            let _ = pong_tx.send((seq, timestamp_ms)).await;
        }
        // Relay-initiated probe: answer in kind.
        Frame::Ping { seq, timestamp_ms } => {
            let _ = out_tx.send(Frame::Pong { seq, timestamp_ms }).await;
        }
        Frame::Response { ref id, .. } | Frame::Error { ref id, .. } => {
            let id = id.clone();
            shared.complete(&id, frame);
        }
        Frame::Hello { .. } => {
            debug!("Ignoring hello outside handshake");
        }
        Frame::Forward { .. } => {
            warn!("Relay sent a forward frame to the client side, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(id: &str) -> Frame {
        Frame::Forward {
            id: id.to_string(),
            payload: b"body".to_vec(),
            headers: HashMap::new(),
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn exchange_correlates_reply_by_id() {
        let shared = Arc::new(LinkShared::new());
        let (tx, mut rx) = mpsc::channel(8);
        shared.set_sender(tx);

        let transport = WsTransport {
            shared: Arc::clone(&shared),
            max_frame_bytes: frame::MAX_FRAME_BYTES,
        };

        let responder_shared = Arc::clone(&shared);
        let responder = tokio::spawn(async move {
            let sent = rx.recv().await.expect("outbound frame");
            let id = sent.id().expect("forward id").to_string();
            responder_shared.complete(
                &id,
                Frame::Response {
                    id,
                    status_code: 204,
                    payload: Vec::new(),
                    headers: HashMap::new(),
                    latency_ms: 3,
                },
            );
        });

        let reply = transport.exchange(forward("op-9")).await.expect("reply");
        match reply {
            Frame::Response { id, status_code, .. } => {
                assert_eq!(id, "op-9");
                assert_eq!(status_code, 204);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn exchange_fails_fast_when_link_is_down() {
        let shared = Arc::new(LinkShared::new());
        let transport = WsTransport {
            shared,
            max_frame_bytes: frame::MAX_FRAME_BYTES,
        };

        let err = transport
            .exchange(forward("op-1"))
            .await
            .expect_err("no link");
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[tokio::test]
    async fn link_loss_fails_in_flight_exchanges() {
        let shared = Arc::new(LinkShared::new());
        let (tx, mut rx) = mpsc::channel(8);
        shared.set_sender(tx);

        let transport = WsTransport {
            shared: Arc::clone(&shared),
            max_frame_bytes: frame::MAX_FRAME_BYTES,
        };

        let exchange = tokio::spawn(async move { transport.exchange(forward("op-2")).await });
        let _sent = rx.recv().await.expect("outbound frame");

        shared.link_down();
        let err = exchange
            .await
            .expect("join")
            .expect_err("link dropped mid-flight");
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_send() {
        let shared = Arc::new(LinkShared::new());
        let (tx, mut rx) = mpsc::channel(8);
        shared.set_sender(tx);

        let transport = WsTransport {
            shared,
            max_frame_bytes: 128,
        };
        let err = transport
            .exchange(Frame::Forward {
                id: "op-3".to_string(),
                payload: vec![0u8; 4096],
                headers: HashMap::new(),
                timeout_ms: 1000,
            })
            .await
            .expect_err("over the ceiling");
        assert_eq!(err.code(), "FRAME_TOO_LARGE");
        assert!(rx.try_recv().is_err(), "nothing reached the writer");
    }

    #[tokio::test]
    async fn connector_refuses_while_link_is_down() {
        let shared = Arc::new(LinkShared::new());
        let connector = WsConnector::new(shared, frame::MAX_FRAME_BYTES);
        let err = connector.connect("acme").await.expect_err("link down");
        assert_eq!(err.category(), ErrorCategory::Network);
    }
}
