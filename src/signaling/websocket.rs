//! Socket.IO signaling connection over WebSocket, with reconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::router::EventRouter;
use super::socketio::{self, Packet};
use super::{EventHandler, ListenerId, SignalTransport, TransportError};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Server base URL, e.g. `https://chat.example.com`.
    pub server_url: String,
    /// Bearer token sent in the Socket.IO CONNECT auth object.
    pub token: String,
}

impl TransportSettings {
    /// Build the Engine.IO WebSocket URL for the server.
    pub fn ws_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server URL {}", self.server_url))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => anyhow::bail!("Unsupported server URL scheme: {}", other),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Cannot use scheme {} for {}", scheme, self.server_url))?;
        url.set_path("/socket.io/");
        url.query_pairs_mut()
            .clear()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket");
        Ok(url)
    }
}

/// Reason one connection attempt ended.
enum DisconnectReason {
    /// `shutdown()` was called. Do not reconnect.
    Shutdown,
    /// The server refused our token. Reconnecting would not help.
    AuthRejected(String),
    /// Error or server-initiated close. Should reconnect.
    Error(anyhow::Error),
}

struct Shared {
    router: EventRouter,
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Socket.IO client implementing `SignalTransport`.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct SocketIoTransport {
    shared: Arc<Shared>,
}

impl SocketIoTransport {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                router: EventRouter::new(),
                outbox: Mutex::new(None),
                connected: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Start the connection task.
    ///
    /// On transient errors or server-initiated disconnects, reconnects with
    /// exponential backoff (1s, 2s, 4s, ... capped at 64s). Exits on
    /// `shutdown()` or when the server rejects the token.
    pub fn spawn(&self, settings: TransportSettings) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shared.shutdown.subscribe();
            let mut backoff = 1u64;

            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                let started = std::time::Instant::now();

                match run_session(&shared, &settings).await {
                    DisconnectReason::Shutdown => {
                        tracing::info!("Signaling transport shut down");
                        return;
                    }
                    DisconnectReason::AuthRejected(msg) => {
                        tracing::error!(
                            "Signaling server rejected the token: {}. Run `weconnect-call login` again.",
                            msg
                        );
                        return;
                    }
                    DisconnectReason::Error(e) => {
                        // A session that stayed up for a minute resets the backoff.
                        if started.elapsed() >= Duration::from_secs(60) {
                            backoff = 1;
                        }
                        tracing::warn!(
                            "Signaling disconnected: {:#}. Reconnecting in {}s...",
                            e,
                            backoff
                        );
                    }
                }

                tokio::select! {
                    _ = time::sleep(Duration::from_secs(backoff)) => {}
                    _ = shutdown_rx.changed() => return,
                }
                backoff = (backoff * 2).min(64);
            }
        })
    }

    /// Stop the connection task and drop the current connection.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
    }
}

impl Default for SocketIoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalTransport for SocketIoTransport {
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), TransportError> {
        let frame = socketio::encode_event(event, &payload).map_err(|source| TransportError::Encode {
            event: event.to_string(),
            source,
        })?;

        let guard = self.shared.outbox.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) if self.shared.connected.load(Ordering::SeqCst) => {
                tracing::debug!("Signal out: {}", frame);
                tx.send(frame).map_err(|_| TransportError::NotConnected)
            }
            _ => {
                tracing::warn!("Dropping {} emit: signaling not connected", event);
                Err(TransportError::NotConnected)
            }
        }
    }

    fn on(&self, event: &str, handler: EventHandler) -> ListenerId {
        self.shared.router.on(event, handler)
    }

    fn off(&self, event: &str, id: ListenerId) -> bool {
        self.shared.router.off(event, id)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// One full session: connect, handshake, authenticate, event loop.
async fn run_session(shared: &Arc<Shared>, settings: &TransportSettings) -> DisconnectReason {
    let mut shutdown_rx = shared.shutdown.subscribe();

    let mut ws = match open_socket(settings).await {
        Ok(ws) => ws,
        Err(e) => return DisconnectReason::Error(e),
    };

    // 1. Engine.IO OPEN
    let open = match recv_packet(&mut ws).await {
        Ok(Some(Packet::Open(info))) => info,
        Ok(Some(other)) => {
            return DisconnectReason::Error(anyhow::anyhow!(
                "Expected Engine.IO open packet, got {:?}",
                other
            ))
        }
        Ok(None) => {
            return DisconnectReason::Error(anyhow::anyhow!("Connection closed before handshake"))
        }
        Err(e) => return DisconnectReason::Error(e),
    };
    tracing::info!(
        "Engine.IO session {} (ping every {}ms)",
        open.sid,
        open.ping_interval
    );

    // 2. Socket.IO CONNECT with the token
    let auth = serde_json::json!({ "token": settings.token });
    if let Err(e) = ws
        .send(Message::Text(socketio::encode_connect(Some(&auth))))
        .await
    {
        return DisconnectReason::Error(anyhow::Error::new(e).context("Failed to send connect"));
    }

    loop {
        match recv_packet(&mut ws).await {
            Ok(Some(Packet::Connect(_))) => break,
            Ok(Some(Packet::ConnectError(v))) => {
                let msg = v
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| v.to_string());
                return DisconnectReason::AuthRejected(msg);
            }
            Ok(Some(Packet::Ping)) => {
                if let Err(e) = ws.send(Message::Text(socketio::PONG.to_string())).await {
                    return DisconnectReason::Error(anyhow::Error::new(e).context("Pong failed"));
                }
            }
            Ok(Some(other)) => tracing::debug!("Ignoring {:?} before connect", other),
            Ok(None) => {
                return DisconnectReason::Error(anyhow::anyhow!("Connection closed during connect"))
            }
            Err(e) => return DisconnectReason::Error(e),
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *shared.outbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    shared.connected.store(true, Ordering::SeqCst);
    tracing::info!("Signaling connected");

    // The server pings every `ping_interval`; silence past interval + timeout
    // means the connection is dead.
    let liveness = Duration::from_millis(open.ping_interval + open.ping_timeout);
    let mut deadline = Box::pin(time::sleep(liveness));

    let reason = loop {
        tokio::select! {
            packet = recv_packet(&mut ws) => {
                match packet {
                    Ok(Some(Packet::Ping)) => {
                        deadline.as_mut().reset(time::Instant::now() + liveness);
                        if let Err(e) = ws.send(Message::Text(socketio::PONG.to_string())).await {
                            break DisconnectReason::Error(anyhow::Error::new(e).context("Pong failed"));
                        }
                    }
                    Ok(Some(Packet::Event { name, data, .. })) => {
                        tracing::debug!("Signal in: {} {}", name, data);
                        shared.router.dispatch(&name, &data);
                    }
                    Ok(Some(Packet::Disconnect)) | Ok(Some(Packet::Close)) => {
                        break DisconnectReason::Error(anyhow::anyhow!("Server closed the session"));
                    }
                    Ok(Some(other)) => tracing::debug!("Ignoring {:?}", other),
                    Ok(None) => {
                        break DisconnectReason::Error(anyhow::anyhow!("WebSocket closed by server"));
                    }
                    Err(e) => break DisconnectReason::Error(e),
                }
            }
            Some(frame) = rx.recv() => {
                if let Err(e) = ws.send(Message::Text(frame)).await {
                    break DisconnectReason::Error(anyhow::Error::new(e).context("WebSocket send failed"));
                }
            }
            _ = &mut deadline => {
                break DisconnectReason::Error(anyhow::anyhow!("Ping timeout"));
            }
            _ = shutdown_rx.changed() => {
                let _ = ws.send(Message::Text("41".to_string())).await;
                let _ = ws.close(None).await;
                break DisconnectReason::Shutdown;
            }
        }
    };

    shared.connected.store(false, Ordering::SeqCst);
    *shared.outbox.lock().unwrap_or_else(|e| e.into_inner()) = None;
    reason
}

async fn open_socket(settings: &TransportSettings) -> Result<WsStream> {
    let url = settings.ws_url()?;
    tracing::info!("Connecting WebSocket to {}", url);

    let (stream, response) = connect_async(url.as_str())
        .await
        .context("WebSocket connection failed")?;

    tracing::info!("WebSocket connected (status={})", response.status());
    Ok(stream)
}

/// Receive and decode the next text frame, answering WebSocket pings.
///
/// Frames that fail to decode are logged and skipped.
async fn recv_packet(ws: &mut WsStream) -> Result<Option<Packet>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match socketio::decode(&text) {
                Ok(p) => return Ok(Some(p)),
                Err(e) => tracing::warn!("Undecodable signaling frame: {}", e),
            },
            Some(Ok(Message::Ping(data))) => {
                ws.send(Message::Pong(data))
                    .await
                    .context("Failed to send pong")?;
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!("WebSocket closed: {:?}", frame);
                return Ok(None);
            }
            Some(Ok(other)) => {
                tracing::debug!("WS frame (ignored): {:?}", other);
            }
            Some(Err(e)) => {
                return Err(e).context("WebSocket receive error");
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_from_https() {
        let s = TransportSettings {
            server_url: "https://chat.example.com".into(),
            token: "t".into(),
        };
        assert_eq!(
            s.ws_url().unwrap().as_str(),
            "wss://chat.example.com/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_ws_url_from_http_with_port() {
        let s = TransportSettings {
            server_url: "http://localhost:5000/".into(),
            token: "t".into(),
        };
        assert_eq!(
            s.ws_url().unwrap().as_str(),
            "ws://localhost:5000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_ws_url_rejects_other_schemes() {
        let s = TransportSettings {
            server_url: "ftp://example.com".into(),
            token: "t".into(),
        };
        assert!(s.ws_url().is_err());
    }

    #[test]
    fn test_emit_while_disconnected_is_a_failed_send() {
        let t = SocketIoTransport::new();
        assert!(!t.is_connected());
        let err = t
            .emit("call:end", serde_json::json!({"conversationId": "c"}))
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
