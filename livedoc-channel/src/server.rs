//! WebSocket server front-end for a [`RoomHub`].
//!
//! Architecture:
//! ```text
//! WsTransport A ──ws──┐
//!                     ├── ChannelServer ── per-connection bridge ── RoomHub
//! WsTransport B ──ws──┘                    (MemoryTransport)         │
//!                                                              room docs +
//!                                                              presence
//! ```
//!
//! Each accepted connection is bridged onto the hub through its own
//! [`MemoryTransport`]: binary messages push into the room, room fan-out
//! flows back as binary messages. The room id is the request path.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::hub::{MemoryTransport, RoomHub};
use crate::transport::{ChannelTransport, TransportEvent, TransportStatus, EVENT_DOC_FRAME};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// WebSocket channel server.
pub struct ChannelServer {
    config: ServerConfig,
    hub: Arc<RoomHub>,
    cancel: CancellationToken,
}

impl ChannelServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(RoomHub::with_endpoint(format!("ws://{}", config.bind_addr)));
        Self {
            config,
            hub,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// The hub behind this server, for room inspection and server-side kicks.
    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    /// Accept connections until `shutdown` is called.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Channel server listening on {}", self.config.bind_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!("New TCP connection from {addr}");
                    let hub = self.hub.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, hub, cancel).await {
                            warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Stop accepting and unwind per-connection bridges.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Bridge one WebSocket connection onto the hub.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<RoomHub>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_owned();
        Ok(resp)
    })
    .await?;

    let room_id = path.trim_start_matches('/').to_owned();
    if room_id.is_empty() {
        warn!("Rejecting connection from {addr}: no room in request path");
        return Ok(());
    }
    info!("Peer {addr} joining room {room_id}");

    let transport = MemoryTransport::new(hub);
    let mut events = match transport.take_events() {
        Some(events) => events,
        None => return Ok(()),
    };
    transport.join(&room_id, serde_json::Value::Null).await?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(TransportEvent::Frame(bytes)) => {
                    if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Some(TransportEvent::Status(TransportStatus::Disconnected)) | None => break,
                Some(TransportEvent::Status(_)) => {}
            },

            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if transport.push(EVENT_DOC_FRAME, data.into()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error from {addr}: {e}");
                    break;
                }
            },
        }
    }

    transport.leave().await;
    info!("Peer {addr} left room {room_id}");
    Ok(())
}
