//! WebSocket transport: frames as binary messages over `{server_url}/{room}`.
//!
//! Join parameters become percent-encoded query parameters. A writer task
//! forwards the outbound channel to the socket; a reader task maps binary
//! messages to transport events and reports the disconnect when the socket
//! closes.

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::transport::{
    ChannelTransport, JoinParams, TransportError, TransportEvent, TransportStatus,
};

/// Frames buffered toward the socket before `push` applies backpressure.
const OUTGOING_CAPACITY: usize = 256;

struct WsConnection {
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

/// [`ChannelTransport`] over a WebSocket connection.
pub struct WsTransport {
    server_url: String,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
    connection: Mutex<Option<WsConnection>>,
}

impl WsTransport {
    /// Transport for a server at `server_url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(server_url: impl Into<String>) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            server_url: server_url.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connection: Mutex::new(None),
        }
    }
}

fn join_url(server_url: &str, room_id: &str, params: &JoinParams) -> Result<Url, TransportError> {
    let mut url = Url::parse(server_url).map_err(|e| TransportError::Join(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| TransportError::Join("server url cannot be a base".to_owned()))?
        .pop_if_empty()
        .push(room_id);
    if let Some(object) = params.as_object().filter(|o| !o.is_empty()) {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in object {
            match value {
                Value::String(s) => pairs.append_pair(key, s),
                other => pairs.append_pair(key, &other.to_string()),
            };
        }
    }
    Ok(url)
}

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn join(&self, room_id: &str, params: JoinParams) -> Result<(), TransportError> {
        if self.connection.lock().unwrap().is_some() {
            return Err(TransportError::Join("transport already joined".to_owned()));
        }
        let _ = self
            .events_tx
            .send(TransportEvent::Status(TransportStatus::Connecting));

        let url = join_url(&self.server_url, room_id, &params)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);
        let cancel = CancellationToken::new();

        // Writer task: forward outgoing channel to the socket
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    data = outgoing_rx.recv() => match data {
                        Some(data) => {
                            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = ws_writer.close().await;
        });

        {
            let mut slot = self.connection.lock().unwrap();
            if slot.is_some() {
                cancel.cancel();
                return Err(TransportError::Join("transport already joined".to_owned()));
            }
            *slot = Some(WsConnection {
                outgoing_tx,
                cancel: cancel.clone(),
            });
        }
        info!("Connected to {url}");
        let _ = self
            .events_tx
            .send(TransportEvent::Status(TransportStatus::Connected));

        // Reader task, spawned last: no frame can surface before `Connected`,
        // and replies to early frames find the connection in place
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = ws_reader.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let _ = events_tx.send(TransportEvent::Frame(data.into()));
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("WebSocket read error: {e}");
                            break;
                        }
                    },
                }
            }
            let _ = events_tx.send(TransportEvent::Status(TransportStatus::Disconnected));
        });
        Ok(())
    }

    async fn leave(&self) {
        // Cancelling stops the reader (which reports the disconnect) and the
        // writer, whose teardown sends the close frame
        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.cancel.cancel();
        }
    }

    async fn push(&self, _event: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let outgoing_tx = {
            let connection = self.connection.lock().unwrap();
            match connection.as_ref() {
                Some(c) => c.outgoing_tx.clone(),
                None => return Err(TransportError::NotJoined),
            }
        };
        outgoing_tx
            .send(payload)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn take_events(&self) -> Option<UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn endpoint(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_url_plain() {
        let url = join_url("ws://localhost:9090", "doc-1", &json!({})).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9090/doc-1");
    }

    #[test]
    fn test_join_url_strips_trailing_slash() {
        let url = join_url("ws://localhost:9090/", "doc-1", &json!(null)).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9090/doc-1");
    }

    #[test]
    fn test_join_url_params_become_query() {
        let url =
            join_url("ws://localhost:9090", "doc-1", &json!({"token": "abc", "v": 2})).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9090/doc-1?token=abc&v=2");
    }

    #[test]
    fn test_join_url_encodes_reserved_characters() {
        let url = join_url(
            "ws://localhost:9090",
            "design docs",
            &json!({"token": "a&b=#c", "who": "pair programming"}),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:9090/design%20docs?token=a%26b%3D%23c&who=pair+programming"
        );
    }

    #[test]
    fn test_join_url_rejects_unparseable_server_url() {
        assert!(matches!(
            join_url("not a url", "doc-1", &json!({})),
            Err(TransportError::Join(_))
        ));
    }

    #[tokio::test]
    async fn test_push_before_join_rejected() {
        let transport = WsTransport::new("ws://localhost:1");
        assert!(matches!(
            transport.push("doc_frame", vec![0]).await,
            Err(TransportError::NotJoined)
        ));
    }

    #[test]
    fn test_take_events_once() {
        let transport = WsTransport::new("ws://localhost:1");
        assert!(transport.take_events().is_some());
        assert!(transport.take_events().is_none());
    }
}
