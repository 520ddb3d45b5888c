//! Channel transport contract.
//!
//! A transport is a named, message-oriented connection to one room: join and
//! leave, a single-consumer event stream, and a push primitive. The sync
//! layer never sees sockets; it sees this trait. Frames travel under the
//! event name [`EVENT_DOC_FRAME`]; transports that do not multiplex named
//! events (plain WebSockets) are free to ignore the name.
//!
//! Per-connection ordering is assumed: events for one connection arrive in
//! the order the transport produced them. Nothing stronger is required.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

/// Event name under which document/presence frames are pushed.
pub const EVENT_DOC_FRAME: &str = "doc_frame";

/// Opaque join parameters forwarded to the server (auth tokens and the like).
pub type JoinParams = serde_json::Value;

/// Connection status reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// One transport-level event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection status changed.
    Status(TransportStatus),
    /// One inbound wire frame, delivered verbatim.
    Frame(Vec<u8>),
}

/// Message-oriented connection to one room.
///
/// Implementations own their sockets/queues behind `&self`; the sync layer
/// drives them through a `Box<dyn ChannelTransport>`.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Join a room. Resolves once the transport has accepted the join;
    /// `Connected` is still reported separately through the event stream.
    async fn join(&self, room_id: &str, params: JoinParams) -> Result<(), TransportError>;

    /// Leave the room and release the connection. Infallible by contract;
    /// implementations log their own teardown failures.
    async fn leave(&self);

    /// Push one payload under a named event.
    async fn push(&self, event: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Take the event receiver. Single consumer; returns `None` on second
    /// call.
    fn take_events(&self) -> Option<UnboundedReceiver<TransportEvent>>;

    /// Stable endpoint identity, used to scope the cross-tab relay.
    fn endpoint(&self) -> &str;
}

/// Transport-level errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Push attempted while not joined to a room.
    NotJoined,
    /// The underlying connection is gone.
    Closed,
    /// Join/handshake failed.
    Join(String),
    /// The underlying send failed.
    Send(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotJoined => write!(f, "Not joined to a room"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Join(e) => write!(f, "Join failed: {e}"),
            Self::Send(e) => write!(f, "Send failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    /// Minimal loopback transport: every push echoes back as a frame.
    struct EchoTransport {
        endpoint: String,
        events_tx: UnboundedSender<TransportEvent>,
        events_rx: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
    }

    impl EchoTransport {
        fn new() -> Self {
            let (events_tx, events_rx) = unbounded_channel();
            Self {
                endpoint: "echo://local".to_owned(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }
        }
    }

    #[async_trait]
    impl ChannelTransport for EchoTransport {
        async fn join(&self, _room_id: &str, _params: JoinParams) -> Result<(), TransportError> {
            let _ = self
                .events_tx
                .send(TransportEvent::Status(TransportStatus::Connected));
            Ok(())
        }

        async fn leave(&self) {
            let _ = self
                .events_tx
                .send(TransportEvent::Status(TransportStatus::Disconnected));
        }

        async fn push(&self, _event: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            self.events_tx
                .send(TransportEvent::Frame(payload))
                .map_err(|e| TransportError::Send(e.to_string()))
        }

        fn take_events(&self) -> Option<UnboundedReceiver<TransportEvent>> {
            self.events_rx.lock().unwrap().take()
        }

        fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    #[tokio::test]
    async fn test_trait_is_object_safe() {
        let transport: Box<dyn ChannelTransport> = Box::new(EchoTransport::new());
        let mut events = transport.take_events().unwrap();
        assert!(transport.take_events().is_none());

        transport.join("room-1", serde_json::json!({})).await.unwrap();
        transport
            .push(EVENT_DOC_FRAME, vec![1, 2, 3])
            .await
            .unwrap();
        transport.leave().await;

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(TransportStatus::Connected))
        );
        assert_eq!(events.recv().await, Some(TransportEvent::Frame(vec![1, 2, 3])));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(TransportStatus::Disconnected))
        );
    }
}
