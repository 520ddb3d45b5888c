//! Channel client: one document + presence pair bound to one room connection.
//!
//! Data flow:
//! ```text
//!   local edit ──> DocHandle ──(update, origin)──┐
//!   local presence ──> PresenceRegistry ──(event)┤
//!                                                ▼
//!                                           event loop ──> transport (joined)
//!                                                ▲    └──> relay (always)
//!   transport frames ─────────────────────────────┤
//!   relay frames (other instances only) ──────────┘
//! ```
//!
//! The loop owns the transport exclusively and applies inbound frames with
//! this instance's origin tag, so its own applies never re-forward. Frames
//! arriving over the cross-tab relay take the identical decode path but reply
//! over the relay, keeping the two audiences separate.
//!
//! A disconnect clears remote presence and nothing else: the document and the
//! local presence state survive, and edits made while offline flow out on the
//! next sync exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use yrs::{Origin, Subscription};

use crate::doc::{DocError, DocHandle, DocUpdate};
use crate::presence::{PresenceEvent, PresenceOrigin, PresenceRegistry};
use crate::protocol::{Frame, SyncOp};
use crate::relay::{RelayBus, RelayChannel, RelayFrame};
use crate::transport::{
    ChannelTransport, JoinParams, TransportError, TransportEvent, TransportStatus, EVENT_DOC_FRAME,
};

/// Client behavior knobs.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Cross-tab relay; `None` disables relaying entirely.
    pub relay: Option<RelayBus>,
    /// Re-request sync state this often while joined; `None` disables.
    pub resync_interval: Option<Duration>,
}

/// Events surfaced to the client's consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Transport connection status changed.
    Status(TransportStatus),
    /// First sync answer applied; fires at most once per client.
    Synced,
    /// Presence states changed (local or remote origin).
    PresenceChanged(PresenceEvent),
    /// The client finished tearing down.
    Closed,
}

/// Client construction/teardown errors.
#[derive(Debug)]
pub enum ClientError {
    Transport(TransportError),
    Doc(DocError),
    /// The transport's (or registry's) event stream was already consumed.
    EventsTaken,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(e) => write!(f, "Transport error: {}", e),
            ClientError::Doc(e) => write!(f, "Document error: {}", e),
            ClientError::EventsTaken => write!(f, "Event stream already taken"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        ClientError::Transport(e)
    }
}

impl From<DocError> for ClientError {
    fn from(e: DocError) -> Self {
        ClientError::Doc(e)
    }
}

/// Live connection of one document to one room.
pub struct ChannelClient {
    instance_id: Uuid,
    room_id: String,
    doc: DocHandle,
    presence: Arc<PresenceRegistry>,
    joined: Arc<AtomicBool>,
    synced: Arc<AtomicBool>,
    events_rx: Mutex<Option<UnboundedReceiver<ClientEvent>>>,
    cancel: CancellationToken,
    done_rx: watch::Receiver<bool>,
}

impl ChannelClient {
    /// Connect a fresh document to `room_id` over `transport`.
    pub async fn connect(
        transport: Box<dyn ChannelTransport>,
        room_id: impl Into<String>,
        params: JoinParams,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Self::connect_with_doc(DocHandle::new(), transport, room_id, params, config).await
    }

    /// Connect an existing document, carrying its unsynced local edits into
    /// the room.
    pub async fn connect_with_doc(
        doc: DocHandle,
        transport: Box<dyn ChannelTransport>,
        room_id: impl Into<String>,
        params: JoinParams,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let transport: Arc<dyn ChannelTransport> = Arc::from(transport);
        let room_id = room_id.into();
        let instance_id = Uuid::new_v4();
        let origin = Origin::from(instance_id.to_string().as_str());

        let transport_rx = transport.take_events().ok_or(ClientError::EventsTaken)?;

        let presence = Arc::new(PresenceRegistry::new(doc.client_id()));
        let presence_rx = match presence.take_events() {
            Some(rx) => rx,
            None => return Err(ClientError::EventsTaken),
        };

        let (doc_tx, doc_rx) = unbounded_channel();
        let doc_sub = doc.observe(doc_tx)?;

        let relay = match &config.relay {
            Some(bus) => {
                let channel = bus.channel(transport.endpoint(), &room_id).await;
                let rx = channel.subscribe();
                Some((channel, rx))
            }
            None => None,
        };

        transport.join(&room_id, params).await?;
        info!("Channel client {instance_id} joined room {room_id}");

        let (events_tx, events_rx) = unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let joined = Arc::new(AtomicBool::new(false));
        let synced = Arc::new(AtomicBool::new(false));

        let event_loop = ClientLoop {
            instance_id,
            room_id: room_id.clone(),
            origin,
            doc: doc.clone(),
            presence: presence.clone(),
            transport,
            transport_rx,
            doc_rx,
            _doc_sub: doc_sub,
            presence_rx,
            relay,
            resync: config
                .resync_interval
                .map(|d| interval_at(Instant::now() + d, d)),
            joined: joined.clone(),
            synced: synced.clone(),
            events_tx,
            cancel: cancel.clone(),
            done_tx,
        };
        tokio::spawn(event_loop.run());

        Ok(Self {
            instance_id,
            room_id,
            doc,
            presence,
            joined,
            synced,
            events_rx: Mutex::new(Some(events_rx)),
            cancel,
            done_rx,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The shared document. Mutate it through normal yrs transactions; the
    /// client forwards resulting updates.
    pub fn doc(&self) -> &DocHandle {
        &self.doc
    }

    /// Presence states. `set_local_state`/`clear_local_state` here propagate
    /// to the room.
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Whether the transport currently reports connected.
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Whether the first sync answer has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Take the event receiver. Single consumer; returns `None` on second
    /// call.
    pub fn take_events(&self) -> Option<UnboundedReceiver<ClientEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Tear the client down: stop the loop, unsubscribe observers, leave the
    /// transport. Resolves once teardown finished. Idempotent.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        let mut done = self.done_rx.clone();
        // Err means the loop is gone, which is as done as it gets
        let _ = done.wait_for(|d| *d).await;
    }
}

/// Which path a frame arrived on; replies go back the same way.
#[derive(Clone, Copy)]
enum FramePath {
    Transport,
    Relay,
}

struct ClientLoop {
    instance_id: Uuid,
    room_id: String,
    origin: Origin,
    doc: DocHandle,
    presence: Arc<PresenceRegistry>,
    transport: Arc<dyn ChannelTransport>,
    transport_rx: UnboundedReceiver<TransportEvent>,
    doc_rx: UnboundedReceiver<DocUpdate>,
    _doc_sub: Subscription,
    presence_rx: UnboundedReceiver<PresenceEvent>,
    relay: Option<(RelayChannel, broadcast::Receiver<RelayFrame>)>,
    resync: Option<Interval>,
    joined: Arc<AtomicBool>,
    synced: Arc<AtomicBool>,
    events_tx: UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
}

impl ClientLoop {
    async fn run(mut self) {
        self.relay_warmup();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = self.transport_rx.recv() => match event {
                    Some(TransportEvent::Status(status)) => self.on_status(status).await,
                    Some(TransportEvent::Frame(bytes)) => {
                        self.on_frame(&bytes, FramePath::Transport).await;
                    }
                    None => {
                        self.on_status(TransportStatus::Disconnected).await;
                        break;
                    }
                },

                update = self.doc_rx.recv() => match update {
                    Some(update) => self.on_doc_update(update).await,
                    None => break,
                },

                event = self.presence_rx.recv() => match event {
                    Some(event) => self.on_presence_event(event).await,
                    None => break,
                },

                frame = relay_recv(&mut self.relay) => match frame {
                    Ok(frame) => {
                        if frame.origin != self.instance_id {
                            self.on_frame(&frame.bytes, FramePath::Relay).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Relay for room {} lagging, dropped {n} frames", self.room_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Relay for room {} closed", self.room_id);
                        self.relay = None;
                    }
                },

                _ = maybe_tick(&mut self.resync) => {
                    if self.joined.load(Ordering::SeqCst) {
                        debug!("Resync tick for room {}", self.room_id);
                        let frame = Frame::sync_step1(self.doc.state_vector()).encode();
                        self.send_on(FramePath::Transport, frame).await;
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// Let sibling contexts on the same relay channel converge without the
    /// server: ask for their state, their presence, and announce our own.
    fn relay_warmup(&self) {
        if let Some((channel, _)) = &self.relay {
            channel.publish(
                self.instance_id,
                Arc::new(Frame::sync_step1(self.doc.state_vector()).encode()),
            );
            channel.publish(self.instance_id, Arc::new(Frame::PresenceQuery.encode()));
            if let Some(update) = self.presence.encode_local() {
                channel.publish(self.instance_id, Arc::new(Frame::presence(update).encode()));
            }
        }
    }

    async fn on_status(&mut self, status: TransportStatus) {
        match status {
            TransportStatus::Connected => {
                self.joined.store(true, Ordering::SeqCst);
                info!("Room {} connected", self.room_id);
                let step1 = Frame::sync_step1(self.doc.state_vector()).encode();
                self.send_on(FramePath::Transport, step1).await;
                if let Some(update) = self.presence.encode_local() {
                    self.send_on(FramePath::Transport, Frame::presence(update).encode())
                        .await;
                }
            }
            TransportStatus::Disconnected => {
                self.joined.store(false, Ordering::SeqCst);
                info!("Room {} disconnected", self.room_id);
                // Peers are unreachable; their presence is stale. Ours and the
                // document survive for the next connection.
                self.presence.clear_remote();
            }
            TransportStatus::Connecting => {}
        }
        let _ = self.events_tx.send(ClientEvent::Status(status));
    }

    async fn on_frame(&mut self, bytes: &[u8], path: FramePath) {
        match Frame::decode(bytes) {
            Err(e) => {
                warn!("Dropping malformed frame in room {}: {e}", self.room_id);
            }
            Ok(Frame::Sync(op)) => {
                let answers_sync = matches!(op, SyncOp::Step2(_));
                match self.doc.handle_sync_op(op, &self.origin) {
                    Ok(Some(reply)) => {
                        self.send_on(path, Frame::Sync(reply).encode()).await;
                    }
                    Ok(None) => {
                        if answers_sync && !self.synced.swap(true, Ordering::SeqCst) {
                            debug!("Room {} synced", self.room_id);
                            let _ = self.events_tx.send(ClientEvent::Synced);
                        }
                    }
                    Err(e) => {
                        warn!("Dropping sync payload in room {}: {e}", self.room_id);
                    }
                }
            }
            Ok(Frame::Presence(update)) => {
                if let Err(e) = self.presence.apply_update(&update) {
                    warn!("Dropping presence update in room {}: {e}", self.room_id);
                }
            }
            Ok(Frame::PresenceQuery) => {
                let frame = Frame::presence(self.presence.encode_full()).encode();
                self.send_on(path, frame).await;
            }
        }
    }

    async fn on_doc_update(&mut self, update: DocUpdate) {
        // Updates applied by this instance are echoes of remote data
        if update.origin.as_ref() == Some(&self.origin) {
            return;
        }
        let bytes = Frame::sync_update(update.update).encode();
        if self.joined.load(Ordering::SeqCst) {
            self.send_on(FramePath::Transport, bytes.clone()).await;
        }
        self.send_on(FramePath::Relay, bytes).await;
    }

    async fn on_presence_event(&mut self, event: PresenceEvent) {
        if event.origin == PresenceOrigin::Local {
            let update = self.presence.encode_update(&event.touched());
            let bytes = Frame::presence(update).encode();
            if self.joined.load(Ordering::SeqCst) {
                self.send_on(FramePath::Transport, bytes.clone()).await;
            }
            self.send_on(FramePath::Relay, bytes).await;
        }
        let _ = self.events_tx.send(ClientEvent::PresenceChanged(event));
    }

    async fn send_on(&self, path: FramePath, bytes: Vec<u8>) {
        match path {
            FramePath::Transport => {
                if let Err(e) = self.transport.push(EVENT_DOC_FRAME, bytes).await {
                    warn!("Failed to push frame for room {}: {e}", self.room_id);
                }
            }
            FramePath::Relay => {
                if let Some((channel, _)) = &self.relay {
                    channel.publish(self.instance_id, Arc::new(bytes));
                }
            }
        }
    }

    async fn teardown(self) {
        // Stop observing before leaving so teardown traffic is not re-forwarded
        drop(self._doc_sub);
        self.transport.leave().await;
        let _ = self.events_tx.send(ClientEvent::Closed);
        let _ = self.done_tx.send(true);
        debug!(
            "Channel client {} for room {} closed",
            self.instance_id, self.room_id
        );
    }
}

async fn relay_recv(
    relay: &mut Option<(RelayChannel, broadcast::Receiver<RelayFrame>)>,
) -> Result<RelayFrame, broadcast::error::RecvError> {
    match relay {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn maybe_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
