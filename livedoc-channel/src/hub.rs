//! In-process room hub: the loopback transport backend.
//!
//! Architecture:
//! ```text
//! MemoryTransport A ──┐
//!                     ├── Room (room_id) ── DocHandle (authority)
//! MemoryTransport B ──┘         │              │
//!                               │              └── presence mirror
//!                               │
//!                        broadcast fan-out
//!                   (member-tagged, echo-filtered)
//! ```
//!
//! Each room keeps an authoritative document and a presence mirror. Inbound
//! updates are applied to the authority, then fanned out to every other
//! member; sync step 1 requests are answered directly with step 2. On join a
//! member is greeted with the hub's own step 1 (pulling edits the member made
//! before connecting) and the room's known presence.
//!
//! Rooms live for the hub's lifetime, so a member that reconnects resumes
//! from the server-side state. Frames that fail to decode are logged and
//! dropped, never fatal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use yrs::Origin;

use crate::doc::DocHandle;
use crate::presence::{decode_client_ids, PresenceRegistry};
use crate::protocol::{Frame, SyncOp};
use crate::transport::{
    ChannelTransport, JoinParams, TransportError, TransportEvent, TransportStatus,
};

/// Endpoint reported by hubs unless overridden.
pub const DEFAULT_HUB_ENDPOINT: &str = "mem://hub";

/// Frames buffered per lagging member before drops.
const BROADCAST_CAPACITY: usize = 256;

/// Presence-mirror id, outside the 32-bit space yrs assigns to documents.
const HUB_PRESENCE_ID: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct RoomFrame {
    from: Uuid,
    bytes: Arc<Vec<u8>>,
}

struct Member {
    events_tx: UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
}

/// One room: authoritative document, presence mirror, member fan-out.
struct Room {
    doc: DocHandle,
    origin: Origin,
    presence: PresenceRegistry,
    broadcast: broadcast::Sender<RoomFrame>,
    members: Mutex<HashMap<Uuid, Member>>,
    /// Presence client ids announced over each member connection, so a
    /// member's departure can retire exactly the states it controlled.
    controlled: Mutex<HashMap<Uuid, HashSet<u64>>>,
}

impl Room {
    fn new() -> Self {
        let presence = PresenceRegistry::new(HUB_PRESENCE_ID);
        // The mirror is write-only; drop the receiver so events are discarded.
        drop(presence.take_events());
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            doc: DocHandle::new(),
            origin: Origin::from("room-hub"),
            presence,
            broadcast,
            members: Mutex::new(HashMap::new()),
            controlled: Mutex::new(HashMap::new()),
        }
    }

    /// Register a member: spawn its fan-out pump, report connected, greet.
    fn attach(&self, events_tx: UnboundedSender<TransportEvent>) -> Uuid {
        let member_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let mut broadcast_rx = self.broadcast.subscribe();
        self.members.lock().unwrap().insert(
            member_id,
            Member {
                events_tx: events_tx.clone(),
                cancel: cancel.clone(),
            },
        );

        let pump_tx = events_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = broadcast_rx.recv() => match frame {
                        Ok(frame) => {
                            if frame.from != member_id
                                && pump_tx.send(TransportEvent::Frame(frame.bytes.to_vec())).is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Hub member {member_id} lagging, dropped {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        let _ = events_tx.send(TransportEvent::Status(TransportStatus::Connected));
        let _ = events_tx.send(TransportEvent::Frame(
            Frame::sync_step1(self.doc.state_vector()).encode(),
        ));
        if !self.presence.states().is_empty() {
            let _ = events_tx.send(TransportEvent::Frame(
                Frame::presence(self.presence.encode_full()).encode(),
            ));
        }
        member_id
    }

    /// Apply one inbound frame from `from`, replying directly where the
    /// protocol asks for it and fanning out state changes to the others.
    fn handle_frame(&self, from: Uuid, bytes: &[u8], reply: &UnboundedSender<TransportEvent>) {
        match Frame::decode(bytes) {
            Err(e) => {
                warn!("Dropping malformed frame from hub member {from}: {e}");
            }
            Ok(Frame::Sync(SyncOp::Step1(state_vector))) => match self.doc.diff(&state_vector) {
                Ok(diff) => {
                    let _ = reply.send(TransportEvent::Frame(Frame::sync_step2(diff).encode()));
                }
                Err(e) => warn!("Dropping sync request from hub member {from}: {e}"),
            },
            Ok(Frame::Sync(SyncOp::Step2(update) | SyncOp::Update(update))) => {
                match self.doc.apply_update(&update, &self.origin) {
                    // Rebroadcast as an update regardless of inbound op: step 2
                    // answers one member's request, not everyone's.
                    Ok(()) => self.fan_out(from, Frame::sync_update(update).encode()),
                    Err(e) => warn!("Dropping update from hub member {from}: {e}"),
                }
            }
            Ok(Frame::Presence(update)) => match self.presence.apply_update(&update) {
                Ok(()) => {
                    if let Ok(ids) = decode_client_ids(&update) {
                        self.controlled
                            .lock()
                            .unwrap()
                            .entry(from)
                            .or_default()
                            .extend(ids);
                    }
                    self.fan_out(from, Frame::presence(update).encode());
                }
                Err(e) => warn!("Dropping presence update from hub member {from}: {e}"),
            },
            Ok(Frame::PresenceQuery) => {
                let _ = reply.send(TransportEvent::Frame(
                    Frame::presence(self.presence.encode_full()).encode(),
                ));
            }
        }
    }

    fn fan_out(&self, from: Uuid, bytes: Vec<u8>) {
        let _ = self.broadcast.send(RoomFrame {
            from,
            bytes: Arc::new(bytes),
        });
    }

    /// Remove a member, retiring the presence states it controlled.
    fn detach(&self, member_id: Uuid) {
        if let Some(member) = self.members.lock().unwrap().remove(&member_id) {
            member.cancel.cancel();
        }
        let ids: Vec<u64> = self
            .controlled
            .lock()
            .unwrap()
            .remove(&member_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        if let Some(removal) = self.presence.remove_clients(&ids) {
            self.fan_out(member_id, Frame::presence(removal).encode());
        }
        debug!("Hub member {member_id} detached");
    }

    /// Drop every member at once (server-restart semantics for tests).
    fn kick_all(&self) {
        let members: Vec<(Uuid, Member)> = self.members.lock().unwrap().drain().collect();
        let ids: Vec<u64> = self
            .controlled
            .lock()
            .unwrap()
            .drain()
            .flat_map(|(_, set)| set)
            .collect();
        let _ = self.presence.remove_clients(&ids);
        for (member_id, member) in members {
            member.cancel.cancel();
            let _ = member
                .events_tx
                .send(TransportEvent::Status(TransportStatus::Disconnected));
            debug!("Hub member {member_id} dropped");
        }
    }

    fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }
}

/// In-process hub serving any number of rooms.
pub struct RoomHub {
    endpoint: String,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_HUB_ENDPOINT)
    }

    /// Hub with a distinct endpoint identity (isolates relay scopes).
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Get or create a room.
    async fn room(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        info!("Hub opening room {room_id}");
        let room = Arc::new(Room::new());
        rooms.insert(room_id.to_owned(), room.clone());
        room
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|r| r.member_count()).unwrap_or(0)
    }

    /// Drop every member of a room, reporting `Disconnected` to each.
    ///
    /// The room and its document survive; members may rejoin.
    pub async fn disconnect_all(&self, room_id: &str) {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(room_id).cloned()
        };
        if let Some(room) = room {
            room.kick_all();
        }
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Loopback transport attached to a [`RoomHub`].
pub struct MemoryTransport {
    hub: Arc<RoomHub>,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
    joined: Mutex<Option<JoinedRoom>>,
}

struct JoinedRoom {
    room: Arc<Room>,
    member_id: Uuid,
}

impl MemoryTransport {
    pub fn new(hub: Arc<RoomHub>) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            hub,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            joined: Mutex::new(None),
        }
    }

    fn detach(&self) {
        if let Some(joined) = self.joined.lock().unwrap().take() {
            joined.room.detach(joined.member_id);
        }
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    async fn join(&self, room_id: &str, _params: JoinParams) -> Result<(), TransportError> {
        let room = self.hub.room(room_id).await;
        let mut slot = self.joined.lock().unwrap();
        if slot.is_some() {
            return Err(TransportError::Join("transport already joined".to_owned()));
        }
        let member_id = room.attach(self.events_tx.clone());
        *slot = Some(JoinedRoom { room, member_id });
        Ok(())
    }

    async fn leave(&self) {
        self.detach();
        let _ = self
            .events_tx
            .send(TransportEvent::Status(TransportStatus::Disconnected));
    }

    async fn push(&self, _event: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let joined = self.joined.lock().unwrap();
        match joined.as_ref() {
            Some(j) => {
                j.room.handle_frame(j.member_id, &payload, &self.events_tx);
                Ok(())
            }
            None => Err(TransportError::NotJoined),
        }
    }

    fn take_events(&self) -> Option<UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn endpoint(&self) -> &str {
        self.hub.endpoint()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.detach();
    }
}
