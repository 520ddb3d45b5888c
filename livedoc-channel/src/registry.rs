//! Channel registry: swap the live room connection without dropping surfaces.
//!
//! Entry lifecycle:
//! ```text
//! Connecting ──connected──> Settling ──synced──> Active
//!     │                        │                   │
//!     │                        │ (timeout: stays,  │ superseded
//!     │                        │  caller decides)  ▼
//!     └──────── superseded ────┴─────────────> Draining ──grace──> Destroyed
//!
//! displacement / destroy(): any non-destroyed state ──> Destroyed
//! ```
//!
//! `migrate` builds a fresh entry (new client, document, presence), relabels
//! the old current entry as draining, and resolves once the new entry is
//! active. The draining entry survives until the grace period after the new
//! one activates, so in-flight traffic on the old connection finishes cleanly.
//! At most one current and one draining entry exist at any instant.
//!
//! The slot mutex is never held across an await point; per-entry state lives
//! in a watch channel written through one transition function that enforces
//! the legality table above.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{ChannelClient, ClientConfig, ClientError, ClientEvent};
use crate::events::{EventBus, EventSubscription};
use crate::relay::RelayBus;
use crate::transport::{ChannelTransport, JoinParams, TransportStatus};

/// Delay between a successor activating and the old connection's teardown.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(2000);

/// Maximum time `migrate` waits for the new entry to activate.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Registry behavior knobs; the client-level settings are handed to every
/// entry's client.
#[derive(Clone)]
pub struct RegistryConfig {
    pub drain_grace: Duration,
    pub settle_timeout: Duration,
    pub relay: Option<RelayBus>,
    pub resync_interval: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            drain_grace: DEFAULT_DRAIN_GRACE,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            relay: None,
            resync_interval: None,
        }
    }
}

/// Lifecycle state of one managed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Transport join issued, not yet connected.
    Connecting,
    /// Transport connected, first sync answer outstanding.
    Settling,
    /// Connected and synced.
    Active,
    /// Superseded; kept alive for the grace period.
    Draining,
    /// Torn down; terminal.
    Destroyed,
}

impl ChannelState {
    fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Connecting, Settling)
                | (Connecting, Draining)
                | (Connecting, Destroyed)
                | (Settling, Active)
                | (Settling, Draining)
                | (Settling, Destroyed)
                | (Active, Draining)
                | (Active, Destroyed)
                | (Draining, Destroyed)
        )
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Settling => "settling",
            ChannelState::Active => "active",
            ChannelState::Draining => "draining",
            ChannelState::Destroyed => "destroyed",
        };
        write!(f, "{}", name)
    }
}

/// One state transition, published to registry subscribers.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub entry_id: Uuid,
    pub room_id: String,
    pub state: ChannelState,
}

/// Migration failures. Only the settle wait surfaces errors; entry-level
/// teardown problems are logged, not propagated.
#[derive(Debug)]
pub enum MigrateError {
    /// Building or joining the entry's client failed.
    Connect(ClientError),
    /// The new entry did not activate in time; it stays settling.
    SettleTimeout,
    /// The new entry was destroyed before activating (displaced or torn down).
    EntryDestroyed,
    /// The registry was destroyed while waiting.
    Aborted,
    /// `migrate` was called on an already-destroyed registry.
    RegistryDestroyed,
}

impl std::fmt::Display for MigrateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrateError::Connect(e) => write!(f, "Failed to connect entry: {}", e),
            MigrateError::SettleTimeout => write!(f, "Entry did not settle in time"),
            MigrateError::EntryDestroyed => write!(f, "Entry destroyed before settling"),
            MigrateError::Aborted => write!(f, "Registry destroyed while settling"),
            MigrateError::RegistryDestroyed => write!(f, "Registry already destroyed"),
        }
    }
}

impl std::error::Error for MigrateError {}

impl From<ClientError> for MigrateError {
    fn from(e: ClientError) -> Self {
        MigrateError::Connect(e)
    }
}

/// One managed connection: a client plus its lifecycle state.
pub struct ChannelEntry {
    id: Uuid,
    room_id: String,
    client: ChannelClient,
    created_at: Instant,
    settled_at: Mutex<Option<Instant>>,
    state_tx: watch::Sender<ChannelState>,
    cancel: CancellationToken,
}

impl ChannelEntry {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The entry's client, for document and presence access.
    pub fn client(&self) -> &ChannelClient {
        &self.client
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Watch the entry's state changes.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the entry first became active; set once, never updated.
    pub fn settled_at(&self) -> Option<Instant> {
        *self.settled_at.lock().unwrap()
    }

    /// Apply `next` if the legality table allows it; publish and return
    /// whether the state changed. The single write path for entry state.
    fn transition(&self, next: ChannelState, bus: &EventBus<RegistryEvent>) -> bool {
        let mut changed = false;
        self.state_tx.send_if_modified(|state| {
            if !state.can_transition_to(next) {
                return false;
            }
            *state = next;
            changed = true;
            true
        });
        if !changed {
            return false;
        }
        if next == ChannelState::Active {
            let mut settled = self.settled_at.lock().unwrap();
            if settled.is_none() {
                *settled = Some(Instant::now());
            }
        }
        debug!("Channel entry {} ({}) is now {}", self.id, self.room_id, next);
        bus.publish(&RegistryEvent {
            entry_id: self.id,
            room_id: self.room_id.clone(),
            state: next,
        });
        true
    }
}

#[derive(Default)]
struct Slots {
    current: Option<Arc<ChannelEntry>>,
    draining: Option<Arc<ChannelEntry>>,
    drain_timer: Option<CancellationToken>,
}

struct RegistryInner {
    config: RegistryConfig,
    slots: Mutex<Slots>,
    bus: EventBus<RegistryEvent>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
}

/// Manages the live (current) and outgoing (draining) channel connections.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                slots: Mutex::new(Slots::default()),
                bus: EventBus::new(),
                cancel: CancellationToken::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Repoint the live connection at `room_id` over `transport`.
    ///
    /// Builds a fresh entry, relabels the old current entry as draining
    /// (destroying any entry that was already draining), and resolves once
    /// the new entry activates. On `SettleTimeout` the entry stays settling
    /// and remains current; retry with another `migrate` or call `destroy`.
    pub async fn migrate(
        &self,
        transport: Box<dyn ChannelTransport>,
        room_id: impl Into<String>,
        params: JoinParams,
    ) -> Result<Arc<ChannelEntry>, MigrateError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MigrateError::RegistryDestroyed);
        }
        let room_id = room_id.into();
        let client_config = ClientConfig {
            relay: self.inner.config.relay.clone(),
            resync_interval: self.inner.config.resync_interval,
        };
        let client =
            ChannelClient::connect(transport, room_id.clone(), params, client_config).await?;
        let client_events = client
            .take_events()
            .ok_or(MigrateError::Connect(ClientError::EventsTaken))?;

        let entry = Arc::new(ChannelEntry {
            id: Uuid::new_v4(),
            room_id: room_id.clone(),
            client,
            created_at: Instant::now(),
            settled_at: Mutex::new(None),
            state_tx: watch::channel(ChannelState::Connecting).0,
            cancel: self.inner.cancel.child_token(),
        });
        let mut state_rx = entry.state_tx.subscribe();
        info!("Migrating channel to room {room_id} (entry {})", entry.id);

        // Install under the slot lock; re-check destroyed so a concurrent
        // destroy() cannot leave this entry stranded outside the slots.
        let install = {
            let mut slots = self.inner.slots.lock().unwrap();
            if self.inner.destroyed.load(Ordering::SeqCst) {
                None
            } else {
                let displaced = slots.draining.take();
                if let Some(timer) = slots.drain_timer.take() {
                    timer.cancel();
                }
                let superseded = slots.current.take();
                if let Some(old) = &superseded {
                    slots.draining = Some(old.clone());
                }
                slots.current = Some(entry.clone());
                Some((displaced, superseded))
            }
        };
        let Some((displaced, superseded)) = install else {
            self.inner.destroy_entry(&entry).await;
            return Err(MigrateError::RegistryDestroyed);
        };
        if let Some(old) = displaced {
            info!("Displacing draining entry {} for room {}", old.id, old.room_id);
            self.inner.destroy_entry(&old).await;
        }
        if let Some(old) = superseded {
            old.transition(ChannelState::Draining, &self.inner.bus);
        }
        // Announce the newcomer after displacement so subscribers never see
        // three live entries
        self.inner.bus.publish(&RegistryEvent {
            entry_id: entry.id,
            room_id: entry.room_id.clone(),
            state: ChannelState::Connecting,
        });

        tokio::spawn(monitor_entry(self.inner.clone(), entry.clone(), client_events));

        let settle = async {
            loop {
                match *state_rx.borrow_and_update() {
                    ChannelState::Active => return Ok(()),
                    ChannelState::Destroyed => return Err(MigrateError::EntryDestroyed),
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MigrateError::EntryDestroyed);
                }
            }
        };
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(MigrateError::Aborted),
            result = timeout(self.inner.config.settle_timeout, settle) => match result {
                Ok(Ok(())) => Ok(entry),
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    warn!("Entry {} for room {room_id} did not settle in time", entry.id);
                    Err(MigrateError::SettleTimeout)
                }
            },
        }
    }

    pub fn current_entry(&self) -> Option<Arc<ChannelEntry>> {
        self.inner.slots.lock().unwrap().current.clone()
    }

    pub fn draining_entry(&self) -> Option<Arc<ChannelEntry>> {
        self.inner.slots.lock().unwrap().draining.clone()
    }

    /// Whether a migration is still in flight: the current entry has not
    /// activated yet, or an old entry is still draining.
    pub fn is_transitioning(&self) -> bool {
        let slots = self.inner.slots.lock().unwrap();
        let current_pending = slots
            .current
            .as_ref()
            .is_some_and(|e| e.state() != ChannelState::Active);
        current_pending || slots.draining.is_some()
    }

    /// Register a callback for every entry state transition (including entry
    /// creation, reported as `Connecting`). Dropping the returned guard
    /// unregisters it.
    pub fn subscribe(
        &self,
        callback: impl Fn(&RegistryEvent) + Send + Sync + 'static,
    ) -> EventSubscription<RegistryEvent> {
        self.inner.bus.subscribe(callback)
    }

    /// Tear down the registry: cancel timers and settle waits, destroy both
    /// entries, drop all subscriptions. Idempotent. Clearing the bus waits
    /// out any in-flight notification, so no subscriber callback fires once
    /// this returns.
    pub async fn destroy(&self) {
        if !self.inner.destroyed.swap(true, Ordering::SeqCst) {
            info!("Destroying channel registry");
        }
        self.inner.cancel.cancel();
        let (current, draining, timer) = {
            let mut slots = self.inner.slots.lock().unwrap();
            (
                slots.current.take(),
                slots.draining.take(),
                slots.drain_timer.take(),
            )
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(entry) = current {
            self.inner.destroy_entry(&entry).await;
        }
        if let Some(entry) = draining {
            self.inner.destroy_entry(&entry).await;
        }
        self.inner.bus.clear();
    }
}

impl RegistryInner {
    /// Destroy one entry and await its client teardown. The transition gate
    /// makes the `Destroyed` notification fire at most once.
    async fn destroy_entry(self: &Arc<Self>, entry: &Arc<ChannelEntry>) {
        let first = entry.transition(ChannelState::Destroyed, &self.bus);
        entry.cancel.cancel();
        entry.client.destroy().await;
        if first {
            info!("Channel entry {} for room {} destroyed", entry.id, entry.room_id);
        }
    }

    /// (Re)start the drain grace timer. Called whenever the current entry
    /// activates; an already-running timer is cancelled so the grace period
    /// restarts from zero.
    fn arm_drain_timer(self: &Arc<Self>) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(timer) = slots.drain_timer.take() {
            timer.cancel();
        }
        let Some(draining) = slots.draining.clone() else {
            return;
        };
        let timer = self.cancel.child_token();
        slots.drain_timer = Some(timer.clone());
        drop(slots);

        let inner = self.clone();
        let grace = inner.config.drain_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            debug!("Drain grace elapsed for entry {}", draining.id);
            {
                let mut slots = inner.slots.lock().unwrap();
                if slots
                    .draining
                    .as_ref()
                    .is_some_and(|e| e.id == draining.id)
                {
                    slots.draining = None;
                    slots.drain_timer = None;
                }
            }
            inner.destroy_entry(&draining).await;
        });
    }
}

/// Map one entry's client events onto state transitions. `Active` requires a
/// connected transport AND an applied sync answer, in either arrival order.
async fn monitor_entry(
    inner: Arc<RegistryInner>,
    entry: Arc<ChannelEntry>,
    mut events: UnboundedReceiver<ClientEvent>,
) {
    loop {
        tokio::select! {
            _ = entry.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(ClientEvent::Status(TransportStatus::Connected)) => {
                    entry.transition(ChannelState::Settling, &inner.bus);
                    if entry.client.is_synced()
                        && entry.transition(ChannelState::Active, &inner.bus)
                    {
                        inner.arm_drain_timer();
                    }
                }
                Some(ClientEvent::Synced) => {
                    if entry.transition(ChannelState::Active, &inner.bus) {
                        inner.arm_drain_timer();
                    }
                }
                Some(ClientEvent::Status(_)) | Some(ClientEvent::PresenceChanged(_)) => {}
                Some(ClientEvent::Closed) | None => break,
            },
        }
    }
}
