//! # livedoc-channel — Live document sync over swappable channel connections
//!
//! Keeps a CRDT document synchronized across clients through a room-scoped
//! channel connection, and lets the application repoint that connection at a
//! different room without tearing down its editing surfaces.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   migrate / destroy   ┌──────────────────┐
//! │ ChannelRegistry  │ ────────────────────► │ ChannelEntry     │
//! │ current+draining │                       │ (state machine)  │
//! └──────────────────┘                       └────────┬─────────┘
//!                                                     │ owns
//!                                                     ▼
//! ┌─────────────┐   frames    ┌───────────────┐   ┌──────────────┐
//! │ RelayBus    │ ◄──────────► │ ChannelClient │──►│ Transport    │
//! │ (cross-tab) │              │ (event loop)  │   │ (ws or mem)  │
//! └─────────────┘              └──────┬────────┘   └──────┬───────┘
//!                                     │ owns              │
//!                              ┌──────┴────────┐   ┌──────┴───────┐
//!                              │ DocHandle +   │   │ ChannelServer│
//!                              │ Presence      │   │ / RoomHub    │
//!                              └───────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire frames (lib0 varint framing, Yjs-compatible)
//! - [`doc`] — `yrs::Doc` wrapper: state vectors, diffs, origin-tagged applies
//! - [`presence`] — Ephemeral per-client states with clocks and change events
//! - [`transport`] — The channel connection abstraction
//! - [`relay`] — Same-process cross-tab fan-out with echo suppression
//! - [`events`] — Callback bus with RAII subscriptions
//! - [`client`] — The sync engine binding one document to one room
//! - [`registry`] — Current/draining connection lifecycle with settle + drain
//! - [`hub`] — In-process room authority and loopback transport
//! - [`ws`] / [`server`] — WebSocket transport and server front-end
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Frame encode (1KB update) | <300ns |
//! | Frame decode (1KB update) | <300ns |
//! | Presence update encode (10 clients) | <2µs |
//! | Relay fan-out, 1K frames × 8 subscribers | <10ms |

pub mod client;
pub mod doc;
pub mod events;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod transport;
pub mod ws;

// Re-exports for convenience
pub use client::{ChannelClient, ClientConfig, ClientError, ClientEvent};
pub use doc::{DocError, DocHandle, DocUpdate};
pub use events::{EventBus, EventSubscription};
pub use hub::{MemoryTransport, RoomHub};
pub use presence::{PresenceEvent, PresenceOrigin, PresenceRegistry};
pub use protocol::{Frame, ProtocolError, SyncOp};
pub use registry::{
    ChannelEntry, ChannelRegistry, ChannelState, MigrateError, RegistryConfig, RegistryEvent,
};
pub use relay::{RelayBus, RelayChannel, RelayFrame};
pub use server::{ChannelServer, ServerConfig};
pub use transport::{
    ChannelTransport, JoinParams, TransportError, TransportEvent, TransportStatus,
};
pub use ws::WsTransport;
