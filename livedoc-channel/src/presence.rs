//! Presence ("awareness") state for real-time collaborator visibility.
//!
//! Tracks ephemeral per-client state — cursors, selections, profiles —
//! separately from document content. Entries are replaced wholesale per
//! client and are never persisted.
//!
//! ## Data flow
//!
//! ```text
//! set_local_state(json)
//!       │
//!       ▼
//! PresenceEvent { added/updated/removed, origin: Local }
//!       │
//!       ▼   encode_update([ids])               (transport / relay frame)
//! Remote PresenceRegistry::apply_update()
//!       │
//!       ▼
//! PresenceEvent { …, origin: Remote }  →  application
//! ```
//!
//! Wire layout per update (lib0 varints): entry count, then per entry the
//! client id, a per-client clock, and a JSON state string ("null" encodes a
//! removed client). An entry is accepted only when its clock advances past
//! the one already known, or when an equal-clock null confirms a removal.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::protocol::{
    read_var_string, read_var_u64, write_var_string, write_var_u64, ProtocolError,
};

/// Where a presence change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOrigin {
    /// Produced by this registry's own client (forward to peers).
    Local,
    /// Applied from a peer's update (surface to the app only).
    Remote,
}

/// One batch of presence changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    /// Clients that went from absent to present.
    pub added: Vec<u64>,
    /// Clients whose state was replaced.
    pub updated: Vec<u64>,
    /// Clients that went from present to absent.
    pub removed: Vec<u64>,
    pub origin: PresenceOrigin,
}

impl PresenceEvent {
    /// All client ids touched by this event, in added/updated/removed order.
    pub fn touched(&self) -> Vec<u64> {
        let mut ids = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    /// Per-client causality clock; higher wins.
    clock: u64,
    /// `None` marks a removed client whose clock must still be remembered.
    state: Option<Value>,
}

#[derive(Default)]
struct PresenceInner {
    entries: HashMap<u64, PresenceEntry>,
}

/// Per-connection presence store.
///
/// The local client id is authoritative locally: remote updates about it are
/// ignored rather than merged back.
pub struct PresenceRegistry {
    local_id: u64,
    inner: Mutex<PresenceInner>,
    events_tx: UnboundedSender<PresenceEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<PresenceEvent>>>,
}

impl PresenceRegistry {
    /// Create a registry for the given local client id.
    pub fn new(local_id: u64) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            local_id,
            inner: Mutex::new(PresenceInner::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// The local client id.
    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Take the change-event receiver. Single consumer; returns `None` on
    /// second call.
    pub fn take_events(&self) -> Option<UnboundedReceiver<PresenceEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Replace the local client's state wholesale.
    pub fn set_local_state(&self, state: Value) {
        let was_present;
        {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.entries.entry(self.local_id).or_insert(PresenceEntry {
                clock: 0,
                state: None,
            });
            was_present = entry.state.is_some();
            entry.clock += 1;
            entry.state = Some(state);
        }
        let event = if was_present {
            PresenceEvent {
                added: Vec::new(),
                updated: vec![self.local_id],
                removed: Vec::new(),
                origin: PresenceOrigin::Local,
            }
        } else {
            PresenceEvent {
                added: vec![self.local_id],
                updated: Vec::new(),
                removed: Vec::new(),
                origin: PresenceOrigin::Local,
            }
        };
        let _ = self.events_tx.send(event);
    }

    /// Remove the local client's state.
    pub fn clear_local_state(&self) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.entries.get_mut(&self.local_id) {
                Some(entry) if entry.state.is_some() => {
                    entry.clock += 1;
                    entry.state = None;
                    true
                }
                _ => false,
            }
        };
        if removed {
            let _ = self.events_tx.send(PresenceEvent {
                added: Vec::new(),
                updated: Vec::new(),
                removed: vec![self.local_id],
                origin: PresenceOrigin::Local,
            });
        }
    }

    /// The local client's current state, if set.
    pub fn local_state(&self) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&self.local_id)
            .and_then(|e| e.state.clone())
    }

    /// Snapshot of all present clients and their states.
    pub fn states(&self) -> HashMap<u64, Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// Apply a presence update received from a peer.
    ///
    /// Stale entries (clock not advancing) are ignored; entries about the
    /// local client are ignored outright.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), ProtocolError> {
        let mut pos = 0;
        let count = read_var_u64(update, &mut pos)?;

        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            for _ in 0..count {
                let client_id = read_var_u64(update, &mut pos)?;
                let clock = read_var_u64(update, &mut pos)?;
                let json = read_var_string(update, &mut pos)?;
                let state: Value = serde_json::from_str(&json)
                    .map_err(|_| ProtocolError::InvalidJson)?;
                let state = if state.is_null() { None } else { Some(state) };

                if client_id == self.local_id {
                    continue;
                }

                match inner.entries.get_mut(&client_id) {
                    Some(entry) => {
                        // Equal-clock null confirms a removal; anything else
                        // must advance the clock.
                        let accept = clock > entry.clock
                            || (clock == entry.clock && state.is_none() && entry.state.is_some());
                        if !accept {
                            continue;
                        }
                        let was_present = entry.state.is_some();
                        entry.clock = clock;
                        entry.state = state;
                        match (was_present, entry.state.is_some()) {
                            (false, true) => added.push(client_id),
                            (true, true) => updated.push(client_id),
                            (true, false) => removed.push(client_id),
                            (false, false) => {}
                        }
                    }
                    None => {
                        let is_present = state.is_some();
                        inner
                            .entries
                            .insert(client_id, PresenceEntry { clock, state });
                        if is_present {
                            added.push(client_id);
                        }
                    }
                }
            }
        }

        if !added.is_empty() || !updated.is_empty() || !removed.is_empty() {
            let _ = self.events_tx.send(PresenceEvent {
                added,
                updated,
                removed,
                origin: PresenceOrigin::Remote,
            });
        }
        Ok(())
    }

    /// Encode an update covering exactly the known clients in `clients`.
    ///
    /// Removed clients encode as JSON null; ids this registry has never seen
    /// are skipped.
    pub fn encode_update(&self, clients: &[u64]) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let entries: Vec<(u64, &PresenceEntry)> = clients
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|e| (*id, e)))
            .collect();

        let mut buf = Vec::with_capacity(16 + entries.len() * 32);
        write_var_u64(&mut buf, entries.len() as u64);
        for (client_id, entry) in entries {
            write_var_u64(&mut buf, client_id);
            write_var_u64(&mut buf, entry.clock);
            let json = match &entry.state {
                Some(state) => state.to_string(),
                None => "null".to_owned(),
            };
            write_var_string(&mut buf, &json);
        }
        buf
    }

    /// Encode all currently present clients.
    pub fn encode_full(&self) -> Vec<u8> {
        let ids: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .iter()
                .filter(|(_, e)| e.state.is_some())
                .map(|(id, _)| *id)
                .collect()
        };
        self.encode_update(&ids)
    }

    /// Encode the local client's entry, if its state is set.
    pub fn encode_local(&self) -> Option<Vec<u8>> {
        if self.local_state().is_some() {
            Some(self.encode_update(&[self.local_id]))
        } else {
            None
        }
    }

    /// Remove specific clients, returning an update that carries the
    /// removals to peers, or `None` when nothing was present. The local
    /// client is never removed this way.
    pub fn remove_clients(&self, clients: &[u64]) -> Option<Vec<u8>> {
        let removed: Vec<u64> = {
            let mut inner = self.inner.lock().unwrap();
            clients
                .iter()
                .filter(|id| **id != self.local_id)
                .filter_map(|id| match inner.entries.get_mut(id) {
                    Some(entry) if entry.state.is_some() => {
                        entry.clock += 1;
                        entry.state = None;
                        Some(*id)
                    }
                    _ => None,
                })
                .collect()
        };
        if removed.is_empty() {
            return None;
        }
        let _ = self.events_tx.send(PresenceEvent {
            added: Vec::new(),
            updated: Vec::new(),
            removed: removed.clone(),
            origin: PresenceOrigin::Remote,
        });
        Some(self.encode_update(&removed))
    }

    /// Drop every remote client's state, keeping the local entry.
    ///
    /// Used when the transport disconnects: peers will re-announce on
    /// reconnect, but the local user keeps editing with their own presence.
    pub fn clear_remote(&self) {
        let remote_ids: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .iter()
                .filter(|(id, e)| **id != self.local_id && e.state.is_some())
                .map(|(id, _)| *id)
                .collect()
        };
        let _ = self.remove_clients(&remote_ids);
    }
}

/// Client ids named by a presence update, without applying it.
pub fn decode_client_ids(update: &[u8]) -> Result<Vec<u64>, ProtocolError> {
    let mut pos = 0;
    let count = read_var_u64(update, &mut pos)?;
    let mut ids = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        ids.push(read_var_u64(update, &mut pos)?);
        let _clock = read_var_u64(update, &mut pos)?;
        let _state = read_var_string(update, &mut pos)?;
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut UnboundedReceiver<PresenceEvent>) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn test_set_local_emits_added_then_updated() {
        let registry = PresenceRegistry::new(1);
        let mut rx = registry.take_events().unwrap();

        registry.set_local_state(json!({"cursor": 3}));
        registry.set_local_state(json!({"cursor": 4}));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].added, vec![1]);
        assert_eq!(events[0].origin, PresenceOrigin::Local);
        assert_eq!(events[1].updated, vec![1]);
    }

    #[test]
    fn test_clear_local_emits_removed() {
        let registry = PresenceRegistry::new(1);
        let mut rx = registry.take_events().unwrap();

        registry.set_local_state(json!({"cursor": 1}));
        registry.clear_local_state();
        // Second clear is a no-op
        registry.clear_local_state();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].removed, vec![1]);
        assert!(registry.local_state().is_none());
    }

    #[test]
    fn test_update_roundtrip_exact_set() {
        let alice = PresenceRegistry::new(1);
        let bob = PresenceRegistry::new(2);
        let mut bob_rx = bob.take_events().unwrap();

        alice.set_local_state(json!({"name": "alice"}));
        bob.apply_update(&alice.encode_update(&[1])).unwrap();

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].added, vec![1]);
        assert_eq!(events[0].origin, PresenceOrigin::Remote);
        assert_eq!(bob.states().get(&1), Some(&json!({"name": "alice"})));
    }

    #[test]
    fn test_state_replaced_wholesale() {
        let registry = PresenceRegistry::new(9);
        let peer = PresenceRegistry::new(1);

        peer.set_local_state(json!({"cursor": 1, "color": "red"}));
        registry.apply_update(&peer.encode_update(&[1])).unwrap();
        peer.set_local_state(json!({"cursor": 2}));
        registry.apply_update(&peer.encode_update(&[1])).unwrap();

        // No merge: the "color" field is gone
        assert_eq!(registry.states().get(&1), Some(&json!({"cursor": 2})));
    }

    #[test]
    fn test_stale_clock_ignored() {
        let registry = PresenceRegistry::new(9);

        let mut fresh = Vec::new();
        write_var_u64(&mut fresh, 1);
        write_var_u64(&mut fresh, 1); // client
        write_var_u64(&mut fresh, 5); // clock
        write_var_string(&mut fresh, "{\"v\":5}");
        registry.apply_update(&fresh).unwrap();

        let mut stale = Vec::new();
        write_var_u64(&mut stale, 1);
        write_var_u64(&mut stale, 1);
        write_var_u64(&mut stale, 3);
        write_var_string(&mut stale, "{\"v\":3}");
        registry.apply_update(&stale).unwrap();

        assert_eq!(registry.states().get(&1), Some(&json!({"v": 5})));
    }

    #[test]
    fn test_removal_propagates() {
        let alice = PresenceRegistry::new(1);
        let bob = PresenceRegistry::new(2);
        let mut bob_rx = bob.take_events().unwrap();

        alice.set_local_state(json!({"here": true}));
        bob.apply_update(&alice.encode_update(&[1])).unwrap();
        alice.clear_local_state();
        bob.apply_update(&alice.encode_update(&[1])).unwrap();

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].removed, vec![1]);
        assert!(bob.states().is_empty());
    }

    #[test]
    fn test_equal_clock_null_confirms_removal() {
        let registry = PresenceRegistry::new(9);

        let mut present = Vec::new();
        write_var_u64(&mut present, 1);
        write_var_u64(&mut present, 1);
        write_var_u64(&mut present, 4);
        write_var_string(&mut present, "{}");
        registry.apply_update(&present).unwrap();

        let mut removal = Vec::new();
        write_var_u64(&mut removal, 1);
        write_var_u64(&mut removal, 1);
        write_var_u64(&mut removal, 4); // same clock, null state
        write_var_string(&mut removal, "null");
        registry.apply_update(&removal).unwrap();

        assert!(registry.states().is_empty());
    }

    #[test]
    fn test_remote_update_about_local_id_ignored() {
        let registry = PresenceRegistry::new(1);
        registry.set_local_state(json!({"mine": true}));

        let mut spoof = Vec::new();
        write_var_u64(&mut spoof, 1);
        write_var_u64(&mut spoof, 1); // local id
        write_var_u64(&mut spoof, 99);
        write_var_string(&mut spoof, "{\"mine\": false}");
        registry.apply_update(&spoof).unwrap();

        assert_eq!(registry.local_state(), Some(json!({"mine": true})));
    }

    #[test]
    fn test_clear_remote_keeps_local() {
        let registry = PresenceRegistry::new(1);
        let mut rx = registry.take_events().unwrap();
        let peer = PresenceRegistry::new(2);

        registry.set_local_state(json!({"me": 1}));
        peer.set_local_state(json!({"them": 2}));
        registry.apply_update(&peer.encode_update(&[2])).unwrap();
        drain(&mut rx);

        registry.clear_remote();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].removed, vec![2]);
        assert_eq!(events[0].origin, PresenceOrigin::Remote);
        assert_eq!(registry.states().len(), 1);
        assert!(registry.states().contains_key(&1));
        // Idempotent
        registry.clear_remote();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_encode_full_skips_removed() {
        let registry = PresenceRegistry::new(1);
        let peer_a = PresenceRegistry::new(2);
        let peer_b = PresenceRegistry::new(3);

        peer_a.set_local_state(json!({"a": 1}));
        peer_b.set_local_state(json!({"b": 2}));
        registry.apply_update(&peer_a.encode_update(&[2])).unwrap();
        registry.apply_update(&peer_b.encode_update(&[3])).unwrap();
        peer_a.clear_local_state();
        registry.apply_update(&peer_a.encode_update(&[2])).unwrap();

        let observer = PresenceRegistry::new(9);
        observer.apply_update(&registry.encode_full()).unwrap();
        assert_eq!(observer.states().len(), 1);
        assert!(observer.states().contains_key(&3));
    }

    #[test]
    fn test_encode_unknown_client_skipped() {
        let registry = PresenceRegistry::new(1);
        let update = registry.encode_update(&[42]);
        // Zero entries
        assert_eq!(update, vec![0]);
    }

    #[test]
    fn test_encode_local_requires_state() {
        let registry = PresenceRegistry::new(1);
        assert!(registry.encode_local().is_none());
        registry.set_local_state(json!({}));
        assert!(registry.encode_local().is_some());
        registry.clear_local_state();
        assert!(registry.encode_local().is_none());
    }

    #[test]
    fn test_malformed_update_rejected() {
        let registry = PresenceRegistry::new(1);
        // Claims one entry, carries none
        assert!(registry.apply_update(&[1]).is_err());
        // Bad JSON payload
        let mut bad = Vec::new();
        write_var_u64(&mut bad, 1);
        write_var_u64(&mut bad, 2);
        write_var_u64(&mut bad, 1);
        write_var_string(&mut bad, "not json");
        assert!(registry.apply_update(&bad).is_err());
    }

    #[test]
    fn test_take_events_single_consumer() {
        let registry = PresenceRegistry::new(1);
        assert!(registry.take_events().is_some());
        assert!(registry.take_events().is_none());
    }

    #[test]
    fn test_remove_clients_produces_removal_update() {
        let registry = PresenceRegistry::new(9);
        let peer = PresenceRegistry::new(1);
        peer.set_local_state(json!({"x": 1}));
        registry.apply_update(&peer.encode_update(&[1])).unwrap();

        let removal = registry.remove_clients(&[1]).unwrap();
        assert!(registry.states().is_empty());

        // The produced update removes the client on another registry too
        let observer = PresenceRegistry::new(5);
        observer.apply_update(&peer.encode_update(&[1])).unwrap();
        observer.apply_update(&removal).unwrap();
        assert!(observer.states().is_empty());
    }

    #[test]
    fn test_remove_clients_spares_local() {
        let registry = PresenceRegistry::new(1);
        registry.set_local_state(json!({"me": true}));
        assert!(registry.remove_clients(&[1]).is_none());
        assert!(registry.local_state().is_some());
    }

    #[test]
    fn test_decode_client_ids() {
        let registry = PresenceRegistry::new(1);
        registry.set_local_state(json!({"a": 1}));
        let peer = PresenceRegistry::new(7);
        peer.set_local_state(json!({"b": 2}));
        registry.apply_update(&peer.encode_update(&[7])).unwrap();

        let mut ids = decode_client_ids(&registry.encode_full()).unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 7]);

        assert!(decode_client_ids(&[2, 1]).is_err());
    }
}
