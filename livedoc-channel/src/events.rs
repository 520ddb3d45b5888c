//! Typed publish/subscribe for lifecycle notifications.
//!
//! A tiny callback list: `subscribe` hands back an RAII [`EventSubscription`]
//! guard (same discipline as the document library's update subscriptions), and
//! dropping the guard unregisters the callback. `clear` drops every handler at
//! once and waits out any delivery already in flight, so nothing fires after a
//! registry-wide teardown returns.
//!
//! Handlers run on the publishing task and deliveries are serialized through
//! one dispatch lock. A handler may subscribe or drop guards (those touch only
//! the handler list), but must not publish to or clear the bus it is running
//! on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    handlers: Mutex<Vec<(u64, Handler<E>)>>,
    // Serializes delivery; held across snapshot and invocation
    dispatch: Mutex<()>,
    next_id: AtomicU64,
}

/// Multi-subscriber event dispatch with RAII unsubscription.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(Vec::new()),
                dispatch: Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback. It stays registered until the returned guard is
    /// dropped or the bus is cleared.
    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> EventSubscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .unwrap()
            .push((id, Arc::new(handler)));
        EventSubscription {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Invoke every registered handler with `event`. Deliveries are
    /// serialized across publishers.
    pub fn publish(&self, event: &E) {
        let _delivering = self.inner.dispatch.lock().unwrap();
        let snapshot: Vec<Handler<E>> = self
            .inner
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    /// Drop every handler, waiting for any in-flight delivery to finish.
    /// Outstanding guards become no-ops; no handler runs after this returns.
    pub fn clear(&self) {
        let _delivering = self.inner.dispatch.lock().unwrap();
        self.inner.handlers.lock().unwrap().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().unwrap().len()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Guard for one registered callback; dropping it unregisters.
pub struct EventSubscription<E> {
    inner: Arc<BusInner<E>>,
    id: u64,
}

impl<E> Drop for EventSubscription<E> {
    fn drop(&mut self) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Condvar;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let _s1 = bus.subscribe(move |e| {
            h1.fetch_add(*e as usize, Ordering::SeqCst);
        });
        let h2 = hits.clone();
        let _s2 = bus.subscribe(move |e| {
            h2.fetch_add(*e as usize, Ordering::SeqCst);
        });

        bus.publish(&5);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_dropped_guard_unregisters() {
        let bus: EventBus<()> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let guard = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(guard);
        bus.publish(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn test_clear_silences_live_guards() {
        let bus: EventBus<()> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let guard = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.clear();
        bus.publish(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Dropping the stale guard after clear is harmless
        drop(guard);
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn test_handler_may_subscribe_reentrantly() {
        let bus: EventBus<()> = EventBus::new();
        let bus2 = bus.clone();
        let extra: Arc<Mutex<Vec<EventSubscription<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let extra2 = extra.clone();
        let _guard = bus.subscribe(move |_| {
            let sub = bus2.subscribe(|_| {});
            extra2.lock().unwrap().push(sub);
        });

        bus.publish(&());
        assert_eq!(bus.handler_count(), 2);
    }

    #[test]
    fn test_clear_waits_for_in_flight_delivery() {
        let bus: EventBus<()> = EventBus::new();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let entered = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicUsize::new(0));

        let gate2 = gate.clone();
        let entered2 = entered.clone();
        let delivered2 = delivered.clone();
        let _guard = bus.subscribe(move |_| {
            entered2.store(true, Ordering::SeqCst);
            let (open, woken) = &*gate2;
            let mut open = open.lock().unwrap();
            while !*open {
                open = woken.wait(open).unwrap();
            }
            delivered2.fetch_add(1, Ordering::SeqCst);
        });

        let publisher = {
            let bus = bus.clone();
            thread::spawn(move || bus.publish(&()))
        };
        while !entered.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        let cleared = Arc::new(AtomicBool::new(false));
        let clearer = {
            let bus = bus.clone();
            let cleared = cleared.clone();
            thread::spawn(move || {
                bus.clear();
                cleared.store(true, Ordering::SeqCst);
            })
        };

        // The handler is parked mid-delivery, so clear must still be waiting
        thread::sleep(Duration::from_millis(50));
        assert!(!cleared.load(Ordering::SeqCst));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);

        {
            let (open, woken) = &*gate;
            *open.lock().unwrap() = true;
            woken.notify_all();
        }
        publisher.join().unwrap();
        clearer.join().unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        // Once clear has returned nothing is registered to fire
        bus.publish(&());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(), 0);
    }
}
