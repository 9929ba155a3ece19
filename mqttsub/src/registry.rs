//! Subscription registry.
//!
//! Maps topic filters to handler registrations and resolves, for each
//! published topic, the handlers that must receive it. Identical filter
//! strings share one entry; overlapping but distinct filters (`a/+` and
//! `a/b`) stay separate and are both evaluated.
//!
//! The registry is a copy-on-write snapshot: dispatch clones an `Arc` under
//! a short read lock and then iterates without holding any lock, so handler
//! invocation never blocks registration or other dispatch loops.

use crate::handler::Handler;
use crate::pool::ConnectionId;
use crate::topic::{TopicFilter, TopicName};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// Result of removing a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unregistered {
    /// Other handlers are still registered for the filter.
    HandlersRemain,
    /// The filter has no handlers left and was removed; an UNSUBSCRIBE is due.
    FilterRemoved(TopicFilter),
}

/// Round-robin cursor shared by the members of one queue-mode fan-out set.
///
/// Without a shared group the broker sends a copy of every message to each
/// connection of the set. A ring built with [`QueueRing::carried_by`] only
/// accepts the copy arriving on its carrier and drops the rest.
#[derive(Debug, Default)]
pub(crate) struct QueueRing {
    cursor: AtomicUsize,
    carrier: Option<ConnectionId>,
}

impl QueueRing {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn carried_by(connection: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            cursor: AtomicUsize::new(0),
            carrier: Some(connection),
        })
    }

    fn carries(&self, from: Option<ConnectionId>) -> bool {
        match (self.carrier, from) {
            (Some(carrier), Some(from)) => carrier == from,
            _ => true,
        }
    }

    fn next(&self, members: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % members
    }
}

/// How a distributor slot is attached to its registration.
pub(crate) struct SlotBinding {
    pub connection: ConnectionId,
    pub slot: usize,
    pub queue: Option<Arc<QueueRing>>,
    pub token: CancellationToken,
}

#[derive(Clone)]
struct Registration {
    id: RegistrationId,
    handler: Arc<dyn Handler>,
    connection: Option<ConnectionId>,
    slot: Option<usize>,
    queue: Option<Arc<QueueRing>>,
    token: Option<CancellationToken>,
}

impl Registration {
    fn accepts(&self, from: Option<ConnectionId>) -> bool {
        match (self.connection, from) {
            (Some(bound), Some(from)) => bound == from,
            _ => true,
        }
    }

    fn in_ring(&self, ring: &Arc<QueueRing>) -> bool {
        self.queue.as_ref().is_some_and(|q| Arc::ptr_eq(q, ring))
    }

    fn delivery(&self) -> Delivery {
        Delivery {
            id: self.id,
            handler: self.handler.clone(),
            slot: self.slot,
            token: self.token.clone(),
        }
    }
}

#[derive(Clone)]
struct FilterEntry {
    filter: TopicFilter,
    registrations: Vec<Registration>,
}

impl FilterEntry {
    fn deliveries(&self, from: Option<ConnectionId>) -> Vec<Delivery> {
        let mut out = Vec::with_capacity(self.registrations.len());
        let mut rings: Vec<&Arc<QueueRing>> = Vec::new();

        for reg in self.registrations.iter().filter(|r| r.accepts(from)) {
            let Some(ring) = &reg.queue else {
                out.push(reg.delivery());
                continue;
            };
            if rings.iter().any(|r| Arc::ptr_eq(r, ring)) {
                continue;
            }
            rings.push(ring);
            if !ring.carries(from) {
                continue;
            }

            // One delivery per queue set, rotating over the fan-out index.
            let members: Vec<&Registration> =
                self.registrations.iter().filter(|r| r.in_ring(ring)).collect();
            out.push(members[ring.next(members.len())].delivery());
        }

        out
    }
}

#[derive(Clone, Default)]
struct Snapshot {
    entries: Vec<Arc<FilterEntry>>,
    index: HashMap<Arc<str>, usize>,
    owners: HashMap<RegistrationId, Arc<str>>,
}

/// A handler resolved for one message.
#[derive(Clone)]
pub struct Delivery {
    id: RegistrationId,
    handler: Arc<dyn Handler>,
    slot: Option<usize>,
    token: Option<CancellationToken>,
}

impl Delivery {
    /// Registration this delivery resolved to.
    pub fn registration(&self) -> RegistrationId {
        self.id
    }

    /// Handler to invoke.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Fan-out slot of the registration, if it belongs to a subscription handle.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// False once the owning slot has been torn down.
    pub fn is_live(&self) -> bool {
        self.token.as_ref().is_none_or(|t| !t.is_cancelled())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Lazy iterator over the handlers matching one topic.
///
/// Each call to `dispatch` starts a fresh pass over its own snapshot.
pub struct Matches {
    snapshot: Arc<Snapshot>,
    topic: TopicName,
    from: Option<ConnectionId>,
    next_entry: usize,
    pending: std::vec::IntoIter<Delivery>,
}

impl Iterator for Matches {
    type Item = Delivery;

    fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.pending.next() {
                return Some(delivery);
            }
            let entry = self.snapshot.entries.get(self.next_entry)?;
            self.next_entry += 1;
            if entry.filter.matches(&self.topic) {
                self.pending = entry.deliveries(self.from).into_iter();
            }
        }
    }
}

/// Thread-safe filter → handler registry.
pub struct SubscriptionRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
    next_id: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for `filter`.
    pub fn register(&self, filter: TopicFilter, handler: Arc<dyn Handler>) -> RegistrationId {
        self.insert(filter, handler, None)
    }

    pub(crate) fn register_slot(
        &self,
        filter: TopicFilter,
        handler: Arc<dyn Handler>,
        binding: SlotBinding,
    ) -> RegistrationId {
        self.insert(filter, handler, Some(binding))
    }

    fn insert(
        &self,
        filter: TopicFilter,
        handler: Arc<dyn Handler>,
        binding: Option<SlotBinding>,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (connection, slot, queue, token) = match binding {
            Some(b) => (Some(b.connection), Some(b.slot), b.queue, Some(b.token)),
            None => (None, None, None, None),
        };
        let registration = Registration {
            id,
            handler,
            connection,
            slot,
            queue,
            token,
        };

        let mut guard = self.snapshot.write();
        let snap = Arc::make_mut(&mut *guard);
        let key: Arc<str> = Arc::from(filter.as_str());

        match snap.index.get(&key) {
            Some(&i) => Arc::make_mut(&mut snap.entries[i])
                .registrations
                .push(registration),
            None => {
                snap.index.insert(key.clone(), snap.entries.len());
                snap.entries.push(Arc::new(FilterEntry {
                    filter,
                    registrations: vec![registration],
                }));
            }
        }
        snap.owners.insert(id, key.clone());

        debug!(filter = %key, registration = %id, "registered handler");
        id
    }

    /// Remove a registration. Returns `None` for an unknown id.
    pub fn unregister(&self, id: RegistrationId) -> Option<Unregistered> {
        let mut guard = self.snapshot.write();
        let snap = Arc::make_mut(&mut *guard);

        let key = snap.owners.remove(&id)?;
        let i = *snap.index.get(&key)?;

        let entry = Arc::make_mut(&mut snap.entries[i]);
        entry.registrations.retain(|r| r.id != id);
        debug!(filter = %key, registration = %id, "unregistered handler");

        if !entry.registrations.is_empty() {
            return Some(Unregistered::HandlersRemain);
        }

        snap.index.remove(&key);
        let removed = snap.entries.swap_remove(i);
        if let Some(moved) = snap.entries.get(i) {
            snap.index.insert(Arc::from(moved.filter.as_str()), i);
        }
        debug!(filter = %key, "filter has no handlers left");
        Some(Unregistered::FilterRemoved(removed.filter.clone()))
    }

    /// Handlers matching `topic`, across all connections.
    pub fn dispatch(&self, topic: &TopicName) -> Matches {
        self.matches(topic, None)
    }

    /// Handlers matching `topic` for a message that arrived on `connection`.
    ///
    /// Slot registrations bound to other connections are skipped.
    pub fn dispatch_from(&self, connection: ConnectionId, topic: &TopicName) -> Matches {
        self.matches(topic, Some(connection))
    }

    fn matches(&self, topic: &TopicName, from: Option<ConnectionId>) -> Matches {
        let snapshot = self.snapshot.read().clone();
        Matches {
            snapshot,
            topic: topic.clone(),
            from,
            next_entry: 0,
            pending: Vec::new().into_iter(),
        }
    }

    /// Number of distinct filters.
    pub fn len(&self) -> usize {
        self.snapshot.read().entries.len()
    }

    /// Whether no filter has a handler.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `filter` has at least one handler.
    pub fn contains_filter(&self, filter: &str) -> bool {
        self.snapshot.read().index.contains_key(filter)
    }

    /// Number of handlers registered for exactly `filter`.
    pub fn handler_count(&self, filter: &str) -> usize {
        let snap = self.snapshot.read();
        snap.index
            .get(filter)
            .map_or(0, |&i| snap.entries[i].registrations.len())
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = self.snapshot.read().clone();
        let mut lines: Vec<String> = snap
            .entries
            .iter()
            .map(|e| format!("{}: {} handlers", e.filter, e.registrations.len()))
            .collect();
        lines.sort();
        write!(f, "SubscriptionRegistry {{ {} }}", lines.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::handler::{handler_fn, Message};

    struct MockHandler;

    impl Handler for MockHandler {
        fn on_message(&self, _msg: &Message) -> Result<()> {
            Ok(())
        }
    }

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    fn topic(s: &str) -> TopicName {
        TopicName::new(s).unwrap()
    }

    fn slot(connection: u64, slot: usize, queue: Option<Arc<QueueRing>>) -> SlotBinding {
        SlotBinding {
            connection: ConnectionId::new(connection),
            slot,
            queue,
            token: CancellationToken::new(),
        }
    }

    #[test]
    fn test_exact_match() {
        let registry = SubscriptionRegistry::new();
        registry.register(filter("device/gear-001/state"), Arc::new(MockHandler));

        assert_eq!(registry.dispatch(&topic("device/gear-001/state")).count(), 1);
        assert_eq!(registry.dispatch(&topic("device/gear-002/state")).count(), 0);
        assert_eq!(registry.dispatch(&topic("device/gear-001")).count(), 0);
    }

    #[test]
    fn test_identical_filters_coalesce() {
        let registry = SubscriptionRegistry::new();
        let a = registry.register(filter("device/+/state"), Arc::new(MockHandler));
        let b = registry.register(filter("device/+/state"), Arc::new(MockHandler));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handler_count("device/+/state"), 2);

        let ids: Vec<_> = registry
            .dispatch(&topic("device/gear-001/state"))
            .map(|d| d.registration())
            .collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_overlapping_filters_stay_separate() {
        let registry = SubscriptionRegistry::new();
        registry.register(filter("a/+"), Arc::new(MockHandler));
        registry.register(filter("a/b"), Arc::new(MockHandler));
        registry.register(filter("a/#"), Arc::new(MockHandler));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.dispatch(&topic("a/b")).count(), 3);
        assert_eq!(registry.dispatch(&topic("a/c")).count(), 2);
        assert_eq!(registry.dispatch(&topic("a")).count(), 1);
    }

    #[test]
    fn test_dispatch_is_restartable() {
        let registry = SubscriptionRegistry::new();
        registry.register(filter("x/#"), Arc::new(MockHandler));

        let t = topic("x/y");
        let first = registry.dispatch(&t);
        let second = registry.dispatch(&t);
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 1);
    }

    #[test]
    fn test_snapshot_isolated_from_mutation() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(filter("x/#"), Arc::new(MockHandler));

        let pending = registry.dispatch(&topic("x/y"));
        registry.unregister(id);
        registry.register(filter("x/+"), Arc::new(MockHandler));

        // The iterator sees the registry as it was when dispatch was called.
        assert_eq!(pending.count(), 1);
        assert_eq!(registry.dispatch(&topic("x/y")).count(), 1);
        assert!(registry.contains_filter("x/+"));
        assert!(!registry.contains_filter("x/#"));
    }

    #[test]
    fn test_unregister() {
        let registry = SubscriptionRegistry::new();
        let a = registry.register(filter("a/b"), Arc::new(MockHandler));
        let b = registry.register(filter("a/b"), Arc::new(MockHandler));
        let c = registry.register(filter("c/d"), Arc::new(MockHandler));

        assert_eq!(registry.unregister(a), Some(Unregistered::HandlersRemain));
        assert_eq!(
            registry.unregister(b),
            Some(Unregistered::FilterRemoved(filter("a/b")))
        );
        assert_eq!(registry.unregister(b), None);

        // swap_remove moved "c/d"; it must still resolve.
        assert_eq!(registry.dispatch(&topic("c/d")).count(), 1);
        assert_eq!(
            registry.unregister(c),
            Some(Unregistered::FilterRemoved(filter("c/d")))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_from_connection() {
        let registry = SubscriptionRegistry::new();
        let f = filter("sensors/#");
        registry.register_slot(f.clone(), Arc::new(MockHandler), slot(1, 0, None));
        registry.register_slot(f.clone(), Arc::new(MockHandler), slot(2, 1, None));
        registry.register(f, Arc::new(MockHandler));

        let t = topic("sensors/t1");
        let on_one: Vec<_> = registry
            .dispatch_from(ConnectionId::new(1), &t)
            .map(|d| d.slot())
            .collect();
        assert_eq!(on_one, vec![Some(0), None]);

        assert_eq!(registry.dispatch_from(ConnectionId::new(3), &t).count(), 1);
        assert_eq!(registry.dispatch(&t).count(), 3);
    }

    #[test]
    fn test_queue_ring_round_robin() {
        let registry = SubscriptionRegistry::new();
        let f = filter("jobs/+");
        let ring = QueueRing::new();
        for i in 0..3 {
            registry.register_slot(f.clone(), Arc::new(MockHandler), slot(1, i, Some(ring.clone())));
        }

        let t = topic("jobs/build");
        let picked: Vec<_> = (0..6)
            .map(|_| {
                let slots: Vec<_> = registry.dispatch(&t).map(|d| d.slot()).collect();
                assert_eq!(slots.len(), 1);
                slots[0].unwrap()
            })
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_queue_ring_alongside_plain_handler() {
        let registry = SubscriptionRegistry::new();
        let f = filter("jobs/+");
        let ring = QueueRing::new();
        registry.register_slot(f.clone(), Arc::new(MockHandler), slot(1, 0, Some(ring.clone())));
        registry.register_slot(f.clone(), Arc::new(MockHandler), slot(2, 1, Some(ring)));
        registry.register(f, Arc::new(MockHandler));

        let count = registry
            .dispatch_from(ConnectionId::new(2), &topic("jobs/x"))
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_carried_ring_drops_copies_from_other_connections() {
        let registry = SubscriptionRegistry::new();
        let f = filter("jobs/#");
        let ring = QueueRing::carried_by(ConnectionId::new(1));
        for i in 0..3 {
            registry.register_slot(f.clone(), Arc::new(MockHandler), slot(i as u64 + 1, i, Some(ring.clone())));
        }

        // One publish, one copy per connection.
        let t = topic("jobs/x");
        let slots: Vec<_> = (1..=3)
            .flat_map(|c| registry.dispatch_from(ConnectionId::new(c), &t))
            .map(|d| d.slot())
            .collect();
        assert_eq!(slots, vec![Some(0)]);

        let next: Vec<_> = registry
            .dispatch_from(ConnectionId::new(1), &t)
            .map(|d| d.slot())
            .collect();
        assert_eq!(next, vec![Some(1)]);
    }

    #[test]
    fn test_cancelled_slot_is_not_live() {
        let registry = SubscriptionRegistry::new();
        let binding = slot(1, 0, None);
        let token = binding.token.clone();
        registry.register_slot(filter("a"), Arc::new(MockHandler), binding);

        let delivery = registry.dispatch(&topic("a")).next().unwrap();
        assert!(delivery.is_live());
        token.cancel();
        assert!(!delivery.is_live());
    }

    #[test]
    fn test_concurrent_register_and_dispatch() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = registry.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let c = counter.clone();
                        registry.register(
                            filter(&format!("w{}/{}", w, i)),
                            handler_fn(move |_| {
                                c.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }),
                        );
                    }
                })
            })
            .collect();

        let reader = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let _ = registry.dispatch(&topic("w0/1")).count();
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(registry.len(), 200);
        let msg = Message::new(topic("w3/49"), "x");
        for d in registry.dispatch(&msg.topic) {
            d.handler().on_message(&msg).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_debug() {
        let registry = SubscriptionRegistry::new();
        registry.register(filter("test/+/data"), Arc::new(MockHandler));
        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("test/+/data: 1 handlers"));
    }
}
