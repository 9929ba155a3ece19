//! Pooled fan-out subscriptions.
//!
//! [`PoolDistributor`] turns one [`TopicConfig`] into `fanout_count` broker
//! subscriptions spread over pooled connections, and registers the caller's
//! handler once per fan-out slot.
//!
//! # Fan-out
//!
//! The distributor checks out `min(fanout_count, capacity)` distinct
//! connections. Slot `i` is carried by connection `i % distinct`, so a
//! fan-out larger than the pool still produces one slot per index. SUBSCRIBE
//! is sent once per distinct connection.
//!
//! # Failure
//!
//! `subscribe` is all or nothing. If any connection fails to acknowledge,
//! connections that did acknowledge, or never answered in time, get an
//! UNSUBSCRIBE (unless another live handle still needs the filter there) and
//! nothing is registered.
//!
//! `unsubscribe` is best effort. Connections that acknowledge the UNSUBSCRIBE
//! are torn down; the rest stay in the handle returned inside
//! [`UnsubscribeFailure`], which can be retried.
//!
//! SUBSCRIBE and UNSUBSCRIBE for the same physical filter on the same
//! connection are serialized, so concurrent handles sharing a filter never
//! leave the broker unsubscribed while one of them is live.
//!
//! # Queue mode
//!
//! With a shared group the broker hands each message to one connection and
//! the slots take turns. Without one, every connection receives a copy; only
//! the copy on the first connection is delivered, still rotating over slots.
//!
//! # Example
//!
//! ```no_run
//! use giztoy_mqttsub::{handler_fn, Dialer, PoolDistributor, SubscriptionRegistry, TopicConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = Dialer::new().dial_pool("mqtt://127.0.0.1:1883", 3).await?;
//!     let registry = Arc::new(SubscriptionRegistry::new());
//!     let distributor = PoolDistributor::new(Arc::new(pool), registry);
//!
//!     let config = TopicConfig::builder("device/+/state")
//!         .qos(1)
//!         .fanout_count(3)
//!         .shared_group("workers")
//!         .build()?;
//!
//!     let handle = distributor
//!         .subscribe(config, handler_fn(|msg| {
//!             println!("slot {:?}: {}", msg.slot, msg.topic);
//!             Ok(())
//!         }))
//!         .await?;
//!
//!     distributor.unsubscribe(handle).await?;
//!     Ok(())
//! }
//! ```

use crate::config::TopicConfig;
use crate::dispatch::DispatchLoop;
use crate::error::{PoolError, SlotError, SlotFailure, UnsubscribeFailure};
use crate::handler::Handler;
use crate::link::Link;
use crate::metrics::{Metrics, NoopMetrics, SubscriptionEvent};
use crate::pool::{Connection, ConnectionId, Pool};
use crate::registry::{QueueRing, RegistrationId, SlotBinding, SubscriptionRegistry};
use crate::types::QoS;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Distributor timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributorConfig {
    /// How long to wait for each SUBACK or UNSUBACK.
    pub ack_timeout: Duration,
    /// How long `subscribe` may wait for all of its connections.
    pub checkout_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            checkout_timeout: Duration::from_secs(5),
        }
    }
}

impl DistributorConfig {
    /// Default timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the SUBACK/UNSUBACK timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the connection checkout timeout.
    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }
}

/// One logical fan-out instance of a subscription.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    connection: ConnectionId,
    granted_qos: QoS,
    registration: RegistrationId,
    token: CancellationToken,
    link: Arc<Link>,
}

impl Slot {
    /// Fan-out index, `0..fanout_count`.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Connection carrying this slot.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// QoS granted by the broker.
    pub fn granted_qos(&self) -> QoS {
        self.granted_qos
    }

    /// Registry entry delivering this slot's messages.
    pub fn registration(&self) -> RegistrationId {
        self.registration
    }
}

/// A live subscription. Pass it to [`PoolDistributor::unsubscribe`] to tear
/// it down; dropping it leaves the subscription in place.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    config: TopicConfig,
    physical_filter: String,
    slots: Vec<Slot>,
    token: CancellationToken,
}

impl SubscriptionHandle {
    /// Distributor-unique handle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Validated config this handle was created from.
    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    /// Filter sent to the broker.
    pub fn physical_filter(&self) -> &str {
        &self.physical_filter
    }

    /// Slots in fan-out order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Cancelled once every slot has been torn down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Distinct connections carrying this subscription.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.slots.iter().map(|s| s.connection).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

type ClaimKey = (ConnectionId, String);

// Handles holding a physical filter on one connection. The async lock is held
// across SUBSCRIBE/UNSUBSCRIBE so the count always matches the broker.
type Claim = Arc<AsyncMutex<usize>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    // Handle teardown; a failed UNSUBSCRIBE keeps the claim.
    Teardown,
    // Rollback of an acknowledged SUBSCRIBE.
    Acked,
    // Rollback of a SUBSCRIBE whose SUBACK never came; it took no claim.
    Unacked,
}

/// Spreads subscriptions over a connection pool.
pub struct PoolDistributor {
    pool: Arc<dyn Pool>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<dyn Metrics>,
    config: DistributorConfig,
    links: Mutex<HashMap<ConnectionId, Arc<Link>>>,
    ledger: Mutex<HashMap<ClaimKey, Claim>>,
    // One multi-connection checkout at a time, so two subscribes never each
    // hold part of the pool while waiting for the rest.
    checkout_gate: AsyncMutex<()>,
    next_handle: AtomicU64,
}

impl PoolDistributor {
    /// Create a distributor with default timeouts and no metrics.
    pub fn new(pool: Arc<dyn Pool>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            pool,
            registry,
            metrics: Arc::new(NoopMetrics),
            config: DistributorConfig::default(),
            links: Mutex::new(HashMap::new()),
            ledger: Mutex::new(HashMap::new()),
            checkout_gate: AsyncMutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Replace the default timeouts.
    pub fn with_config(mut self, config: DistributorConfig) -> Self {
        self.config = config;
        self
    }

    /// Report subscription events to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registry holding the slot registrations.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Timeouts in use.
    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Start the dispatch loop for `conn` unless one is already running.
    ///
    /// `subscribe` attaches every connection it uses; call this directly to
    /// start receiving on a connection before subscribing through it.
    pub fn attach(&self, conn: Arc<dyn Connection>) {
        self.link_for(conn);
    }

    fn link_for(&self, conn: Arc<dyn Connection>) -> Arc<Link> {
        let id = conn.id();
        let mut links = self.links.lock();
        if let Some(link) = links.get(&id) {
            if !link.is_closed() {
                return link.clone();
            }
            debug!(connection = %id, "replacing closed link");
        }

        let link = Link::new(conn);
        links.insert(id, link.clone());
        DispatchLoop::with_link(link.clone(), self.registry.clone(), self.metrics.clone()).spawn();
        link
    }

    /// Subscribe `handler` according to `config`.
    pub async fn subscribe(
        &self,
        config: TopicConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<SubscriptionHandle, PoolError> {
        let physical = config.physical_filter();
        let fanout = config.fanout_count();
        let distinct = fanout.min(self.pool.capacity().max(1));

        let conns = self.checkout(distinct).await?;
        let links: Vec<Arc<Link>> = conns.iter().map(|c| self.link_for(c.clone())).collect();

        let timeout = self.config.ack_timeout;
        let acks = join_all(
            links
                .iter()
                .map(|link| self.claim_filter(link, &config, &physical, timeout)),
        )
        .await;

        let mut failures = Vec::new();
        for (i, ack) in acks.iter().enumerate() {
            if let Err(cause) = ack {
                failures.extend((i..fanout).step_by(distinct).map(|slot| SlotError {
                    slot,
                    connection: links[i].id(),
                    cause: cause.clone(),
                }));
            }
        }

        if !failures.is_empty() {
            failures.sort_by_key(|f| f.slot);
            let undo: Vec<(&Arc<Link>, Release)> = links
                .iter()
                .zip(&acks)
                .filter_map(|(link, ack)| match ack {
                    Ok(_) => Some((link, Release::Acked)),
                    Err(SlotFailure::Timeout(_)) => Some((link, Release::Unacked)),
                    Err(_) => None,
                })
                .collect();
            self.rollback(&undo, &physical).await;
            self.release(conns);

            warn!(filter = %physical, failed = failures.len(), slots = fanout, "subscribe failed, rolled back");
            self.metrics
                .record_subscription_event(&SubscriptionEvent::SubscribeFailed {
                    filter: physical.clone(),
                    failed_slots: failures.len(),
                });
            return Err(PoolError::PartialSubscribeFailure {
                filter: physical,
                slots: fanout,
                failures,
            });
        }

        let granted: Vec<QoS> = acks.into_iter().flatten().collect();
        let token = CancellationToken::new();
        let queue = config.queue_mode().then(|| match config.shared_group() {
            Some(_) => QueueRing::new(),
            None => QueueRing::carried_by(links[0].id()),
        });

        let slots = (0..fanout)
            .map(|index| {
                let link = links[index % distinct].clone();
                let slot_token = token.child_token();
                let registration = self.registry.register_slot(
                    config.filter().clone(),
                    handler.clone(),
                    SlotBinding {
                        connection: link.id(),
                        slot: index,
                        queue: queue.clone(),
                        token: slot_token.clone(),
                    },
                );
                Slot {
                    index,
                    connection: link.id(),
                    granted_qos: granted[index % distinct],
                    registration,
                    token: slot_token,
                    link,
                }
            })
            .collect();

        self.release(conns);

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        info!(filter = %physical, slots = fanout, connections = distinct, handle = id, "subscribed");
        self.metrics
            .record_subscription_event(&SubscriptionEvent::Subscribed {
                filter: physical.clone(),
                slots: fanout,
            });

        Ok(SubscriptionHandle {
            id,
            config,
            physical_filter: physical,
            slots,
            token,
        })
    }

    /// Tear down every slot of `handle`.
    ///
    /// On partial failure the returned [`UnsubscribeFailure`] holds the
    /// handle, reduced to the slots that are still subscribed.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), UnsubscribeFailure> {
        let SubscriptionHandle {
            id,
            config,
            physical_filter,
            slots,
            token,
        } = handle;
        let total = slots.len();

        let mut groups: Vec<(Arc<Link>, Vec<Slot>)> = Vec::new();
        for slot in slots {
            match groups.iter_mut().find(|(link, _)| link.id() == slot.connection) {
                Some((_, group)) => group.push(slot),
                None => groups.push((slot.link.clone(), vec![slot])),
            }
        }

        let timeout = self.config.ack_timeout;
        let outcomes = join_all(
            groups
                .iter()
                .map(|(link, _)| self.release_filter(link, &physical_filter, Release::Teardown, timeout)),
        )
        .await;

        let mut kept = Vec::new();
        let mut errors = Vec::new();
        for ((link, group), outcome) in groups.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    for slot in group {
                        slot.token.cancel();
                        self.registry.unregister(slot.registration);
                    }
                }
                Err(cause) => {
                    for slot in group {
                        warn!(filter = %physical_filter, slot = slot.index, connection = %link.id(), error = %cause, "slot teardown failed");
                        self.metrics
                            .record_subscription_event(&SubscriptionEvent::SlotTeardownFailed {
                                filter: physical_filter.clone(),
                                slot: slot.index,
                                connection: link.id(),
                            });
                        errors.push(SlotError {
                            slot: slot.index,
                            connection: link.id(),
                            cause: cause.clone(),
                        });
                        kept.push(slot);
                    }
                }
            }
        }

        if errors.is_empty() {
            token.cancel();
            info!(filter = %physical_filter, slots = total, handle = id, "unsubscribed");
            self.metrics
                .record_subscription_event(&SubscriptionEvent::Unsubscribed {
                    filter: physical_filter,
                    slots: total,
                });
            return Ok(());
        }

        kept.sort_by_key(|s| s.index);
        errors.sort_by_key(|e| e.slot);
        Err(UnsubscribeFailure {
            handle: SubscriptionHandle {
                id,
                config,
                physical_filter,
                slots: kept,
                token,
            },
            errors,
        })
    }

    async fn checkout(&self, n: usize) -> Result<Vec<Arc<dyn Connection>>, PoolError> {
        let timeout = self.config.checkout_timeout;
        let deadline = Instant::now() + timeout;
        let _gate = tokio::time::timeout_at(deadline, self.checkout_gate.lock())
            .await
            .map_err(|_| {
                warn!(wanted = n, "timed out waiting for another checkout");
                PoolError::Exhausted { timeout }
            })?;
        let mut conns = Vec::with_capacity(n);

        while conns.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.pool.checkout(remaining).await {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    warn!(wanted = n, got = conns.len(), error = %e, "connection checkout failed");
                    self.release(conns);
                    return Err(match e {
                        PoolError::Exhausted { .. } => PoolError::Exhausted { timeout },
                        e => e,
                    });
                }
            }
        }
        Ok(conns)
    }

    fn release(&self, conns: Vec<Arc<dyn Connection>>) {
        for conn in conns {
            self.pool.release(conn);
        }
    }

    async fn rollback(&self, undo: &[(&Arc<Link>, Release)], filter: &str) {
        let timeout = self.config.ack_timeout;
        let results = join_all(undo.iter().map(|&(link, release)| async move {
            (link.id(), self.release_filter(link, filter, release, timeout).await)
        }))
        .await;

        for (connection, result) in results {
            if let Err(e) = result {
                warn!(connection = %connection, filter, error = %e, "rollback unsubscribe failed");
            }
        }
    }

    fn claim(&self, key: &ClaimKey) -> Claim {
        self.ledger.lock().entry(key.clone()).or_default().clone()
    }

    // Drop the ledger entry once it is unclaimed and nobody else is waiting on it.
    fn forget_claim(&self, key: &ClaimKey, claim: &Claim, held: usize) {
        if held > 0 {
            return;
        }
        let mut ledger = self.ledger.lock();
        if ledger.get(key).is_some_and(|c| Arc::ptr_eq(c, claim) && Arc::strong_count(c) == 2) {
            ledger.remove(key);
        }
    }

    // SUBSCRIBE on `link` and take a claim on the filter once acknowledged.
    async fn claim_filter(
        &self,
        link: &Link,
        config: &TopicConfig,
        filter: &str,
        timeout: Duration,
    ) -> Result<QoS, SlotFailure> {
        let key = (link.id(), filter.to_string());
        let claim = self.claim(&key);
        let mut held = claim.lock().await;

        let result = link.subscribe(config, filter, timeout).await;
        if result.is_ok() {
            *held += 1;
        }
        self.forget_claim(&key, &claim, *held);
        result
    }

    // Drop one claim on (link, filter); UNSUBSCRIBE once nobody holds it.
    async fn release_filter(
        &self,
        link: &Link,
        filter: &str,
        release: Release,
        timeout: Duration,
    ) -> Result<(), SlotFailure> {
        let key = (link.id(), filter.to_string());
        let claim = self.claim(&key);
        let mut held = claim.lock().await;

        if release != Release::Unacked {
            *held = held.saturating_sub(1);
        }
        if *held > 0 {
            debug!(connection = %link.id(), filter, "filter still held by another handle");
            return Ok(());
        }

        let result = link.unsubscribe(filter, timeout).await;
        if result.is_err() && release == Release::Teardown {
            *held += 1;
        }
        self.forget_claim(&key, &claim, *held);
        result
    }
}

impl std::fmt::Debug for PoolDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDistributor")
            .field("capacity", &self.pool.capacity())
            .field("links", &self.links.lock().len())
            .field("config", &self.config)
            .finish()
    }
}
