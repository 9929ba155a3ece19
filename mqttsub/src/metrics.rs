//! Subscription metrics hook.
//!
//! The engine reports what happens to subscriptions and messages through a
//! [`Metrics`] sink. Recording is fire-and-forget: implementations must not
//! block and cannot fail the operation being reported.

use crate::pool::ConnectionId;

/// Something worth counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Every slot of a subscription was acknowledged.
    Subscribed { filter: String, slots: usize },
    /// A subscribe call failed and was rolled back.
    SubscribeFailed { filter: String, failed_slots: usize },
    /// Every slot of a handle was torn down.
    Unsubscribed { filter: String, slots: usize },
    /// One slot could not be torn down.
    SlotTeardownFailed {
        filter: String,
        slot: usize,
        connection: ConnectionId,
    },
    /// A handler returned an error or panicked.
    HandlerFailed { topic: String, connection: ConnectionId },
    /// An inbound frame was discarded before dispatch.
    MessageDropped {
        connection: ConnectionId,
        reason: &'static str,
    },
}

/// Sink for [`SubscriptionEvent`]s.
pub trait Metrics: Send + Sync {
    fn record_subscription_event(&self, event: &SubscriptionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record_subscription_event(&self, _event: &SubscriptionEvent) {}
}
