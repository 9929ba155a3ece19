//! Per-connection receive loop.

use crate::error::Error;
use crate::handler::Message;
use crate::link::{Ack, Link};
use crate::metrics::{Metrics, SubscriptionEvent};
use crate::packet::{ControlPacket, Publish};
use crate::pool::{Connection, ConnectionId};
use crate::registry::SubscriptionRegistry;
use crate::topic::TopicName;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reads one connection until it fails, routing PUBLISH frames to the
/// registry's handlers and acknowledgements to waiting requests.
///
/// Handler errors and panics are contained per handler; they are logged and
/// reported to metrics, and delivery continues.
///
/// Packets are handled in arrival order. An acknowledgement queued behind a
/// PUBLISH completes only after that message's handlers have returned.
pub struct DispatchLoop {
    link: Arc<Link>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<dyn Metrics>,
}

impl DispatchLoop {
    /// Loop over `conn` delivering to `registry`.
    pub fn new(
        conn: Arc<dyn Connection>,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self::with_link(Link::new(conn), registry, metrics)
    }

    pub(crate) fn with_link(
        link: Arc<Link>,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            link,
            registry,
            metrics,
        }
    }

    /// Connection this loop reads.
    pub fn connection(&self) -> ConnectionId {
        self.link.id()
    }

    /// Run the loop on a new tokio task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until `recv` fails. Pending requests on the connection fail
    /// with `ConnectionClosed` when the loop ends.
    pub async fn run(self) {
        let id = self.link.id();
        info!(connection = %id, "dispatch loop started");

        loop {
            match self.link.connection().recv().await {
                Ok(packet) => self.handle_packet(packet),
                Err(Error::ConnectionClosed) => {
                    info!(connection = %id, "connection closed");
                    break;
                }
                Err(e) => {
                    warn!(connection = %id, error = %e, "receive failed");
                    break;
                }
            }
        }

        self.link.close();
        info!(connection = %id, "dispatch loop stopped");
    }

    fn handle_packet(&self, packet: ControlPacket) {
        match packet {
            ControlPacket::Publish(publish) => {
                self.handle_publish(publish);
            }
            ControlPacket::SubAck(ack) => {
                self.link.complete(ack.pkid, Ack::SubAck(ack.code));
            }
            ControlPacket::UnsubAck(ack) => {
                self.link.complete(ack.pkid, Ack::UnsubAck(ack.code));
            }
            other => {
                debug!(connection = %self.link.id(), packet = other.name(), "ignoring packet");
            }
        }
    }

    /// Deliver one PUBLISH; returns how many handlers accepted it.
    fn handle_publish(&self, publish: Publish) -> usize {
        let id = self.link.id();
        let topic = match TopicName::new(&publish.topic) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(connection = %id, error = %e, "dropping message with malformed topic");
                self.metrics
                    .record_subscription_event(&SubscriptionEvent::MessageDropped {
                        connection: id,
                        reason: "invalid topic name",
                    });
                return 0;
            }
        };

        let msg = Message {
            topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            packet_id: publish.pkid,
            slot: None,
        };

        let mut matched = 0;
        let mut delivered = 0;
        for delivery in self.registry.dispatch_from(id, &msg.topic) {
            if !delivery.is_live() {
                continue;
            }
            matched += 1;

            let msg = msg.with_slot(delivery.slot());
            let handler = delivery.handler();
            match panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(&msg))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(connection = %id, topic = %msg.topic, slot = ?msg.slot, error = %e, "handler failed");
                    self.handler_failed(&msg);
                }
                Err(payload) => {
                    error!(
                        connection = %id,
                        topic = %msg.topic,
                        slot = ?msg.slot,
                        panic = panic_message(payload.as_ref()),
                        "handler panicked"
                    );
                    self.handler_failed(&msg);
                }
            }
        }

        if matched == 0 {
            debug!(connection = %id, topic = %msg.topic, "no handler for topic");
        }
        delivered
    }

    fn handler_failed(&self, msg: &Message) {
        self.metrics
            .record_subscription_event(&SubscriptionEvent::HandlerFailed {
                topic: msg.topic.to_string(),
                connection: self.link.id(),
            });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
