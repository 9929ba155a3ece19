//! Message handlers.

use crate::error::Result;
use crate::topic::TopicName;
use crate::types::QoS;
use bytes::Bytes;
use std::sync::Arc;

/// MQTT message delivered to a handler.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: TopicName,
    /// Message payload.
    pub payload: Bytes,
    /// QoS level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Packet ID (for QoS > 0).
    pub packet_id: Option<u16>,
    /// Fan-out slot that received the message, if delivered through a subscription handle.
    pub slot: Option<usize>,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: TopicName, payload: impl Into<Bytes>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            packet_id: None,
            slot: None,
        }
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub(crate) fn with_slot(&self, slot: Option<usize>) -> Self {
        let mut msg = self.clone();
        msg.slot = slot;
        msg
    }
}

/// Handler trait for processing MQTT messages.
///
/// Handlers for the same message may run in any order and, across
/// connections, concurrently.
///
/// `on_message` runs on the receiving connection's dispatch task. Packets on
/// that connection, SUBACK and UNSUBACK included, wait until it returns, so a
/// handler slower than the distributor's `ack_timeout` makes subscribes on
/// the same connection time out. Hand long work to another task.
pub trait Handler: Send + Sync {
    /// Handle an incoming MQTT message.
    fn on_message(&self, msg: &Message) -> Result<()>;
}

/// Handler function type.
pub type HandlerFunc = dyn Fn(&Message) -> Result<()> + Send + Sync;

struct FnHandler {
    f: Box<HandlerFunc>,
}

impl Handler for FnHandler {
    fn on_message(&self, msg: &Message) -> Result<()> {
        (self.f)(msg)
    }
}

/// Wrap a closure as a handler.
///
/// ```
/// use giztoy_mqttsub::handler_fn;
///
/// let handler = handler_fn(|msg| {
///     println!("{}: {:?}", msg.topic, msg.payload);
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f: Box::new(f) })
}
