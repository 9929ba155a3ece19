//! Control packets exchanged with a [`Connection`](crate::Connection).
//!
//! This is the subset of MQTT the subscription engine speaks. Encoding to
//! bytes is the connection's business.

use crate::types::{QoS, RetainHandling};
use bytes::Bytes;

/// SUBSCRIBE carrying a single filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    /// Physical filter, including any `$share/<group>/` prefix.
    pub filter: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

/// Outcome carried by a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckCode {
    /// Accepted with the granted maximum QoS.
    Granted(QoS),
    /// Refused with an MQTT reason code (>= 0x80).
    Rejected(u8),
}

/// SUBACK for a single-filter SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub code: SubAckCode,
}

/// UNSUBSCRIBE carrying a single filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filter: String,
}

/// UNSUBACK; `code` is 0 on success (MQTT 3.1.1 always reports success).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
    pub code: u8,
}

impl UnsubAck {
    /// Reason codes below 0x80 are successful.
    pub fn is_success(&self) -> bool {
        self.code < 0x80
    }
}

/// Inbound PUBLISH. The topic is raw and not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub pkid: Option<u16>,
}

/// MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    Publish(Publish),
    /// Any other packet, by name. Ignored by the dispatch loop.
    Other(&'static str),
}

impl ControlPacket {
    /// Packet type name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ControlPacket::Subscribe(_) => "SUBSCRIBE",
            ControlPacket::SubAck(_) => "SUBACK",
            ControlPacket::Unsubscribe(_) => "UNSUBSCRIBE",
            ControlPacket::UnsubAck(_) => "UNSUBACK",
            ControlPacket::Publish(_) => "PUBLISH",
            ControlPacket::Other(name) => name,
        }
    }
}
