//! Error types for the subscription engine.

use crate::distributor::SubscriptionHandle;
use crate::pool::ConnectionId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A single violation found while validating a topic filter or config.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The filter string is empty.
    #[error("mqtt: empty topic filter")]
    EmptyFilter,

    /// The filter is longer than the protocol allows.
    #[error("mqtt: topic filter is {len} bytes, maximum is 65535")]
    FilterTooLong { len: usize },

    /// `#` appears before the last level.
    #[error("mqtt: '#' must be the last level: {0}")]
    MultiWildcardNotLast(String),

    /// `#` shares a level with other characters.
    #[error("mqtt: '#' must occupy a whole level: {0}")]
    MultiWildcardNotAlone(String),

    /// `+` shares a level with other characters.
    #[error("mqtt: '+' must occupy a whole level: {0}")]
    SingleWildcardNotAlone(String),

    /// QoS is not 0, 1 or 2.
    #[error("mqtt: qos {0} out of range 0..=2")]
    QosOutOfRange(u8),

    /// Retain handling is not 0, 1 or 2.
    #[error("mqtt: retain handling {0} out of range 0..=2")]
    RetainHandlingOutOfRange(u8),

    /// Fan-out count is zero.
    #[error("mqtt: fanout count must be at least 1")]
    ZeroFanout,

    /// Shared group name is present but empty.
    #[error("mqtt: empty shared group name")]
    EmptySharedGroup,

    /// Shared group name contains a level separator or wildcard.
    #[error("mqtt: shared group name must not contain '/', '+' or '#': {0}")]
    InvalidSharedGroup(String),
}

/// Every violation found in one validation pass, in check order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub(crate) fn new(errors: Vec<ValidationError>) -> Self {
        Self(errors)
    }

    /// The individual violations.
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    /// Number of violations.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for errors produced by validation.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume into the list of violations.
    pub fn into_inner(self) -> Vec<ValidationError> {
        self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mqtt: invalid topic config")?;
        for (i, err) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, err.to_string().trim_start_matches("mqtt: "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationError> for ValidationErrors {
    fn from(err: ValidationError) -> Self {
        Self(vec![err])
    }
}

/// The broker explicitly refused a subscription request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("mqtt: broker rejected {filter} (reason code 0x{code:02x})")]
pub struct ProtocolRejection {
    /// Physical filter sent to the broker.
    pub filter: String,
    /// Reason code carried by the SUBACK or UNSUBACK.
    pub code: u8,
}

/// Why a single fan-out slot failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotFailure {
    /// The broker refused the request.
    #[error(transparent)]
    Rejected(#[from] ProtocolRejection),

    /// No acknowledgement arrived in time.
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    /// The connection closed while the request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The control packet could not be sent.
    #[error("send failed: {0}")]
    Send(String),
}

/// Failure of one logical fan-out slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("mqtt: slot {slot} on {connection}: {cause}")]
pub struct SlotError {
    /// Fan-out index of the slot.
    pub slot: usize,
    /// Connection carrying the slot.
    pub connection: ConnectionId,
    /// What went wrong.
    pub cause: SlotFailure,
}

/// Pool and distribution failures. The caller may retry `subscribe`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No connection could be checked out in time.
    #[error("mqtt: pool exhausted, no connection within {timeout:?}")]
    Exhausted { timeout: Duration },

    /// At least one slot failed; every slot of the call was rolled back.
    #[error("mqtt: subscribe to {filter} failed on {} of {slots} slots", .failures.len())]
    PartialSubscribeFailure {
        /// Physical filter sent to the broker.
        filter: String,
        /// Requested fan-out count.
        slots: usize,
        /// One entry per failed slot.
        failures: Vec<SlotError>,
    },

    /// The pool is shut down.
    #[error("mqtt: pool closed")]
    Closed,
}

/// Returned by `unsubscribe` when some slots could not be torn down.
///
/// The handle is still valid and holds only the failed slots.
#[derive(Debug)]
pub struct UnsubscribeFailure {
    /// The surviving handle.
    pub handle: SubscriptionHandle,
    /// One entry per failed slot.
    pub errors: Vec<SlotError>,
}

impl fmt::Display for UnsubscribeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mqtt: unsubscribe from {} failed on {} slots",
            self.handle.physical_filter(),
            self.errors.len()
        )
    }
}

impl std::error::Error for UnsubscribeFailure {}

/// Error type for connection, protocol and handler operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A published topic name is malformed.
    #[error("mqtt: invalid topic name {topic:?}: {reason}")]
    InvalidTopicName { topic: String, reason: &'static str },

    /// The connection is closed.
    #[error("mqtt: connection closed")]
    ConnectionClosed,

    /// Connection error.
    #[error("mqtt: connection error: {0}")]
    Connection(String),

    /// Unexpected or unsupported control packet.
    #[error("mqtt: protocol error: {0}")]
    Protocol(String),

    /// Handler error.
    #[error("mqtt: handler error: {0}")]
    Handler(String),

    /// Invalid topic config.
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    /// Pool or distribution failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Client error from rumqttc.
    #[error("mqtt client error: {0}")]
    ClientError(#[from] rumqttc::ClientError),

    /// Connection error from rumqttc.
    #[error("mqtt connection error: {0}")]
    ConnectionError(#[from] rumqttc::ConnectionError),
}

/// Result type for MQTT operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display() {
        let errs = ValidationErrors::new(vec![
            ValidationError::QosOutOfRange(3),
            ValidationError::ZeroFanout,
        ]);
        assert_eq!(
            errs.to_string(),
            "mqtt: invalid topic config: qos 3 out of range 0..=2; fanout count must be at least 1"
        );
    }

    #[test]
    fn test_partial_failure_display() {
        let err = PoolError::PartialSubscribeFailure {
            filter: "a/b".to_string(),
            slots: 3,
            failures: vec![SlotError {
                slot: 1,
                connection: ConnectionId::new(7),
                cause: SlotFailure::Rejected(ProtocolRejection {
                    filter: "a/b".to_string(),
                    code: 0x80,
                }),
            }],
        };
        assert_eq!(err.to_string(), "mqtt: subscribe to a/b failed on 1 of 3 slots");
    }

    #[test]
    fn test_slot_error_display() {
        let err = SlotError {
            slot: 2,
            connection: ConnectionId::new(1),
            cause: SlotFailure::Timeout(Duration::from_millis(50)),
        };
        assert!(err.to_string().contains("slot 2 on conn-1"));
    }
}
