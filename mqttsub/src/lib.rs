//! MQTT topic subscription engine.
//!
//! This crate decides which locally registered handlers receive each inbound
//! PUBLISH, and spreads subscriptions over a pool of broker connections with
//! fan-out, shared groups and all-or-nothing rollback. A rumqttc-backed
//! connection is included; any transport implementing [`Connection`] works.
//!
//! # Example - Registry
//!
//! ```
//! use giztoy_mqttsub::{handler_fn, SubscriptionRegistry, TopicFilter, TopicName};
//!
//! let registry = SubscriptionRegistry::new();
//! registry.register(TopicFilter::parse("sport/#")?, handler_fn(|msg| {
//!     println!("Received: {:?}", msg.payload);
//!     Ok(())
//! }));
//!
//! let topic = TopicName::new("sport/tennis/player1")?;
//! assert_eq!(registry.dispatch(&topic).count(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Example - Pooled subscriptions
//!
//! ```no_run
//! use giztoy_mqttsub::{handler_fn, Dialer, PoolDistributor, SubscriptionRegistry, TopicConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = Dialer::new().dial_pool("mqtt://127.0.0.1:1883", 2).await?;
//!     let distributor = PoolDistributor::new(Arc::new(pool), Arc::new(SubscriptionRegistry::new()));
//!
//!     let config = TopicConfig::builder("response/#").qos(1).fanout_count(2).build()?;
//!     let handle = distributor
//!         .subscribe(config, handler_fn(|msg| {
//!             println!("Received: {:?}", msg.payload);
//!             Ok(())
//!         }))
//!         .await?;
//!
//!     distributor.unsubscribe(handle).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod dispatch;
mod distributor;
mod error;
mod handler;
mod link;
mod metrics;
mod packet;
mod pool;
mod registry;
mod rumqtt;
mod topic;
mod types;

pub use config::{validate, ProtocolValidator, RawTopicConfig, TopicConfig, TopicConfigBuilder, Validator};
pub use dispatch::DispatchLoop;
pub use distributor::{DistributorConfig, PoolDistributor, Slot, SubscriptionHandle};
pub use error::{
    Error, PoolError, ProtocolRejection, Result, SlotError, SlotFailure, UnsubscribeFailure,
    ValidationError, ValidationErrors,
};
pub use handler::{handler_fn, Handler, HandlerFunc, Message};
pub use metrics::{Metrics, NoopMetrics, SubscriptionEvent};
pub use packet::{ControlPacket, Publish, SubAck, SubAckCode, Subscribe, UnsubAck, Unsubscribe};
pub use pool::{Connection, ConnectionId, FixedPool, Pool};
pub use registry::{Delivery, Matches, RegistrationId, SubscriptionRegistry, Unregistered};
pub use rumqtt::{Dialer, RumqttConnection};
pub use topic::{Level, TopicFilter, TopicName, MAX_TOPIC_LEN};
pub use types::{QoS, RetainHandling};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::{
        handler_fn, Connection, Dialer, Error, Handler, Message, Pool, PoolDistributor, PoolError,
        QoS, Result, SubscriptionHandle, SubscriptionRegistry, TopicConfig, TopicFilter, TopicName,
    };
}
