//! Notification sinks for kymon status snapshots.
//!
//! Every sink implements [`Sink`]. The set of known variants is closed
//! ([`SinkHandle`]); [`initialize_sinks`] builds all of them from config and
//! keeps the ones that came up enabled, and [`Broadcaster`] delivers each
//! envelope to that set with per-sink failure isolation.

pub mod broadcaster;
pub mod config;
pub mod event_bus;
pub mod pubsub;
pub mod registry;
pub mod remoting;
pub mod rocketmq;
pub mod traits;
pub mod wire;

pub use broadcaster::Broadcaster;
pub use config::*;
pub use event_bus::{EventBus, EventBusSink};
pub use pubsub::{PubSubSink, RedisTransport};
pub use registry::{initialize_sinks, SinkHandle, SinkKind, SinkSet};
pub use rocketmq::{MessageQueueSink, RocketMqProducer};
pub use traits::*;
