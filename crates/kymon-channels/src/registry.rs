use std::sync::Arc;

use tracing::info;

use crate::config::SinksConfig;
use crate::event_bus::{EventBus, EventBusSink};
use crate::pubsub::PubSubSink;
use crate::rocketmq::MessageQueueSink;
use crate::traits::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    EventBus,
    PubSub,
    MessageQueue,
}

impl SinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SinkKind::EventBus => "event_bus",
            SinkKind::PubSub => "redis",
            SinkKind::MessageQueue => "rocketmq",
        }
    }
}

/// One of the known sink variants.
#[derive(Clone)]
pub enum SinkHandle {
    EventBus(Arc<EventBusSink>),
    PubSub(Arc<PubSubSink>),
    MessageQueue(Arc<MessageQueueSink>),
}

impl SinkHandle {
    pub fn kind(&self) -> SinkKind {
        match self {
            SinkHandle::EventBus(_) => SinkKind::EventBus,
            SinkHandle::PubSub(_) => SinkKind::PubSub,
            SinkHandle::MessageQueue(_) => SinkKind::MessageQueue,
        }
    }

    pub fn sink(&self) -> &dyn Sink {
        match self {
            SinkHandle::EventBus(sink) => sink.as_ref(),
            SinkHandle::PubSub(sink) => sink.as_ref(),
            SinkHandle::MessageQueue(sink) => sink.as_ref(),
        }
    }
}

/// The enabled sinks, plus the message-queue sink kept separately so its
/// producer can be shut down when the monitor stops.
#[derive(Clone)]
pub struct SinkSet {
    active: Vec<SinkHandle>,
    message_queue: Arc<MessageQueueSink>,
}

impl SinkSet {
    /// Keeps only the sinks that came up enabled, in event-bus, pub/sub,
    /// message-queue order.
    pub fn assemble(
        event_bus: EventBusSink,
        pubsub: PubSubSink,
        message_queue: MessageQueueSink,
    ) -> Self {
        let message_queue = Arc::new(message_queue);
        let candidates = [
            SinkHandle::EventBus(Arc::new(event_bus)),
            SinkHandle::PubSub(Arc::new(pubsub)),
            SinkHandle::MessageQueue(message_queue.clone()),
        ];
        let active = candidates
            .into_iter()
            .filter(|handle| handle.sink().is_enabled())
            .collect();
        Self {
            active,
            message_queue,
        }
    }

    pub fn active(&self) -> &[SinkHandle] {
        &self.active
    }

    pub fn kinds(&self) -> Vec<SinkKind> {
        self.active.iter().map(SinkHandle::kind).collect()
    }

    pub fn message_queue(&self) -> &Arc<MessageQueueSink> {
        &self.message_queue
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Builds every sink variant from config and returns the enabled ones.
/// Sinks that fail to come up are logged and left out; this never fails.
pub async fn initialize_sinks(config: &SinksConfig, bus: Option<EventBus>) -> SinkSet {
    let event_bus = EventBusSink::new(&config.event_bus, bus);
    let pubsub = PubSubSink::connect(&config.redis).await;
    let message_queue = MessageQueueSink::new(&config.rocketmq);
    let set = SinkSet::assemble(event_bus, pubsub, message_queue);
    let names: Vec<&str> = set.kinds().into_iter().map(SinkKind::as_str).collect();
    info!(
        "initialized {} notification sink(s): [{}]",
        names.len(),
        names.join(", ")
    );
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RedisSinkConfig, RocketMqSinkConfig};

    #[tokio::test]
    async fn defaults_with_bus_yield_event_bus_only() {
        let set = initialize_sinks(&SinksConfig::default(), Some(EventBus::new())).await;
        assert_eq!(set.kinds(), vec![SinkKind::EventBus]);
    }

    #[tokio::test]
    async fn no_bus_and_defaults_yield_empty_set() {
        let set = initialize_sinks(&SinksConfig::default(), None).await;
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn unreachable_redis_is_left_out() {
        let config = SinksConfig {
            redis: RedisSinkConfig {
                enabled: true,
                host: "127.0.0.1".to_string(),
                port: 1,
                ..RedisSinkConfig::default()
            },
            rocketmq: RocketMqSinkConfig {
                enabled: true,
                ..RocketMqSinkConfig::default()
            },
            ..SinksConfig::default()
        };
        let set = initialize_sinks(&config, Some(EventBus::new())).await;
        assert_eq!(set.kinds(), vec![SinkKind::EventBus, SinkKind::MessageQueue]);
        assert!(set.message_queue().is_enabled());
    }

    #[tokio::test]
    async fn disabled_message_queue_is_still_reachable_for_shutdown() {
        let set = initialize_sinks(&SinksConfig::disabled(), None).await;
        assert!(set.is_empty());
        assert!(!set.message_queue().is_enabled());
        set.message_queue().shutdown().await.unwrap();
    }
}
