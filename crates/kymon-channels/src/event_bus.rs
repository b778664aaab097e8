use std::sync::Arc;

use async_trait::async_trait;
use kymon_types::DeliveryEnvelope;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::EventBusSinkConfig;
use crate::traits::{Sink, SinkState};

/// In-process dispatcher owned by the host application.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<DeliveryEnvelope>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DeliveryEnvelope>> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers received the envelope.
    pub fn publish(&self, envelope: Arc<DeliveryEnvelope>) -> usize {
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes `{"event": <event_name>, "data": <snapshot>}` on the host's [`EventBus`].
pub struct EventBusSink {
    bus: Option<EventBus>,
    event_name: String,
    state: SinkState,
}

impl EventBusSink {
    pub fn new(config: &EventBusSinkConfig, bus: Option<EventBus>) -> Self {
        let state = match (&bus, config.enabled) {
            (_, false) => SinkState::disabled(None),
            (None, true) => SinkState::disabled(Some("no event bus available".to_string())),
            (Some(_), true) => {
                info!(
                    "event-bus sink enabled, event name: {}",
                    config.event_name
                );
                SinkState::enabled()
            }
        };
        Self {
            bus,
            event_name: config.event_name.clone(),
            state,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }
}

#[async_trait]
impl Sink for EventBusSink {
    fn name(&self) -> &str {
        "event_bus"
    }

    fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    async fn send(&self, envelope: &DeliveryEnvelope) -> anyhow::Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let Some(bus) = &self.bus else {
            return Ok(());
        };
        let tagged = DeliveryEnvelope::new(self.event_name.clone(), envelope.data.clone());
        let delivered = bus.publish(Arc::new(tagged));
        if delivered == 0 {
            debug!("event-bus sink: no subscribers for {}", self.event_name);
        }
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }
}
