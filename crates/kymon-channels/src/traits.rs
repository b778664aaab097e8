use async_trait::async_trait;
use kymon_types::DeliveryEnvelope;
use parking_lot::Mutex;

/// A notification endpoint for status envelopes.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Deliver one envelope. Disabled sinks return `Ok(())` without sending.
    async fn send(&self, envelope: &DeliveryEnvelope) -> anyhow::Result<()>;

    /// Release long-lived external resources. Default: nothing to release.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The most recent construction or send failure, for diagnostics only.
    fn last_error(&self) -> Option<String>;
}

/// Publishes text messages to a named pub/sub topic.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub keys: String,
    pub tags: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub msg_id: Option<String>,
    pub queue_id: Option<u32>,
    pub queue_offset: Option<i64>,
}

/// A message-queue producer with an explicit lifecycle.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    fn is_running(&self) -> bool;
    async fn start(&self) -> anyhow::Result<()>;
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<SendReceipt>;
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Enablement plus last error, shared by every sink variant.
#[derive(Debug, Default)]
pub struct SinkState {
    enabled: bool,
    last_error: Mutex<Option<String>>,
}

impl SinkState {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            last_error: Mutex::new(None),
        }
    }

    pub fn disabled(reason: Option<String>) -> Self {
        Self {
            enabled: false,
            last_error: Mutex::new(reason),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_error(&self, err: &anyhow::Error) {
        *self.last_error.lock() = Some(format!("{err:#}"));
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}
