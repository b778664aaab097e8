//! Redis pub/sub sink.
//!
//! The connection is opened and verified with `PING` at construction; a sink
//! whose handshake fails stays disabled for the rest of the process. Each
//! envelope becomes one `PUBLISH` of the list-of-one wire text. Nothing is
//! retried.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use async_trait::async_trait;
use kymon_observability::{emit_event, ObservabilityEvent, ProcessKind};
use kymon_types::DeliveryEnvelope;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, error, info};

use crate::config::RedisSinkConfig;
use crate::traits::{PubSubTransport, Sink, SinkState};
use crate::wire::encode_envelope;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RedisTransport {
    connection: MultiplexedConnection,
}

impl RedisTransport {
    pub async fn connect(config: &RedisSinkConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.connection_url())
            .with_context(|| format!("invalid redis address {}:{}", config.host, config.port))?;
        let connection =
            tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
                .await
                .with_context(|| {
                    format!(
                        "timed out connecting to redis at {}:{}",
                        config.host, config.port
                    )
                })?
                .with_context(|| format!("connect to redis at {}:{}", config.host, config.port))?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn ping(&self) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let reply: String = redis::cmd("PING").query_async(&mut connection).await?;
        ensure!(reply == "PONG", "unexpected PING reply: {reply}");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let receivers: i64 = connection.publish(channel, payload).await?;
        debug!("redis publish to {channel} reached {receivers} subscribers");
        Ok(())
    }
}

pub struct PubSubSink {
    channel_name: String,
    transport: Option<Arc<dyn PubSubTransport>>,
    state: SinkState,
}

impl PubSubSink {
    /// Connects to Redis if the sink is enabled. Never fails: a sink that
    /// cannot connect comes back disabled with the reason in `last_error`.
    pub async fn connect(config: &RedisSinkConfig) -> Self {
        if !config.enabled {
            return Self::disabled(config, None);
        }
        match RedisTransport::connect(config).await {
            Ok(transport) => Self::with_transport(config, Arc::new(transport)).await,
            Err(err) => {
                Self::report_disabled(config, &err);
                Self::disabled(config, Some(format!("{err:#}")))
            }
        }
    }

    /// Builds the sink over an already-constructed transport, running the
    /// `PING` handshake.
    pub async fn with_transport(
        config: &RedisSinkConfig,
        transport: Arc<dyn PubSubTransport>,
    ) -> Self {
        if !config.enabled {
            return Self::disabled(config, None);
        }
        match transport.ping().await {
            Ok(()) => {
                info!(
                    "redis sink enabled, connected to {}:{}, channel: {}",
                    config.host, config.port, config.channel_name
                );
                Self {
                    channel_name: config.channel_name.clone(),
                    transport: Some(transport),
                    state: SinkState::enabled(),
                }
            }
            Err(err) => {
                Self::report_disabled(config, &err);
                Self::disabled(config, Some(format!("{err:#}")))
            }
        }
    }

    fn disabled(config: &RedisSinkConfig, reason: Option<String>) -> Self {
        Self {
            channel_name: config.channel_name.clone(),
            transport: None,
            state: SinkState::disabled(reason),
        }
    }

    fn report_disabled(config: &RedisSinkConfig, err: &anyhow::Error) {
        error!(
            "failed to initialize redis sink for {}:{}: {err:#}",
            config.host, config.port
        );
        let detail = format!("{err:#}");
        emit_event(
            tracing::Level::WARN,
            ProcessKind::Monitor,
            ObservabilityEvent {
                event: "sink.disabled",
                component: "channels.pubsub",
                sink: Some("redis"),
                status: Some("disabled"),
                error_code: Some("SINK_CONNECT_FAILED"),
                detail: Some(&detail),
                ..ObservabilityEvent::default()
            },
        );
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

#[async_trait]
impl Sink for PubSubSink {
    fn name(&self) -> &str {
        "redis"
    }

    fn is_enabled(&self) -> bool {
        self.state.is_enabled() && self.transport.is_some()
    }

    async fn send(&self, envelope: &DeliveryEnvelope) -> anyhow::Result<()> {
        let Some(transport) = self.transport.as_ref().filter(|_| self.state.is_enabled()) else {
            return Ok(());
        };
        let result = async {
            let payload = encode_envelope(envelope)?;
            transport
                .publish(&self.channel_name, &payload)
                .await
                .with_context(|| format!("publish to {}", self.channel_name))
        }
        .await;
        if let Err(err) = &result {
            self.state.record_error(err);
        }
        result
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kymon_types::StatusSnapshot;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        fail_ping: bool,
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PubSubTransport for RecordingTransport {
        async fn ping(&self) -> anyhow::Result<()> {
            if self.fail_ping {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }

        async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
            self.published
                .lock()
                .push((channel.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn enabled_config() -> RedisSinkConfig {
        RedisSinkConfig {
            enabled: true,
            ..RedisSinkConfig::default()
        }
    }

    #[tokio::test]
    async fn failed_ping_disables_sink() {
        let transport = Arc::new(RecordingTransport {
            fail_ping: true,
            ..RecordingTransport::default()
        });
        let sink = PubSubSink::with_transport(&enabled_config(), transport).await;
        assert!(!sink.is_enabled());
        assert!(sink
            .last_error()
            .unwrap_or_default()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn publishes_wire_text_to_configured_channel() {
        let transport = Arc::new(RecordingTransport::default());
        let sink = PubSubSink::with_transport(&enabled_config(), transport.clone()).await;
        assert!(sink.is_enabled());

        let envelope = DeliveryEnvelope::new("ky_monitor.queue", StatusSnapshot::default());
        sink.send(&envelope).await.unwrap();

        let published = transport.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "comfyui_monitor");
        assert_eq!(
            crate::wire::decode_envelope(&published[0].1).unwrap(),
            envelope
        );
    }

    #[tokio::test]
    async fn disabled_config_skips_handshake() {
        let transport = Arc::new(RecordingTransport {
            fail_ping: true,
            ..RecordingTransport::default()
        });
        let sink = PubSubSink::with_transport(&RedisSinkConfig::default(), transport).await;
        assert!(!sink.is_enabled());
        assert!(sink.last_error().is_none());
    }

    #[tokio::test]
    async fn unreachable_broker_disables_sink() {
        let config = RedisSinkConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1,
            ..RedisSinkConfig::default()
        };
        let sink = PubSubSink::connect(&config).await;
        assert!(!sink.is_enabled());
        assert!(sink.last_error().is_some());
    }
}
