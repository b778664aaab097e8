//! RocketMQ message-queue sink.
//!
//! The producer is bound to its name servers and group at construction but
//! touches the network only when started; the sink starts it lazily on the
//! first send. Routes are looked up per topic and cached until a send fails or
//! the producer shuts down.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use kymon_observability::{emit_event, ObservabilityEvent, ProcessKind};
use kymon_types::DeliveryEnvelope;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RocketMqSinkConfig;
use crate::remoting::{
    encode_properties, read_command, MessageQueueRef, RemotingCommand, RemotingError,
    TopicRouteData, AUTO_CREATE_TOPIC, REQUEST_GET_ROUTEINFO_BY_TOPIC, REQUEST_SEND_MESSAGE,
    RESPONSE_TOPIC_NOT_EXIST,
};
use crate::traits::{MessageProducer, OutboundMessage, SendReceipt, Sink, SinkState};
use crate::wire::encode_envelope;

pub const MESSAGE_KEYS: &str = "ky_monitor_update";
pub const MESSAGE_TAGS: &str = "comfyui_status";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TOPIC_QUEUE_NUMS: u32 = 4;

pub struct RocketMqProducer {
    namesrv_addrs: Vec<String>,
    group_id: String,
    running: AtomicBool,
    opaque: AtomicI32,
    next_queue: AtomicUsize,
    routes: Mutex<HashMap<String, Vec<MessageQueueRef>>>,
}

impl RocketMqProducer {
    /// Validates the name server list (`host:port[;host:port...]`) and group.
    pub fn new(namesrv_addr: &str, group_id: &str) -> anyhow::Result<Self> {
        let namesrv_addrs: Vec<String> = namesrv_addr
            .split(';')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        if namesrv_addrs.is_empty() {
            bail!("name server address is empty");
        }
        for addr in &namesrv_addrs {
            let Some((host, port)) = addr.rsplit_once(':') else {
                bail!("name server address {addr} is missing a port");
            };
            if host.is_empty() {
                bail!("name server address {addr} is missing a host");
            }
            port.parse::<u16>()
                .with_context(|| format!("invalid port in name server address {addr}"))?;
        }
        if group_id.trim().is_empty() {
            bail!("producer group id is empty");
        }
        Ok(Self {
            namesrv_addrs,
            group_id: group_id.to_string(),
            running: AtomicBool::new(false),
            opaque: AtomicI32::new(1),
            next_queue: AtomicUsize::new(0),
            routes: Mutex::new(HashMap::new()),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn next_opaque(&self) -> i32 {
        self.opaque.fetch_add(1, Ordering::Relaxed)
    }

    async fn invoke(
        &self,
        addr: &str,
        request: RemotingCommand,
    ) -> Result<RemotingCommand, RemotingError> {
        let opaque = request.header.opaque;
        let frame = request.encode()?;
        let exchange = async move {
            let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| RemotingError::Timeout(CONNECT_TIMEOUT))??;
            stream.write_all(&frame).await?;
            stream.flush().await?;
            loop {
                let reply = read_command(&mut stream).await?;
                if reply.is_response() && reply.header.opaque == opaque {
                    return Ok::<_, RemotingError>(reply);
                }
                debug!(
                    "rocketmq: ignoring frame code={} opaque={} from {addr}",
                    reply.header.code, reply.header.opaque
                );
            }
        };
        tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| RemotingError::Timeout(REQUEST_TIMEOUT))?
    }

    async fn fetch_route(&self, topic: &str) -> Result<TopicRouteData, RemotingError> {
        let mut last_err = RemotingError::NoRoute(topic.to_string());
        for addr in &self.namesrv_addrs {
            let fields = BTreeMap::from([("topic".to_string(), topic.to_string())]);
            let request =
                RemotingCommand::request(REQUEST_GET_ROUTEINFO_BY_TOPIC, self.next_opaque(), fields);
            match self.invoke(addr, request).await {
                Ok(reply) if reply.header.code == RESPONSE_TOPIC_NOT_EXIST => {
                    return Err(RemotingError::NoRoute(topic.to_string()));
                }
                Ok(reply) => return TopicRouteData::parse(&reply.into_success()?.body),
                Err(err) => {
                    warn!("rocketmq: name server {addr} unavailable: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Writable queues for `topic`; a topic unknown to the name server falls
    /// back to the auto-create topic's brokers.
    async fn resolve_queues(&self, topic: &str) -> Result<Vec<MessageQueueRef>, RemotingError> {
        if let Some(cached) = self.routes.lock().await.get(topic) {
            return Ok(cached.clone());
        }
        let route = match self.fetch_route(topic).await {
            Ok(route) => route,
            Err(RemotingError::NoRoute(_)) => {
                debug!("rocketmq: topic {topic} has no route, using {AUTO_CREATE_TOPIC}");
                self.fetch_route(AUTO_CREATE_TOPIC).await?
            }
            Err(err) => return Err(err),
        };
        let queues = route.writable_queues();
        if queues.is_empty() {
            return Err(RemotingError::NoRoute(topic.to_string()));
        }
        self.routes
            .lock()
            .await
            .insert(topic.to_string(), queues.clone());
        Ok(queues)
    }

    fn send_request(&self, message: &OutboundMessage, queue: &MessageQueueRef) -> RemotingCommand {
        let properties = encode_properties(&[
            ("KEYS", message.keys.as_str()),
            ("TAGS", message.tags.as_str()),
            ("WAIT", "true"),
        ]);
        let fields = BTreeMap::from([
            ("producerGroup".to_string(), self.group_id.clone()),
            ("topic".to_string(), message.topic.clone()),
            ("defaultTopic".to_string(), AUTO_CREATE_TOPIC.to_string()),
            (
                "defaultTopicQueueNums".to_string(),
                DEFAULT_TOPIC_QUEUE_NUMS.to_string(),
            ),
            ("queueId".to_string(), queue.queue_id.to_string()),
            ("sysFlag".to_string(), "0".to_string()),
            (
                "bornTimestamp".to_string(),
                chrono::Utc::now().timestamp_millis().to_string(),
            ),
            ("flag".to_string(), "0".to_string()),
            ("properties".to_string(), properties),
            ("reconsumeTimes".to_string(), "0".to_string()),
            ("unitMode".to_string(), "false".to_string()),
            ("batch".to_string(), "false".to_string()),
        ]);
        RemotingCommand::request(REQUEST_SEND_MESSAGE, self.next_opaque(), fields)
            .with_body(message.body.clone())
    }
}

#[async_trait]
impl MessageProducer for RocketMqProducer {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Succeeds once any name server accepts a TCP connection.
    async fn start(&self) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for addr in &self.namesrv_addrs {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(_)) => {
                    self.running.store(true, Ordering::SeqCst);
                    info!(
                        "rocketmq producer started, name server: {addr}, group: {}",
                        self.group_id
                    );
                    return Ok(());
                }
                Ok(Err(err)) => failures.push(format!("{addr}: {err}")),
                Err(_) => failures.push(format!("{addr}: connect timed out")),
            }
        }
        bail!("no name server reachable ({})", failures.join("; "))
    }

    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<SendReceipt> {
        let queues = self.resolve_queues(&message.topic).await?;
        let index = self.next_queue.fetch_add(1, Ordering::Relaxed) % queues.len();
        let queue = &queues[index];
        let request = self.send_request(message, queue);
        let reply = match self
            .invoke(&queue.broker_addr, request)
            .await
            .and_then(RemotingCommand::into_success)
        {
            Ok(reply) => reply,
            Err(err) => {
                self.routes.lock().await.remove(&message.topic);
                return Err(err).with_context(|| {
                    format!(
                        "send to {} queue {} on {}",
                        message.topic, queue.queue_id, queue.broker_name
                    )
                });
            }
        };
        Ok(SendReceipt {
            msg_id: reply.ext_field("msgId").map(str::to_string),
            queue_id: reply.ext_field("queueId").and_then(|v| v.parse().ok()),
            queue_offset: reply.ext_field("queueOffset").and_then(|v| v.parse().ok()),
        })
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("rocketmq producer shut down, group: {}", self.group_id);
        }
        self.routes.lock().await.clear();
        Ok(())
    }
}

pub struct MessageQueueSink {
    topic: String,
    producer: Option<Arc<dyn MessageProducer>>,
    state: SinkState,
}

impl MessageQueueSink {
    /// Builds the RocketMQ producer when enabled. Invalid producer settings
    /// leave the sink disabled instead of failing.
    pub fn new(config: &RocketMqSinkConfig) -> Self {
        if !config.enabled {
            return Self::disabled(config, None);
        }
        match RocketMqProducer::new(&config.namesrv_addr, &config.group_id) {
            Ok(producer) => {
                info!(
                    "rocketmq sink enabled, name server: {}, topic: {}",
                    config.namesrv_addr, config.topic
                );
                Self::with_producer(config, Arc::new(producer))
            }
            Err(err) => {
                error!("failed to initialize rocketmq producer: {err:#}");
                let detail = format!("{err:#}");
                emit_event(
                    tracing::Level::WARN,
                    ProcessKind::Monitor,
                    ObservabilityEvent {
                        event: "sink.disabled",
                        component: "channels.rocketmq",
                        sink: Some("rocketmq"),
                        status: Some("disabled"),
                        error_code: Some("SINK_PRODUCER_INVALID"),
                        detail: Some(&detail),
                        ..ObservabilityEvent::default()
                    },
                );
                Self::disabled(config, Some(detail))
            }
        }
    }

    pub fn with_producer(config: &RocketMqSinkConfig, producer: Arc<dyn MessageProducer>) -> Self {
        if !config.enabled {
            return Self::disabled(config, None);
        }
        Self {
            topic: config.topic.clone(),
            producer: Some(producer),
            state: SinkState::enabled(),
        }
    }

    fn disabled(config: &RocketMqSinkConfig, reason: Option<String>) -> Self {
        Self {
            topic: config.topic.clone(),
            producer: None,
            state: SinkState::disabled(reason),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn deliver(
        &self,
        producer: &dyn MessageProducer,
        envelope: &DeliveryEnvelope,
    ) -> anyhow::Result<()> {
        let message = OutboundMessage {
            topic: self.topic.clone(),
            keys: MESSAGE_KEYS.to_string(),
            tags: MESSAGE_TAGS.to_string(),
            body: encode_envelope(envelope)?.into_bytes(),
        };
        if !producer.is_running() {
            info!("starting rocketmq producer for first send");
            producer.start().await.context("start producer")?;
        }
        let receipt = producer.send(&message).await?;
        debug!(
            "rocketmq send ok, topic: {}, msg id: {:?}",
            self.topic, receipt.msg_id
        );
        Ok(())
    }
}

#[async_trait]
impl Sink for MessageQueueSink {
    fn name(&self) -> &str {
        "rocketmq"
    }

    fn is_enabled(&self) -> bool {
        self.state.is_enabled() && self.producer.is_some()
    }

    async fn send(&self, envelope: &DeliveryEnvelope) -> anyhow::Result<()> {
        let Some(producer) = self.producer.as_ref().filter(|_| self.state.is_enabled()) else {
            return Ok(());
        };
        let result = self.deliver(producer.as_ref(), envelope).await;
        if let Err(err) = &result {
            self.state.record_error(err);
        }
        result
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        match &self.producer {
            Some(producer) => producer.shutdown().await,
            None => Ok(()),
        }
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kymon_types::StatusSnapshot;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct FakeProducer {
        running: AtomicBool,
        fail_start: bool,
        starts: AtomicUsize,
        sent: SyncMutex<Vec<OutboundMessage>>,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl MessageProducer for FakeProducer {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                bail!("name server unreachable");
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, message: &OutboundMessage) -> anyhow::Result<SendReceipt> {
            self.sent.lock().push(message.clone());
            Ok(SendReceipt::default())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn enabled_config() -> RocketMqSinkConfig {
        RocketMqSinkConfig {
            enabled: true,
            ..RocketMqSinkConfig::default()
        }
    }

    fn envelope() -> DeliveryEnvelope {
        DeliveryEnvelope::new("ky_monitor.queue", StatusSnapshot::default())
    }

    #[test]
    fn producer_rejects_bad_addresses() {
        assert!(RocketMqProducer::new("", "group").is_err());
        assert!(RocketMqProducer::new("localhost", "group").is_err());
        assert!(RocketMqProducer::new("localhost:notaport", "group").is_err());
        assert!(RocketMqProducer::new("localhost:9876", " ").is_err());
        assert!(RocketMqProducer::new("a:9876; b:9877", "group").is_ok());
    }

    #[test]
    fn invalid_producer_settings_disable_sink() {
        let config = RocketMqSinkConfig {
            namesrv_addr: "nowhere".to_string(),
            ..enabled_config()
        };
        let sink = MessageQueueSink::new(&config);
        assert!(!sink.is_enabled());
        assert!(sink.last_error().is_some());
    }

    #[test]
    fn valid_settings_enable_sink_without_network() {
        let sink = MessageQueueSink::new(&enabled_config());
        assert!(sink.is_enabled());
    }

    #[tokio::test]
    async fn starts_producer_lazily_once() {
        let producer = Arc::new(FakeProducer::default());
        let sink = MessageQueueSink::with_producer(&enabled_config(), producer.clone());

        sink.send(&envelope()).await.unwrap();
        sink.send(&envelope()).await.unwrap();

        assert_eq!(producer.starts.load(Ordering::SeqCst), 1);
        let sent = producer.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].topic, "comfyui_monitor_topic");
        assert_eq!(sent[0].keys, MESSAGE_KEYS);
        assert_eq!(sent[0].tags, MESSAGE_TAGS);
        let body = String::from_utf8(sent[0].body.clone()).unwrap();
        assert_eq!(crate::wire::decode_envelope(&body).unwrap(), envelope());
    }

    #[tokio::test]
    async fn failed_start_skips_send_and_records_error() {
        let producer = Arc::new(FakeProducer {
            fail_start: true,
            ..FakeProducer::default()
        });
        let sink = MessageQueueSink::with_producer(&enabled_config(), producer.clone());

        assert!(sink.send(&envelope()).await.is_err());
        assert!(producer.sent.lock().is_empty());
        assert!(sink
            .last_error()
            .unwrap_or_default()
            .contains("name server unreachable"));
    }

    #[tokio::test]
    async fn shutdown_reaches_producer() {
        let producer = Arc::new(FakeProducer::default());
        let sink = MessageQueueSink::with_producer(&enabled_config(), producer.clone());
        sink.shutdown().await.unwrap();
        assert_eq!(producer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_fails_when_no_name_server_listens() {
        let producer = RocketMqProducer::new("127.0.0.1:1", "group").unwrap();
        assert!(producer.start().await.is_err());
        assert!(!producer.is_running());
    }
}
