//! Per-sink configuration.
//!
//! One explicit struct per sink variant. Values are resolved (env > JSON file >
//! defaults) by the monitor's config loader; these types only carry the result.

use serde::{Deserialize, Serialize};

pub const DEFAULT_EVENT_NAME: &str = "ky_monitor.queue";
pub const DEFAULT_REDIS_CHANNEL: &str = "comfyui_monitor";
pub const DEFAULT_ROCKETMQ_NAMESRV: &str = "localhost:9876";
pub const DEFAULT_ROCKETMQ_TOPIC: &str = "comfyui_monitor_topic";
pub const DEFAULT_ROCKETMQ_GROUP: &str = "KY_MONITOR_PRODUCER_GROUP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusSinkConfig {
    pub enabled: bool,
    /// Event tag the envelope is published under.
    pub event_name: String,
}

impl Default for EventBusSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_name: DEFAULT_EVENT_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisSinkConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub channel_name: String,
}

impl Default for RedisSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            channel_name: DEFAULT_REDIS_CHANNEL.to_string(),
        }
    }
}

impl RedisSinkConfig {
    /// `redis://[:password@]host:port/db`, with the password percent-encoded.
    pub fn connection_url(&self) -> String {
        let auth = match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(":{}@", urlencoding::encode(password)),
            None => String::new(),
        };
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RocketMqSinkConfig {
    pub enabled: bool,
    /// Name server address list, `host:port[;host:port...]`.
    pub namesrv_addr: String,
    pub topic: String,
    pub group_id: String,
}

impl Default for RocketMqSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namesrv_addr: DEFAULT_ROCKETMQ_NAMESRV.to_string(),
            topic: DEFAULT_ROCKETMQ_TOPIC.to_string(),
            group_id: DEFAULT_ROCKETMQ_GROUP.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinksConfig {
    pub event_bus: EventBusSinkConfig,
    pub redis: RedisSinkConfig,
    pub rocketmq: RocketMqSinkConfig,
}

impl SinksConfig {
    /// Every sink switched off.
    pub fn disabled() -> Self {
        let mut config = Self::default();
        config.event_bus.enabled = false;
        config.redis.enabled = false;
        config.rocketmq.enabled = false;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_only_the_event_bus() {
        let config = SinksConfig::default();
        assert!(config.event_bus.enabled);
        assert!(!config.redis.enabled);
        assert!(!config.rocketmq.enabled);
        assert_eq!(config.event_bus.event_name, "ky_monitor.queue");
        assert_eq!(config.rocketmq.group_id, "KY_MONITOR_PRODUCER_GROUP");
    }

    #[test]
    fn connection_url_without_password() {
        let config = RedisSinkConfig::default();
        assert_eq!(config.connection_url(), "redis://localhost:6379/0");
    }

    #[test]
    fn connection_url_encodes_password() {
        let config = RedisSinkConfig {
            password: Some("p@ss/word".to_string()),
            db: 3,
            ..RedisSinkConfig::default()
        };
        assert_eq!(
            config.connection_url(),
            "redis://:p%40ss%2Fword@localhost:6379/3"
        );
    }

    #[test]
    fn empty_password_is_ignored() {
        let config = RedisSinkConfig {
            password: Some(String::new()),
            ..RedisSinkConfig::default()
        };
        assert_eq!(config.connection_url(), "redis://localhost:6379/0");
    }
}
