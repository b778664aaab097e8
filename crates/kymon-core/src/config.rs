//! Monitor configuration.
//!
//! Three layers, highest priority first: `KY_MONITOR_*` environment variables,
//! an optional JSON file, built-in defaults. The file and env layers are merged
//! as JSON values and then read into typed settings; a value that cannot be
//! used is logged and replaced by its default.
//!
//! The older section names `prompt_server_channel`, `redis_channel` and
//! `rocketmq_channel` (and the `KY_MONITOR_PROMPT_SERVER_*` variables) are
//! still read. Within one layer the current name wins over the older one.

use std::path::Path;
use std::time::Duration;

use kymon_channels::{EventBusSinkConfig, RedisSinkConfig, RocketMqSinkConfig, SinksConfig};
use kymon_observability::redact_text;
use serde_json::{json, Map, Value};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::ConfigError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HISTORY_WINDOW: usize = 5;

/// Environment variable to JSON path.
const ENV_BINDINGS: &[(&str, &str)] = &[
    ("KY_MONITOR_FREQUENCY_SECONDS", "frequency_seconds"),
    ("KY_MONITOR_HISTORY_WINDOW", "history_window"),
    ("KY_MONITOR_EVENT_BUS_ENABLED", "event_bus.enabled"),
    ("KY_MONITOR_EVENT_BUS_EVENT_NAME", "event_bus.event_name"),
    ("KY_MONITOR_REDIS_ENABLED", "redis.enabled"),
    ("KY_MONITOR_REDIS_HOST", "redis.host"),
    ("KY_MONITOR_REDIS_PORT", "redis.port"),
    ("KY_MONITOR_REDIS_PASSWORD", "redis.password"),
    ("KY_MONITOR_REDIS_DB", "redis.db"),
    ("KY_MONITOR_REDIS_CHANNEL_NAME", "redis.channel_name"),
    ("KY_MONITOR_ROCKETMQ_ENABLED", "rocketmq.enabled"),
    ("KY_MONITOR_ROCKETMQ_NAMESRV_ADDR", "rocketmq.namesrv_addr"),
    ("KY_MONITOR_ROCKETMQ_TOPIC", "rocketmq.topic"),
    ("KY_MONITOR_ROCKETMQ_GROUP_ID", "rocketmq.group_id"),
    ("KY_MONITOR_PROMPT_SERVER_ENABLED", "prompt_server_channel.enabled"),
    ("KY_MONITOR_PROMPT_SERVER_EVENT_NAME", "prompt_server_channel.event_name"),
];

/// Older section name to current section name.
const SECTION_ALIASES: &[(&str, &str)] = &[
    ("prompt_server_channel", "event_bus"),
    ("redis_channel", "redis"),
    ("rocketmq_channel", "rocketmq"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Number of most recent history entries scanned per tick.
    pub history_window: usize,
    pub sinks: SinksConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            history_window: DEFAULT_HISTORY_WINDOW,
            sinks: SinksConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Resolves the effective configuration from `path` (if given) and the
    /// process environment. Never fails.
    pub async fn load(path: Option<&Path>) -> Self {
        let mut root = empty_object();
        if let Some(path) = path {
            match read_file_layer(path).await {
                Ok(layer) => deep_merge(&mut root, &normalize_sections(layer)),
                Err(err) => warn!("{err}; continuing without the config file"),
            }
        }
        let env = env_layer(|key| std::env::var(key).ok());
        deep_merge(&mut root, &normalize_sections(env));
        Self::from_value(&root)
    }

    /// Reads typed settings out of a merged JSON value.
    pub fn from_value(root: &Value) -> Self {
        let root = &normalize_sections(root.clone());
        let defaults = Self::default();
        let event_bus = EventBusSinkConfig::default();
        let redis = RedisSinkConfig::default();
        let rocketmq = RocketMqSinkConfig::default();
        Self {
            poll_interval: setting(
                root,
                "frequency_seconds",
                "a number of seconds greater than 0",
                parse_seconds,
                defaults.poll_interval,
            ),
            history_window: setting(
                root,
                "history_window",
                "a positive integer",
                |v| parse_u64(v).filter(|n| *n > 0).and_then(|n| usize::try_from(n).ok()),
                defaults.history_window,
            ),
            sinks: SinksConfig {
                event_bus: EventBusSinkConfig {
                    enabled: setting(
                        root,
                        "event_bus.enabled",
                        "a boolean",
                        parse_bool,
                        event_bus.enabled,
                    ),
                    event_name: setting(
                        root,
                        "event_bus.event_name",
                        "a non-empty string",
                        parse_string,
                        event_bus.event_name,
                    ),
                },
                redis: RedisSinkConfig {
                    enabled: setting(root, "redis.enabled", "a boolean", parse_bool, redis.enabled),
                    host: setting(root, "redis.host", "a non-empty string", parse_string, redis.host),
                    port: setting(
                        root,
                        "redis.port",
                        "a port number",
                        |v| parse_u64(v).and_then(|n| u16::try_from(n).ok()),
                        redis.port,
                    ),
                    password: match lookup(root, "redis.password") {
                        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                        _ => redis.password,
                    },
                    db: setting(root, "redis.db", "an integer", parse_i64, redis.db),
                    channel_name: setting(
                        root,
                        "redis.channel_name",
                        "a non-empty string",
                        parse_string,
                        redis.channel_name,
                    ),
                },
                rocketmq: RocketMqSinkConfig {
                    enabled: setting(
                        root,
                        "rocketmq.enabled",
                        "a boolean",
                        parse_bool,
                        rocketmq.enabled,
                    ),
                    namesrv_addr: setting(
                        root,
                        "rocketmq.namesrv_addr",
                        "a non-empty string",
                        parse_string,
                        rocketmq.namesrv_addr,
                    ),
                    topic: setting(
                        root,
                        "rocketmq.topic",
                        "a non-empty string",
                        parse_string,
                        rocketmq.topic,
                    ),
                    group_id: setting(
                        root,
                        "rocketmq.group_id",
                        "a non-empty string",
                        parse_string,
                        rocketmq.group_id,
                    ),
                },
            },
        }
    }

    /// The effective configuration in file layout, with the Redis password
    /// masked.
    pub fn to_redacted_value(&self) -> Value {
        let sinks = &self.sinks;
        json!({
            "frequency_seconds": self.poll_interval.as_secs_f64(),
            "history_window": self.history_window,
            "event_bus": {
                "enabled": sinks.event_bus.enabled,
                "event_name": sinks.event_bus.event_name,
            },
            "redis": {
                "enabled": sinks.redis.enabled,
                "host": sinks.redis.host,
                "port": sinks.redis.port,
                "password": sinks.redis.password.as_deref().map(redact_text),
                "db": sinks.redis.db,
                "channel_name": sinks.redis.channel_name,
            },
            "rocketmq": {
                "enabled": sinks.rocketmq.enabled,
                "namesrv_addr": sinks.rocketmq.namesrv_addr,
                "topic": sinks.rocketmq.topic,
                "group_id": sinks.rocketmq.group_id,
            },
        })
    }
}

async fn read_file_layer(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if !value.is_object() {
        return Err(ConfigError::NotAnObject {
            path: path.to_path_buf(),
        });
    }
    Ok(value)
}

fn env_layer(var: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    for (key, path) in ENV_BINDINGS {
        if let Some(raw) = var(key) {
            deep_merge(&mut root, &nest(path, Value::String(raw)));
        }
    }
    root
}

/// Folds older section names into the current ones. Keys under the current
/// name override the same keys under the older name.
fn normalize_sections(mut layer: Value) -> Value {
    if let Value::Object(map) = &mut layer {
        for (legacy, current) in SECTION_ALIASES {
            let Some(mut section) = map.remove(*legacy) else {
                continue;
            };
            debug!("reading config section {legacy} as {current}");
            if let Some(preferred) = map.get(*current) {
                deep_merge(&mut section, preferred);
            }
            map.insert((*current).to_string(), section);
        }
    }
    layer
}

fn nest(path: &str, leaf: Value) -> Value {
    path.rsplit('.').fold(leaf, |inner, key| {
        let mut map = Map::new();
        map.insert(key.to_string(), inner);
        Value::Object(map)
    })
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, key| node.get(key))
        .filter(|value| !value.is_null())
}

fn setting<T>(
    root: &Value,
    key: &str,
    expected: &'static str,
    parse: impl Fn(&Value) -> Option<T>,
    default: T,
) -> T {
    let Some(raw) = lookup(root, key) else {
        return default;
    };
    match parse(raw) {
        Some(value) => value,
        None => {
            let err = ConfigError::InvalidValue {
                key: key.to_string(),
                expected,
                value: raw.to_string(),
            };
            warn!("{err}; using default");
            default
        }
    }
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "t" | "y" | "yes" => Some(true),
        "false" | "0" | "f" | "n" | "no" => Some(false),
        _ => None,
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => parse_bool_like(s),
        Value::Number(n) => match n.as_u64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_seconds(value: &Value) -> Option<Duration> {
    let secs = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !(secs.is_finite() && secs > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
