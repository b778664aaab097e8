//! RocketMQ remoting protocol, JSON header flavour.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! | total len: u32 | serialize type: u8 + header len: u24 | header JSON | body |
//! ```
//!
//! `total len` counts everything after itself. Requests and responses share the
//! header shape; bit 0 of `flag` marks a response, and `opaque` pairs a response
//! with its request.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const REQUEST_SEND_MESSAGE: i32 = 10;
pub const REQUEST_GET_ROUTEINFO_BY_TOPIC: i32 = 105;
pub const RESPONSE_SUCCESS: i32 = 0;
pub const RESPONSE_TOPIC_NOT_EXIST: i32 = 17;

/// Topic brokers auto-create new topics from.
pub const AUTO_CREATE_TOPIC: &str = "TBW102";

const RPC_TYPE_RESPONSE: i32 = 1;
const SERIALIZE_TYPE_JSON: u8 = 0;
const MAX_HEADER_LEN: usize = 0x00FF_FFFF;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const PROTOCOL_VERSION: i32 = 435;
const PERM_WRITE: u32 = 0x1 << 1;
const MASTER_BROKER_ID: &str = "0";

const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';

#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed header: {0}")]
    Json(#[from] serde_json::Error),
    #[error("truncated frame")]
    Truncated,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("unsupported serialize type {0}")]
    UnsupportedSerialization(u8),
    #[error("remote returned code {code}: {remark}")]
    Remote { code: i32, remark: String },
    #[error("no route for topic {0}")]
    NoRoute(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotingHeader {
    pub code: i32,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub opaque: i32,
    #[serde(default)]
    pub flag: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(
        rename = "extFields",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ext_fields: Option<BTreeMap<String, String>>,
    #[serde(rename = "serializeTypeCurrentRPC", default = "default_serialize_type")]
    pub serialize_type: String,
}

fn default_language() -> String {
    "OTHER".to_string()
}

fn default_serialize_type() -> String {
    "JSON".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemotingCommand {
    pub header: RemotingHeader,
    pub body: Vec<u8>,
}

impl RemotingCommand {
    pub fn request(code: i32, opaque: i32, ext_fields: BTreeMap<String, String>) -> Self {
        Self {
            header: RemotingHeader {
                code,
                language: default_language(),
                version: PROTOCOL_VERSION,
                opaque,
                flag: 0,
                remark: None,
                ext_fields: Some(ext_fields),
                serialize_type: default_serialize_type(),
            },
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn is_response(&self) -> bool {
        self.header.flag & RPC_TYPE_RESPONSE == RPC_TYPE_RESPONSE
    }

    pub fn ext_field(&self, key: &str) -> Option<&str> {
        self.header.ext_fields.as_ref()?.get(key).map(String::as_str)
    }

    /// `Ok(self)` for a success response, `Err(Remote)` otherwise.
    pub fn into_success(self) -> Result<Self, RemotingError> {
        if self.header.code == RESPONSE_SUCCESS {
            return Ok(self);
        }
        Err(RemotingError::Remote {
            code: self.header.code,
            remark: self.header.remark.unwrap_or_default(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, RemotingError> {
        let header = serde_json::to_vec(&self.header)?;
        if header.len() > MAX_HEADER_LEN {
            return Err(RemotingError::FrameTooLarge(header.len()));
        }
        let total = 4 + header.len() + self.body.len();
        if total > MAX_FRAME_LEN {
            return Err(RemotingError::FrameTooLarge(total));
        }
        let mut out = Vec::with_capacity(4 + total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        let mark = (u32::from(SERIALIZE_TYPE_JSON) << 24) | header.len() as u32;
        out.extend_from_slice(&mark.to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Decodes a frame with its leading total-length field already stripped.
    pub fn decode(frame: &[u8]) -> Result<Self, RemotingError> {
        if frame.len() < 4 {
            return Err(RemotingError::Truncated);
        }
        let mark = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let serialize_type = (mark >> 24) as u8;
        if serialize_type != SERIALIZE_TYPE_JSON {
            return Err(RemotingError::UnsupportedSerialization(serialize_type));
        }
        let header_len = (mark & MAX_HEADER_LEN as u32) as usize;
        let body_start = 4 + header_len;
        if frame.len() < body_start {
            return Err(RemotingError::Truncated);
        }
        let header: RemotingHeader = serde_json::from_slice(&frame[4..body_start])?;
        Ok(Self {
            header,
            body: frame[body_start..].to_vec(),
        })
    }
}

pub async fn read_command<R>(reader: &mut R) -> Result<RemotingCommand, RemotingError>
where
    R: AsyncRead + Unpin,
{
    let total = reader.read_u32().await? as usize;
    if total > MAX_FRAME_LEN {
        return Err(RemotingError::FrameTooLarge(total));
    }
    let mut frame = vec![0u8; total];
    reader.read_exact(&mut frame).await?;
    RemotingCommand::decode(&frame)
}

/// Encodes message properties as `name\x01value\x02` pairs.
pub fn encode_properties(properties: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (name, value) in properties {
        out.push_str(name);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(value);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueData {
    pub broker_name: String,
    #[serde(default)]
    pub write_queue_nums: u32,
    #[serde(default = "default_perm")]
    pub perm: u32,
}

fn default_perm() -> u32 {
    6
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerData {
    pub broker_name: String,
    #[serde(default)]
    pub broker_addrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRouteData {
    #[serde(default)]
    pub queue_datas: Vec<QueueData>,
    #[serde(default)]
    pub broker_datas: Vec<BrokerData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQueueRef {
    pub broker_name: String,
    pub broker_addr: String,
    pub queue_id: u32,
}

impl TopicRouteData {
    /// Name servers emit broker id maps with bare integer keys (`{0:"host:port"}`),
    /// which is not valid JSON; keys are quoted before parsing.
    pub fn parse(body: &[u8]) -> Result<Self, RemotingError> {
        let text = String::from_utf8_lossy(body);
        let quoted = quote_integer_keys(&text);
        Ok(serde_json::from_str(&quoted)?)
    }

    /// Every writable queue on a master broker, in route order.
    pub fn writable_queues(&self) -> Vec<MessageQueueRef> {
        let mut queues = Vec::new();
        for queue in &self.queue_datas {
            if queue.perm & PERM_WRITE == 0 {
                continue;
            }
            let Some(addr) = self
                .broker_datas
                .iter()
                .find(|b| b.broker_name == queue.broker_name)
                .and_then(|b| b.broker_addrs.get(MASTER_BROKER_ID))
            else {
                continue;
            };
            for queue_id in 0..queue.write_queue_nums {
                queues.push(MessageQueueRef {
                    broker_name: queue.broker_name.clone(),
                    broker_addr: addr.clone(),
                    queue_id,
                });
            }
        }
        queues
    }
}

/// String literals are matched first and copied through untouched, so only
/// bare keys in object position are quoted.
fn quote_integer_keys(text: &str) -> String {
    static PATTERN: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#""(?:[^"\\]|\\.)*"|([\{,])\s*(-?\d+)\s*:"#).ok()
    });
    let Some(re) = pattern else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures<'_>| match (caps.get(1), caps.get(2)) {
        (Some(open), Some(key)) => format!("{}\"{}\":", open.as_str(), key.as_str()),
        _ => caps[0].to_string(),
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_preserves_command() {
        let mut fields = BTreeMap::new();
        fields.insert("topic".to_string(), "status".to_string());
        let command = RemotingCommand::request(REQUEST_SEND_MESSAGE, 7, fields)
            .with_body(b"[{\"event\":\"x\"}]".to_vec());

        let bytes = command.encode().unwrap();
        let total = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(total, bytes.len() - 4);

        let decoded = RemotingCommand::decode(&bytes[4..]).unwrap();
        assert_eq!(decoded, command);
        assert!(!decoded.is_response());
    }

    #[test]
    fn header_uses_protocol_field_names() {
        let command = RemotingCommand::request(REQUEST_GET_ROUTEINFO_BY_TOPIC, 1, BTreeMap::new());
        let bytes = command.encode().unwrap();
        let header: serde_json::Value = serde_json::from_slice(&bytes[8..]).unwrap();
        assert_eq!(header["code"], 105);
        assert_eq!(header["serializeTypeCurrentRPC"], "JSON");
        assert!(header.get("extFields").is_some());
    }

    #[test]
    fn decode_rejects_short_frames() {
        assert!(matches!(
            RemotingCommand::decode(&[0, 0]),
            Err(RemotingError::Truncated)
        ));
        assert!(matches!(
            RemotingCommand::decode(&[0, 0, 0, 9, b'{']),
            Err(RemotingError::Truncated)
        ));
    }

    #[test]
    fn decode_rejects_binary_serialization() {
        assert!(matches!(
            RemotingCommand::decode(&[1, 0, 0, 0]),
            Err(RemotingError::UnsupportedSerialization(1))
        ));
    }

    #[test]
    fn response_with_error_code_reports_remark() {
        let header = br#"{"code":17,"flag":1,"opaque":3,"remark":"No topic route info"}"#;
        let mut frame = ((header.len() as u32).to_be_bytes()).to_vec();
        frame.extend_from_slice(header);
        let command = RemotingCommand::decode(&frame).unwrap();
        assert!(command.is_response());
        match command.into_success() {
            Err(RemotingError::Remote { code, remark }) => {
                assert_eq!(code, RESPONSE_TOPIC_NOT_EXIST);
                assert_eq!(remark, "No topic route info");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_command_consumes_one_frame() {
        let command = RemotingCommand::request(REQUEST_SEND_MESSAGE, 11, BTreeMap::new())
            .with_body(vec![1, 2, 3]);
        let mut bytes = command.encode().unwrap();
        bytes.extend(command.encode().unwrap());
        let mut reader = bytes.as_slice();
        let first = read_command(&mut reader).await.unwrap();
        assert_eq!(first.body, vec![1, 2, 3]);
        let second = read_command(&mut reader).await.unwrap();
        assert_eq!(second.header.opaque, 11);
        assert!(reader.is_empty());
    }

    #[test]
    fn properties_use_control_separators() {
        let encoded = encode_properties(&[("KEYS", "k"), ("TAGS", "t")]);
        assert_eq!(encoded, "KEYS\u{1}k\u{2}TAGS\u{1}t\u{2}");
    }

    #[test]
    fn route_data_accepts_integer_keys() {
        let body = br#"{"brokerDatas":[{"brokerAddrs":{0:"10.0.0.5:10911",1:"10.0.0.6:10911"},"brokerName":"broker-a","cluster":"DefaultCluster"}],"queueDatas":[{"brokerName":"broker-a","perm":6,"readQueueNums":4,"topicSysFlag":0,"writeQueueNums":2}]}"#;
        let route = TopicRouteData::parse(body).unwrap();
        let queues = route.writable_queues();
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].broker_addr, "10.0.0.5:10911");
        assert_eq!(queues[1].queue_id, 1);
    }

    #[test]
    fn integer_like_text_inside_strings_is_left_alone() {
        let body = br#"{"brokerDatas":[{"brokerAddrs":{0:"10.0.0.5:10911"},"brokerName":"edge,1:b","cluster":"dc {0: \"x\",2:y}"}],"queueDatas":[{"brokerName":"edge,1:b","perm":6,"readQueueNums":1,"topicSysFlag":0,"writeQueueNums":1}]}"#;
        let route = TopicRouteData::parse(body).unwrap();
        assert_eq!(route.broker_datas[0].broker_name, "edge,1:b");
        let queues = route.writable_queues();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].broker_name, "edge,1:b");
        assert_eq!(queues[0].broker_addr, "10.0.0.5:10911");
    }

    #[test]
    fn read_only_queues_are_skipped() {
        let route = TopicRouteData {
            queue_datas: vec![QueueData {
                broker_name: "b".into(),
                write_queue_nums: 4,
                perm: 4,
            }],
            broker_datas: vec![BrokerData {
                broker_name: "b".into(),
                broker_addrs: BTreeMap::from([("0".to_string(), "h:1".to_string())]),
            }],
        };
        assert!(route.writable_queues().is_empty());
    }
}
