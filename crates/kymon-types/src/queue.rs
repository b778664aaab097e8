//! Raw queue state as reported by the task-execution engine.
//!
//! Queue items arrive as positional tuples
//! `[number, prompt_id, prompt, extra_data, outputs_to_execute]`; history entries
//! carry a status object with a status string and `[type, data]` message pairs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct QueueItem {
    pub position: i64,
    pub prompt_id: String,
    pub prompt: Value,
    pub extra_data: Option<Value>,
    /// Remaining tuple members, passed through untouched.
    pub rest: Vec<Value>,
}

impl QueueItem {
    pub fn new(position: i64, prompt_id: impl Into<String>) -> Self {
        Self {
            position,
            prompt_id: prompt_id.into(),
            prompt: Value::Null,
            extra_data: None,
            rest: Vec::new(),
        }
    }

    pub fn with_extra_data(mut self, extra_data: Value) -> Self {
        self.extra_data = Some(extra_data);
        self
    }

    pub fn client_id(&self) -> Option<String> {
        self.extra_data
            .as_ref()?
            .get("client_id")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// The workflow node list stored under `extra_pnginfo.workflow.nodes`.
    pub fn workflow_nodes(&self) -> Option<&Vec<Value>> {
        self.extra_data
            .as_ref()?
            .get("extra_pnginfo")?
            .get("workflow")?
            .get("nodes")?
            .as_array()
    }
}

impl TryFrom<Vec<Value>> for QueueItem {
    type Error = String;

    fn try_from(value: Vec<Value>) -> Result<Self, Self::Error> {
        let mut parts = value.into_iter();
        let position = match parts.next() {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().and_then(integral_f64))
                .ok_or_else(|| format!("queue position must be an integer in range: {n}"))?,
            other => return Err(format!("queue position must be a number, got {other:?}")),
        };
        let prompt_id = match parts.next() {
            Some(Value::String(id)) => id,
            other => return Err(format!("prompt id must be a string, got {other:?}")),
        };
        let prompt = parts.next().unwrap_or(Value::Null);
        let extra_data = parts.next().filter(|v| !v.is_null());
        Ok(Self {
            position,
            prompt_id,
            prompt,
            extra_data,
            rest: parts.collect(),
        })
    }
}

impl From<QueueItem> for Vec<Value> {
    fn from(item: QueueItem) -> Self {
        let mut out = vec![
            Value::from(item.position),
            Value::String(item.prompt_id),
            item.prompt,
            item.extra_data.unwrap_or(Value::Null),
        ];
        out.extend(item.rest);
        out
    }
}

/// `f` as an `i64` when it is a whole number inside the `i64` range.
fn integral_f64(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (f.is_finite() && f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)).then_some(f as i64)
}

/// A `[message_type, message_data]` pair from a history status object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage(pub String, pub Value);

impl StatusMessage {
    pub fn kind(&self) -> &str {
        &self.0
    }

    pub fn data(&self) -> &Value {
        &self.1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub messages: Vec<StatusMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub prompt_id: String,
    #[serde(default = "empty_array")]
    pub prompt: Value,
    #[serde(default = "empty_object")]
    pub outputs: Value,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

impl HistoryEntry {
    pub fn new(prompt_id: impl Into<String>, status: HistoryStatus) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            prompt: empty_array(),
            outputs: empty_object(),
            status: Some(status),
        }
    }
}

/// Point-in-time view of the engine queue consumed by the snapshot builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub running: Vec<QueueItem>,
    #[serde(default)]
    pub pending: Vec<QueueItem>,
    /// History in engine insertion order, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Engine-side total of completed tasks; monotonically increasing.
    #[serde(default)]
    pub completed_total: u64,
    #[serde(default)]
    pub executing_node: Option<String>,
}

impl QueueState {
    /// The `window` most recent history entries, oldest first.
    pub fn recent_history(&self, window: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(window);
        &self.history[start..]
    }
}

/// Renders a node identifier the way the engine compares them: strings as-is,
/// numbers in their decimal form.
pub fn node_id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn empty_array() -> Value {
    Value::Array(Vec::new())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
