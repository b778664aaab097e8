use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Running,
    Waiting,
    Success,
    Error,
}

impl PromptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptStatus::Running => "running",
            PromptStatus::Waiting => "waiting",
            PromptStatus::Success => "success",
            PromptStatus::Error => "error",
        }
    }

    /// Maps a history status string to a final state.
    pub fn from_history_status(status_str: &str) -> Option<Self> {
        match status_str {
            "success" => Some(PromptStatus::Success),
            "error" => Some(PromptStatus::Error),
            _ => None,
        }
    }
}

/// Workflow progress of the actively executing prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressInfo {
    pub total_nodes: usize,
    pub current_node_id: Option<String>,
    pub current_node_name: Option<String>,
    /// 1-based position of the current node in the ordered graph; 0 when unknown.
    pub node_order: usize,
    pub completed_count: usize,
    pub percentage: f64,
}

impl ProgressInfo {
    /// Progress with zeroed counters, used when the node graph is missing or unusable.
    pub fn unknown(current_node_id: Option<String>) -> Self {
        Self {
            current_node_id,
            ..Self::default()
        }
    }

    pub fn new(
        total_nodes: usize,
        current_node_id: Option<String>,
        current_node_name: Option<String>,
        node_order: usize,
    ) -> Self {
        let node_order = if node_order > total_nodes { 0 } else { node_order };
        Self {
            total_nodes,
            current_node_id,
            current_node_name,
            node_order,
            completed_count: node_order.saturating_sub(1),
            percentage: progress_percentage(node_order, total_nodes),
        }
    }
}

/// `ceil(order * 100 / total)`, rounded to two decimals; 0 when either side is 0.
pub fn progress_percentage(node_order: usize, total_nodes: usize) -> f64 {
    if node_order == 0 || total_nodes == 0 {
        return 0.0;
    }
    let raw = (node_order as f64 * 100.0 / total_nodes as f64).ceil();
    (raw.min(100.0) * 100.0).round() / 100.0
}

/// A running or waiting prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub prompt_id: String,
    pub position: i64,
    pub client_id: Option<String>,
    pub status: PromptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub error_node_id: Option<String>,
    pub error_node_type: Option<String>,
    pub error_message: String,
    #[serde(default)]
    pub traceback: Vec<Value>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuccessInfo {
    pub prompt_id: String,
    pub status: PromptStatus,
    pub outputs: Value,
    pub messages: Value,
    pub prompts: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TerminalInfo {
    Failure(FailureInfo),
    Success(SuccessInfo),
}

/// A prompt that reached `success` or `error`, emitted once per prompt id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminalRecord {
    pub prompt_id: String,
    pub status: PromptStatus,
    pub info: TerminalInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PromptEntry {
    Task(TaskRecord),
    Terminal(TerminalRecord),
}

impl PromptEntry {
    pub fn prompt_id(&self) -> &str {
        match self {
            PromptEntry::Task(task) => &task.prompt_id,
            PromptEntry::Terminal(terminal) => &terminal.prompt_id,
        }
    }

    pub fn status(&self) -> PromptStatus {
        match self {
            PromptEntry::Task(task) => task.status,
            PromptEntry::Terminal(terminal) => terminal.status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSummary {
    pub running: usize,
    pub waiting: usize,
    pub completed: u64,
}

/// The unit of delivery: queue counters plus this tick's prompt entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub queue_status: QueueSummary,
    #[serde(default)]
    pub prompts: Vec<PromptEntry>,
}

impl StatusSnapshot {
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn terminal_ids(&self) -> impl Iterator<Item = &str> {
        self.prompts.iter().filter_map(|entry| match entry {
            PromptEntry::Terminal(t) => Some(t.prompt_id.as_str()),
            PromptEntry::Task(_) => None,
        })
    }
}

/// A snapshot tagged with the event name sinks publish it under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryEnvelope {
    pub event: String,
    pub data: StatusSnapshot,
}

impl DeliveryEnvelope {
    pub fn new(event: impl Into<String>, data: StatusSnapshot) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
