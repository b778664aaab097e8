//! Turns one read of the engine queue into a [`StatusSnapshot`].
//!
//! The builder owns the per-prompt send counters that make terminal records
//! at-most-once: a prompt id that has been emitted as `success` or `error`
//! is never emitted again while it stays in the history window.

use std::collections::HashMap;

use kymon_types::{
    node_id_string, FailureInfo, HistoryEntry, PromptEntry, PromptStatus, QueueState,
    QueueSummary, StatusSnapshot, SuccessInfo, TaskRecord, TerminalInfo, TerminalRecord,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::progress::derive_progress;

const EXECUTION_ERROR: &str = "execution_error";
const TRACEBACK_FRAMES: usize = 2;

#[derive(Debug)]
pub struct SnapshotBuilder {
    history_window: usize,
    sent: HashMap<String, u32>,
}

impl SnapshotBuilder {
    pub fn new(history_window: usize) -> Self {
        Self {
            history_window,
            sent: HashMap::new(),
        }
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// How many times a terminal record for `prompt_id` has been emitted.
    pub fn sent_count(&self, prompt_id: &str) -> u32 {
        self.sent.get(prompt_id).copied().unwrap_or(0)
    }

    pub fn build(&mut self, state: &QueueState) -> StatusSnapshot {
        let mut prompts = Vec::with_capacity(state.running.len() + state.pending.len());

        for (index, item) in state.running.iter().enumerate() {
            let progress = (index == 0)
                .then(|| derive_progress(item, state.executing_node.as_deref()));
            prompts.push(PromptEntry::Task(TaskRecord {
                prompt_id: item.prompt_id.clone(),
                position: item.position,
                client_id: item.client_id(),
                status: PromptStatus::Running,
                progress,
            }));
        }

        for item in &state.pending {
            prompts.push(PromptEntry::Task(TaskRecord {
                prompt_id: item.prompt_id.clone(),
                position: item.position,
                client_id: item.client_id(),
                status: PromptStatus::Waiting,
                progress: None,
            }));
        }

        for entry in state.recent_history(self.history_window) {
            if let Some(record) = self.observe_history(entry) {
                prompts.push(PromptEntry::Terminal(record));
            }
        }

        StatusSnapshot {
            queue_status: QueueSummary {
                running: state.running.len(),
                waiting: state.pending.len(),
                completed: state.completed_total,
            },
            prompts,
        }
    }

    /// Applies the dedup rules to one history entry and returns the record to
    /// emit, if any.
    fn observe_history(&mut self, entry: &HistoryEntry) -> Option<TerminalRecord> {
        let counted = self.sent_count(&entry.prompt_id) >= 1;
        match (terminal_record(entry), counted) {
            (Some(_), true) => None,
            (Some(record), false) => {
                *self.sent.entry(entry.prompt_id.clone()).or_insert(0) += 1;
                Some(record)
            }
            (None, true) => {
                // Suspicious: a terminal prompt should not leave its final state.
                warn!(
                    "prompt {} was already reported as finished but is no longer in a final state \
                     (status: {:?}); clearing its send counter",
                    entry.prompt_id,
                    entry.status.as_ref().map(|s| s.status_str.as_str())
                );
                self.sent.remove(&entry.prompt_id);
                None
            }
            (None, false) => None,
        }
    }
}

/// The terminal record for a finished history entry. `None` for entries that
/// are not final yet, including `error` entries without an `execution_error`
/// message.
fn terminal_record(entry: &HistoryEntry) -> Option<TerminalRecord> {
    let status = entry.status.as_ref()?;
    let final_state = PromptStatus::from_history_status(&status.status_str)?;
    let info = match final_state {
        PromptStatus::Error => {
            let Some(message) = status.messages.iter().find(|m| m.kind() == EXECUTION_ERROR)
            else {
                debug!(
                    "prompt {} has error status without an execution_error message",
                    entry.prompt_id
                );
                return None;
            };
            TerminalInfo::Failure(failure_info(message.data()))
        }
        _ => TerminalInfo::Success(SuccessInfo {
            prompt_id: entry.prompt_id.clone(),
            status: PromptStatus::Success,
            outputs: entry.outputs.clone(),
            messages: serde_json::to_value(&status.messages)
                .unwrap_or_else(|_| Value::Array(Vec::new())),
            prompts: entry.prompt.clone(),
        }),
    };
    Some(TerminalRecord {
        prompt_id: entry.prompt_id.clone(),
        status: final_state,
        info,
    })
}

fn failure_info(data: &Value) -> FailureInfo {
    let text = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default();
    FailureInfo {
        error_node_id: data.get("node_id").and_then(node_id_string),
        error_node_type: data
            .get("node_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        error_message: format!("{}: {}", text("exception_type"), text("exception_message")),
        traceback: data
            .get("traceback")
            .and_then(Value::as_array)
            .map(|frames| frames.iter().take(TRACEBACK_FRAMES).cloned().collect())
            .unwrap_or_default(),
        timestamp: data.get("timestamp").and_then(Value::as_i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kymon_types::{HistoryStatus, QueueItem, StatusMessage};
    use serde_json::json;

    fn status(status_str: &str, messages: Vec<StatusMessage>) -> HistoryStatus {
        HistoryStatus {
            status_str: status_str.to_string(),
            completed: status_str == "success",
            messages,
        }
    }

    fn value_error() -> StatusMessage {
        StatusMessage(
            "execution_error".to_string(),
            json!({
                "node_id": "12",
                "node_type": "KSampler",
                "exception_type": "ValueError",
                "exception_message": "bad input",
                "traceback": ["frame 1", "frame 2", "frame 3"],
                "timestamp": 1717000000000i64
            }),
        )
    }

    fn ids(snapshot: &StatusSnapshot) -> Vec<&str> {
        snapshot.prompts.iter().map(PromptEntry::prompt_id).collect()
    }

    #[test]
    fn orders_running_then_waiting_then_terminal() {
        let state = QueueState {
            running: vec![QueueItem::new(3, "r1"), QueueItem::new(4, "r2")],
            pending: vec![QueueItem::new(5, "w1")],
            history: vec![HistoryEntry::new("h1", status("success", Vec::new()))],
            completed_total: 40,
            executing_node: None,
        };
        let snapshot = SnapshotBuilder::new(5).build(&state);
        assert_eq!(ids(&snapshot), vec!["r1", "r2", "w1", "h1"]);
        assert_eq!(
            snapshot.queue_status,
            QueueSummary {
                running: 2,
                waiting: 1,
                completed: 40
            }
        );
    }

    #[test]
    fn only_first_running_item_carries_progress() {
        let state = QueueState {
            running: vec![QueueItem::new(0, "r1"), QueueItem::new(1, "r2")],
            ..QueueState::default()
        };
        let snapshot = SnapshotBuilder::new(5).build(&state);
        let progress: Vec<bool> = snapshot
            .prompts
            .iter()
            .map(|entry| match entry {
                PromptEntry::Task(task) => task.progress.is_some(),
                PromptEntry::Terminal(_) => false,
            })
            .collect();
        assert_eq!(progress, vec![true, false]);
    }

    #[test]
    fn failure_record_and_no_re_emission() {
        let state = QueueState {
            history: vec![HistoryEntry::new("p1", status("error", vec![value_error()]))],
            ..QueueState::default()
        };
        let mut builder = SnapshotBuilder::new(5);

        let first = builder.build(&state);
        let PromptEntry::Terminal(record) = &first.prompts[0] else {
            panic!("expected a terminal record");
        };
        assert_eq!(record.status, PromptStatus::Error);
        let TerminalInfo::Failure(info) = &record.info else {
            panic!("expected failure info");
        };
        assert_eq!(info.error_message, "ValueError: bad input");
        assert_eq!(info.error_node_id.as_deref(), Some("12"));
        assert_eq!(info.error_node_type.as_deref(), Some("KSampler"));
        assert_eq!(info.traceback, vec![json!("frame 1"), json!("frame 2")]);
        assert_eq!(info.timestamp, Some(1717000000000));
        assert_eq!(builder.sent_count("p1"), 1);

        let second = builder.build(&state);
        assert!(second.is_empty());
        assert_eq!(builder.sent_count("p1"), 1);
    }

    #[test]
    fn success_record_carries_outputs_messages_and_prompt() {
        let mut entry = HistoryEntry::new(
            "ok",
            status(
                "success",
                vec![StatusMessage(
                    "execution_start".to_string(),
                    json!({"prompt_id": "ok"}),
                )],
            ),
        );
        entry.outputs = json!({"9": {"images": [{"filename": "out.png"}]}});
        entry.prompt = json!([1, "ok", {"3": {}}]);
        let state = QueueState {
            history: vec![entry],
            ..QueueState::default()
        };

        let snapshot = SnapshotBuilder::new(5).build(&state);
        let PromptEntry::Terminal(record) = &snapshot.prompts[0] else {
            panic!("expected a terminal record");
        };
        let TerminalInfo::Success(info) = &record.info else {
            panic!("expected success info");
        };
        assert_eq!(info.prompt_id, "ok");
        assert_eq!(info.outputs["9"]["images"][0]["filename"], "out.png");
        assert_eq!(info.messages, json!([["execution_start", {"prompt_id": "ok"}]]));
        assert_eq!(info.prompts, json!([1, "ok", {"3": {}}]));
    }

    #[test]
    fn error_without_execution_error_is_not_terminal() {
        let state = QueueState {
            history: vec![HistoryEntry::new("p2", status("error", Vec::new()))],
            ..QueueState::default()
        };
        let mut builder = SnapshotBuilder::new(5);
        assert!(builder.build(&state).is_empty());
        assert_eq!(builder.sent_count("p2"), 0);
    }

    #[test]
    fn reappearing_in_non_terminal_state_clears_counter() {
        let mut builder = SnapshotBuilder::new(5);
        let done = QueueState {
            history: vec![HistoryEntry::new("p3", status("success", Vec::new()))],
            ..QueueState::default()
        };
        assert_eq!(builder.build(&done).prompts.len(), 1);
        assert_eq!(builder.sent_count("p3"), 1);

        let regressed = QueueState {
            history: vec![HistoryEntry::new("p3", status("running", Vec::new()))],
            ..QueueState::default()
        };
        assert!(builder.build(&regressed).is_empty());
        assert_eq!(builder.sent_count("p3"), 0);

        assert_eq!(builder.build(&done).prompts.len(), 1);
    }

    #[test]
    fn entries_without_status_are_skipped() {
        let entry = HistoryEntry {
            prompt_id: "bare".to_string(),
            ..HistoryEntry::default()
        };
        let state = QueueState {
            history: vec![entry],
            ..QueueState::default()
        };
        let mut builder = SnapshotBuilder::new(5);
        assert!(builder.build(&state).is_empty());
        assert_eq!(builder.sent_count("bare"), 0);
    }

    #[test]
    fn only_the_history_window_is_scanned() {
        let history = (0..8)
            .map(|i| HistoryEntry::new(format!("h{i}"), status("success", Vec::new())))
            .collect();
        let state = QueueState {
            history,
            ..QueueState::default()
        };
        let mut builder = SnapshotBuilder::new(3);
        let snapshot = builder.build(&state);
        assert_eq!(ids(&snapshot), vec!["h5", "h6", "h7"]);
        assert_eq!(builder.sent_count("h0"), 0);
    }
}
