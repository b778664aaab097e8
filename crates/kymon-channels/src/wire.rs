//! Text wire format shared by the pub/sub and message-queue sinks.
//!
//! Both publish a JSON list holding exactly one envelope:
//! `[{"event": "<event_name>", "data": {"queue_status": {...}, "prompts": [...]}}]`.

use anyhow::{bail, Context};
use kymon_types::DeliveryEnvelope;

pub fn encode_envelope(envelope: &DeliveryEnvelope) -> anyhow::Result<String> {
    serde_json::to_string(std::slice::from_ref(envelope)).context("serialize envelope")
}

pub fn decode_envelope(text: &str) -> anyhow::Result<DeliveryEnvelope> {
    let mut list: Vec<DeliveryEnvelope> =
        serde_json::from_str(text).context("deserialize envelope list")?;
    if list.len() != 1 {
        bail!("expected exactly one envelope, got {}", list.len());
    }
    list.pop().context("empty envelope list")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kymon_types::{
        FailureInfo, ProgressInfo, PromptEntry, PromptStatus, QueueSummary, StatusSnapshot,
        SuccessInfo, TaskRecord, TerminalInfo, TerminalRecord,
    };
    use serde_json::json;

    fn sample_snapshot() -> StatusSnapshot {
        StatusSnapshot {
            queue_status: QueueSummary {
                running: 1,
                waiting: 1,
                completed: 42,
            },
            prompts: vec![
                PromptEntry::Task(TaskRecord {
                    prompt_id: "run-1".into(),
                    position: 7,
                    client_id: Some("client-a".into()),
                    status: PromptStatus::Running,
                    progress: Some(ProgressInfo::new(
                        3,
                        Some("12".into()),
                        Some("KSampler".into()),
                        2,
                    )),
                }),
                PromptEntry::Task(TaskRecord {
                    prompt_id: "wait-1".into(),
                    position: 8,
                    client_id: None,
                    status: PromptStatus::Waiting,
                    progress: None,
                }),
                PromptEntry::Terminal(TerminalRecord {
                    prompt_id: "done-1".into(),
                    status: PromptStatus::Success,
                    info: TerminalInfo::Success(SuccessInfo {
                        prompt_id: "done-1".into(),
                        status: PromptStatus::Success,
                        outputs: json!({"9": {"images": [{"filename": "a.png"}]}}),
                        messages: json!([["execution_success", {"prompt_id": "done-1"}]]),
                        prompts: json!([1, "done-1", {}, {}, ["9"]]),
                    }),
                }),
                PromptEntry::Terminal(TerminalRecord {
                    prompt_id: "fail-1".into(),
                    status: PromptStatus::Error,
                    info: TerminalInfo::Failure(FailureInfo {
                        error_node_id: Some("4".into()),
                        error_node_type: Some("CheckpointLoader".into()),
                        error_message: "ValueError: bad input".into(),
                        traceback: vec![json!("frame 1"), json!("frame 2")],
                        timestamp: Some(1_700_000_000_000),
                    }),
                }),
            ],
        }
    }

    #[test]
    fn envelope_survives_wire_round_trip() {
        let envelope = DeliveryEnvelope::new("ky_monitor.queue", sample_snapshot());
        let text = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&text).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn wire_text_is_a_list_of_one() {
        let envelope = DeliveryEnvelope::new("evt", StatusSnapshot::default());
        let value: serde_json::Value =
            serde_json::from_str(&encode_envelope(&envelope).unwrap()).unwrap();
        assert_eq!(
            value,
            json!([{
                "event": "evt",
                "data": {"queue_status": {"running": 0, "waiting": 0, "completed": 0}, "prompts": []}
            }])
        );
    }

    #[test]
    fn decode_rejects_multiple_envelopes() {
        let envelope = DeliveryEnvelope::new("evt", StatusSnapshot::default());
        let one = serde_json::to_value(&envelope).unwrap();
        let text = serde_json::to_string(&json!([one.clone(), one])).unwrap();
        assert!(decode_envelope(&text).is_err());
    }
}
