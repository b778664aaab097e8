//! Workflow progress of the executing prompt.
//!
//! The node graph is the `extra_pnginfo.workflow.nodes` list stored with the
//! queue item. Nodes are ordered by their `order` field; the executing node's
//! 1-based position in that ordering is the progress step.

use kymon_types::{node_id_string, ProgressInfo, QueueItem};
use serde_json::Value;
use tracing::debug;

const UNKNOWN_NODE_TYPE: &str = "Unknown";

struct OrderedNode<'a> {
    order: f64,
    id: String,
    node: &'a Value,
}

pub fn derive_progress(item: &QueueItem, executing_node: Option<&str>) -> ProgressInfo {
    let current_node_id = executing_node.map(str::to_string);
    let Some(nodes) = item.workflow_nodes() else {
        debug!("prompt {} carries no workflow node list", item.prompt_id);
        return ProgressInfo::unknown(current_node_id);
    };

    let mut ordered = Vec::with_capacity(nodes.len());
    for node in nodes {
        let order = node.get("order").and_then(Value::as_f64);
        let id = node.get("id").and_then(node_id_string);
        match (order, id) {
            (Some(order), Some(id)) => ordered.push(OrderedNode { order, id, node }),
            _ => debug!(
                "node without usable 'order' or 'id' in prompt {}: {node}",
                item.prompt_id
            ),
        }
    }
    ordered.sort_by(|a, b| a.order.total_cmp(&b.order));

    let total = ordered.len();
    let found = executing_node.and_then(|executing| {
        ordered
            .iter()
            .position(|candidate| candidate.id == executing)
            .map(|index| (index + 1, &ordered[index]))
    });
    match found {
        Some((order, current)) => {
            let name = current
                .node
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN_NODE_TYPE);
            ProgressInfo::new(total, current_node_id, Some(name.to_string()), order)
        }
        None => ProgressInfo::new(total, current_node_id, None, 0),
    }
}
