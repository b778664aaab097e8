use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use kymon_types::QueueState;
use parking_lot::RwLock;

use crate::error::QueueSourceError;

/// Read access to the task-execution engine's queue.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Running and pending items, at least the `history_window` most recent
    /// history entries, the completed counter and the executing node.
    async fn read_state(&self, history_window: usize) -> Result<QueueState, QueueSourceError>;
}

/// An in-memory queue whose state is replaced by the owner.
#[derive(Debug, Default)]
pub struct StaticQueueSource {
    state: RwLock<Option<QueueState>>,
}

impl StaticQueueSource {
    pub fn new(state: QueueState) -> Self {
        Self {
            state: RwLock::new(Some(state)),
        }
    }

    /// A source that reports the engine as unavailable until a state is set.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Loads a `QueueState` JSON document.
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read queue state {}", path.display()))?;
        let state: QueueState = serde_json::from_str(&raw)
            .with_context(|| format!("parse queue state {}", path.display()))?;
        Ok(Self::new(state))
    }

    pub fn set_state(&self, state: QueueState) {
        *self.state.write() = Some(state);
    }

    pub fn set_unavailable(&self) {
        *self.state.write() = None;
    }

    /// Mutates the current state in place; no-op while unavailable.
    pub fn update(&self, apply: impl FnOnce(&mut QueueState)) {
        if let Some(state) = self.state.write().as_mut() {
            apply(state);
        }
    }
}

#[async_trait]
impl QueueSource for StaticQueueSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn read_state(&self, _history_window: usize) -> Result<QueueState, QueueSourceError> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| QueueSourceError::Unavailable("no queue state loaded".to_string()))
    }
}
