//! ComfyUI as a queue source.
//!
//! Queue and history are polled over HTTP each tick (`GET /queue`,
//! `GET /history?max_items=N`). The executing node is pushed by the server on
//! its `/ws` websocket as `executing` messages; a background listener keeps the
//! latest value. ComfyUI's HTTP API does not expose its completed-task
//! counter, so the source keeps its own: it grows by one for every prompt id
//! that newly appears in history and never decreases.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use kymon_types::{node_id_string, HistoryEntry, QueueItem, QueueState};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::QueueSourceError;
use crate::queue_source::QueueSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_BACKOFF_SECS: u64 = 60;
/// History is fetched at least this deep so the completed counter does not
/// miss prompts that finish between ticks.
const HISTORY_FETCH_FLOOR: usize = 32;

/// Items stay raw here so one bad tuple only costs that item.
#[derive(Debug, Default, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    queue_running: Vec<Value>,
    #[serde(default)]
    queue_pending: Vec<Value>,
}

#[derive(Debug, Default)]
struct CompletedTracker {
    seen: HashSet<String>,
    total: u64,
}

impl CompletedTracker {
    fn observe(&mut self, history: &[HistoryEntry]) -> u64 {
        let current: HashSet<String> = history.iter().map(|e| e.prompt_id.clone()).collect();
        let fresh = current.difference(&self.seen).count() as u64;
        self.total += fresh;
        self.seen = current;
        self.total
    }
}

pub struct ComfyQueueSource {
    base_url: String,
    client: reqwest::Client,
    executing: Arc<RwLock<Option<String>>>,
    completed: Mutex<CompletedTracker>,
}

impl ComfyQueueSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            anyhow::bail!("ComfyUI url must start with http:// or https://, got {base_url}");
        }
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url,
            client,
            executing: Arc::new(RwLock::new(None)),
            completed: Mutex::new(CompletedTracker::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Websocket endpoint with a fresh client id.
    pub fn ws_url(&self) -> String {
        let rest = self
            .base_url
            .strip_prefix("https://")
            .map(|host| format!("wss://{host}"))
            .or_else(|| {
                self.base_url
                    .strip_prefix("http://")
                    .map(|host| format!("ws://{host}"))
            })
            .unwrap_or_else(|| self.base_url.clone());
        format!("{rest}/ws?clientId=kymon-{}", uuid::Uuid::new_v4())
    }

    pub fn executing_node(&self) -> Option<String> {
        self.executing.read().clone()
    }

    /// Follows the websocket until `cancel` fires, reconnecting with
    /// exponential backoff.
    pub fn spawn_progress_listener(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let ws_url = self.ws_url();
        let executing = self.executing.clone();
        tokio::spawn(async move {
            let mut backoff_secs: u64 = 1;
            loop {
                let connected = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = listen_once(&ws_url, &executing) => match result {
                        Ok(()) => {
                            debug!("ComfyUI websocket closed by server");
                            true
                        }
                        Err(err) => {
                            warn!("ComfyUI websocket error: {err:#}");
                            false
                        }
                    },
                };
                *executing.write() = None;
                if connected {
                    backoff_secs = 1;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }
                backoff_secs = (backoff_secs * 2).min(MAX_RECONNECT_BACKOFF_SECS);
            }
            debug!("ComfyUI progress listener stopped");
        })
    }

    async fn get_json(&self, endpoint: &str) -> Result<Value, QueueSourceError> {
        let http = |source: reqwest::Error| QueueSourceError::Http {
            endpoint: endpoint.to_string(),
            source,
        };
        let body = self
            .client
            .get(format!("{}{endpoint}", self.base_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http)?
            .text()
            .await
            .map_err(http)?;
        serde_json::from_str(&body).map_err(|source| QueueSourceError::Malformed {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}

#[async_trait]
impl QueueSource for ComfyQueueSource {
    fn name(&self) -> &str {
        "comfyui"
    }

    async fn read_state(&self, history_window: usize) -> Result<QueueState, QueueSourceError> {
        let queue = self.get_json("/queue").await?;
        let (running, pending) =
            parse_queue(queue).map_err(|source| QueueSourceError::Malformed {
                endpoint: "/queue".to_string(),
                source,
            })?;

        let endpoint = format!(
            "/history?max_items={}",
            history_window.max(HISTORY_FETCH_FLOOR)
        );
        let history = parse_history(self.get_json(&endpoint).await?);
        let completed_total = self.completed.lock().observe(&history);

        Ok(QueueState {
            running,
            pending,
            history,
            completed_total,
            executing_node: self.executing_node(),
        })
    }
}

async fn listen_once(ws_url: &str, executing: &RwLock<Option<String>>) -> anyhow::Result<()> {
    let (mut stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
    info!("ComfyUI websocket connected");
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => apply_ws_message(&text, executing),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

fn apply_ws_message(text: &str, executing: &RwLock<Option<String>>) {
    let Ok(event) = serde_json::from_str::<Value>(text) else {
        return;
    };
    if event.get("type").and_then(Value::as_str) != Some("executing") {
        return;
    }
    let node = event
        .get("data")
        .and_then(|data| data.get("node"))
        .and_then(node_id_string);
    *executing.write() = node;
}

/// Fails only when the response itself has the wrong shape; malformed items
/// are logged and dropped.
fn parse_queue(value: Value) -> Result<(Vec<QueueItem>, Vec<QueueItem>), serde_json::Error> {
    let response: QueueResponse = serde_json::from_value(value)?;
    Ok((
        parse_items("queue_running", response.queue_running),
        parse_items("queue_pending", response.queue_pending),
    ))
}

fn parse_items(list: &str, raw: Vec<Value>) -> Vec<QueueItem> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<QueueItem>(item) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("skipping malformed {list} item #{index}: {err}");
                None
            }
        })
        .collect()
}

/// `/history` is an object keyed by prompt id in insertion order. Entries that
/// do not parse are logged and dropped.
fn parse_history(value: Value) -> Vec<HistoryEntry> {
    let Value::Object(map) = value else {
        debug!("history response is not an object, treating as empty");
        return Vec::new();
    };
    map.into_iter()
        .filter_map(|(prompt_id, raw)| {
            match serde_json::from_value::<HistoryEntry>(raw) {
                Ok(mut entry) => {
                    entry.prompt_id = prompt_id;
                    Some(entry)
                }
                Err(err) => {
                    warn!("skipping malformed history entry {prompt_id}: {err}");
                    None
                }
            }
        })
        .collect()
}
