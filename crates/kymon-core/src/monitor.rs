//! The periodic monitor loop.
//!
//! `start()` spawns a task that sleeps for the poll interval, runs one tick and
//! repeats. Cancellation is observed only while sleeping, so `stop()` may wait
//! for the tick in progress to finish. Ticks never overlap: the snapshot
//! builder sits behind one async mutex that a tick holds from read to
//! broadcast.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use kymon_channels::{initialize_sinks, Broadcaster, EventBus, Sink, SinkSet};
use kymon_observability::{emit_event, ObservabilityEvent, ProcessKind};
use kymon_types::DeliveryEnvelope;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::SnapshotBuilder;
use crate::config::MonitorConfig;
use crate::queue_source::QueueSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A snapshot with `items` prompt entries went to the sinks.
    Published { items: usize },
    /// Nothing to report; no sink was called.
    Idle,
    /// The queue source could not be read; the tick was skipped.
    Unavailable,
}

struct MonitorInner {
    config: MonitorConfig,
    source: Arc<dyn QueueSource>,
    builder: Mutex<SnapshotBuilder>,
    broadcaster: Broadcaster,
    sinks: SinkSet,
}

struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunHandle {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

pub struct Monitor {
    inner: Arc<MonitorInner>,
    run: parking_lot::Mutex<Option<RunHandle>>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, source: Arc<dyn QueueSource>, sinks: SinkSet) -> Self {
        let builder = SnapshotBuilder::new(config.history_window);
        Self {
            inner: Arc::new(MonitorInner {
                broadcaster: Broadcaster::from_set(&sinks),
                builder: Mutex::new(builder),
                config,
                source,
                sinks,
            }),
            run: parking_lot::Mutex::new(None),
        }
    }

    /// Builds the sinks from `config` and wires them to a new monitor.
    pub async fn with_sinks(
        config: MonitorConfig,
        source: Arc<dyn QueueSource>,
        bus: Option<EventBus>,
    ) -> Self {
        let sinks = initialize_sinks(&config.sinks, bus).await;
        Self::new(config, source, sinks)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn sinks(&self) -> &SinkSet {
        &self.inner.sinks
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().as_ref().is_some_and(RunHandle::is_live)
    }

    /// Spawns the loop on the current tokio runtime. No-op while a loop is
    /// already running.
    pub fn start(&self) {
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(RunHandle::is_live) {
            debug!("monitor already running");
            return;
        }
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { inner.run_loop(token).await });
        *run = Some(RunHandle { cancel, handle });
        info!(
            "monitor started, interval: {:?}, history window: {}, sinks: {}",
            self.inner.config.poll_interval,
            self.inner.config.history_window,
            self.inner.sinks.active().len()
        );
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Monitor,
            ObservabilityEvent {
                event: "monitor.start",
                component: "core.monitor",
                status: Some("running"),
                ..ObservabilityEvent::default()
            },
        );
    }

    /// Cancels the loop, waits for the current tick to drain and shuts down the
    /// message-queue producer.
    pub async fn stop(&self) {
        let current = self.run.lock().take();
        if let Some(run) = current {
            run.cancel.cancel();
            if let Err(err) = run.handle.await {
                error!("monitor loop task failed: {err}");
            }
        }
        if let Err(err) = self.inner.sinks.message_queue().shutdown().await {
            warn!("message-queue sink shutdown failed: {err:#}");
        }
        info!("monitor stopped");
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Monitor,
            ObservabilityEvent {
                event: "monitor.stop",
                component: "core.monitor",
                status: Some("stopped"),
                ..ObservabilityEvent::default()
            },
        );
    }

    /// Runs one tick immediately, outside the timer.
    pub async fn tick(&self) -> TickOutcome {
        self.inner.tick().await
    }

    pub async fn sent_count(&self, prompt_id: &str) -> u32 {
        self.inner.builder.lock().await.sent_count(prompt_id)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

impl MonitorInner {
    async fn run_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if let Err(panic) = AssertUnwindSafe(self.tick()).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&'static str>()
                    .map(|msg| (*msg).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("monitor tick panicked: {message}");
            }
        }
        debug!("monitor loop exited");
    }

    async fn tick(&self) -> TickOutcome {
        let mut builder = self.builder.lock().await;
        let state = match self.source.read_state(builder.history_window()).await {
            Ok(state) => state,
            Err(err) => {
                error!("queue source {} unavailable: {err}", self.source.name());
                let detail = err.to_string();
                emit_event(
                    tracing::Level::WARN,
                    ProcessKind::Monitor,
                    ObservabilityEvent {
                        event: "queue.unavailable",
                        component: "core.monitor",
                        status: Some("skipped"),
                        error_code: Some("QUEUE_UNAVAILABLE"),
                        detail: Some(&detail),
                        ..ObservabilityEvent::default()
                    },
                );
                return TickOutcome::Unavailable;
            }
        };

        let snapshot = builder.build(&state);
        if snapshot.is_empty() {
            debug!("queue is empty, skipping broadcast");
            return TickOutcome::Idle;
        }
        for prompt_id in snapshot.terminal_ids() {
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Monitor,
                ObservabilityEvent {
                    event: "prompt.finished",
                    component: "core.monitor",
                    prompt_id: Some(prompt_id),
                    ..ObservabilityEvent::default()
                },
            );
        }

        let items = snapshot.prompts.len();
        let envelope =
            DeliveryEnvelope::new(self.config.sinks.event_bus.event_name.clone(), snapshot);
        self.broadcaster.broadcast(&envelope).await;
        TickOutcome::Published { items }
    }
}
