//! Fan-out of one envelope to every enabled sink.
//!
//! Sinks are visited sequentially in registration order. A sink that errors or
//! panics is logged and skipped; the remaining sinks still receive the
//! envelope and the caller never sees the failure. An envelope without
//! prompt entries is never sent.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use kymon_observability::{emit_event, ObservabilityEvent, ProcessKind};
use kymon_types::DeliveryEnvelope;
use tracing::{debug, error};

use crate::registry::{SinkHandle, SinkSet};

#[derive(Clone, Default)]
pub struct Broadcaster {
    sinks: Vec<SinkHandle>,
}

impl Broadcaster {
    pub fn new(sinks: Vec<SinkHandle>) -> Self {
        Self { sinks }
    }

    pub fn from_set(set: &SinkSet) -> Self {
        Self::new(set.active().to_vec())
    }

    pub fn sinks(&self) -> &[SinkHandle] {
        &self.sinks
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn broadcast(&self, envelope: &DeliveryEnvelope) {
        if envelope.is_empty() || self.sinks.is_empty() {
            return;
        }
        for handle in &self.sinks {
            let sink = handle.sink();
            if !sink.is_enabled() {
                continue;
            }
            let outcome = AssertUnwindSafe(sink.send(envelope)).catch_unwind().await;
            let detail = match outcome {
                Ok(Ok(())) => {
                    debug!("delivered {} via {}", envelope.event, sink.name());
                    continue;
                }
                Ok(Err(err)) => format!("{err:#}"),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&'static str>()
                        .map(|msg| (*msg).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    format!("panicked: {message}")
                }
            };
            error!("failed to send via {}: {detail}", sink.name());
            emit_event(
                tracing::Level::ERROR,
                ProcessKind::Monitor,
                ObservabilityEvent {
                    event: "sink.send_failed",
                    component: "channels.broadcaster",
                    sink: Some(sink.name()),
                    status: Some("failed"),
                    error_code: Some("SINK_SEND_FAILED"),
                    detail: Some(&detail),
                    ..ObservabilityEvent::default()
                },
            );
        }
    }
}
