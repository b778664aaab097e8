pub mod builder;
pub mod comfy;
pub mod config;
pub mod error;
pub mod monitor;
pub mod progress;
pub mod queue_source;

pub use builder::SnapshotBuilder;
pub use comfy::ComfyQueueSource;
pub use config::{MonitorConfig, DEFAULT_HISTORY_WINDOW, DEFAULT_POLL_INTERVAL};
pub use error::{ConfigError, QueueSourceError};
pub use monitor::{Monitor, TickOutcome};
pub use progress::derive_progress;
pub use queue_source::{QueueSource, StaticQueueSource};
