pub mod queue;
pub mod snapshot;

pub use queue::*;
pub use snapshot::*;
