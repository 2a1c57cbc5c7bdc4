pub mod executor;
pub mod metrics;
pub mod persistence;
pub mod shutdown;

pub use executor::{SerialExecutor, WorkerPool};
pub use metrics::LatencyTracker;
pub use shutdown::{ShutdownManager, ShutdownSignal, ShutdownStage, ShutdownTrigger};
