pub mod direct;
pub mod lifecycle;
pub mod relayer;
pub mod rpc;

pub use lifecycle::{ChainCoordinator, ExecutionMode, LifecycleOutcome, SplitDecision};
