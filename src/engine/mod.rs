pub mod gateway;
pub mod orders;
pub mod positions;
pub mod rounding;

pub use gateway::ExchangeGateway;
pub use orders::{OrderEngine, OrderEngineEvent, OrderEngineHandle, ReconcileReason};
pub use positions::{PositionHandle, PositionTracker};
