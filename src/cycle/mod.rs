pub mod scheduler;
pub mod session;

pub use scheduler::{CycleScheduler, MarketSpec, ScheduledTransition};
pub use session::{Session, SessionEvent, SessionOrchestrator};
