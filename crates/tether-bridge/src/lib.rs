pub mod bridge;
pub mod dispatch;
pub mod engine;
pub mod local;
pub mod scheduler;
pub mod telemetry;

pub use bridge::JobBridge;
pub use dispatch::{BridgeInvocation, Dispatcher, InvocationKind};
pub use engine::{JobEngine, JobId, ScheduleTime};
pub use local::{JobRun, LocalJobEngine};
pub use scheduler::Scheduler;
pub use telemetry::init_tracing;
