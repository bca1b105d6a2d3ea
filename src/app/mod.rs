//! Application layer: scheduling, status handlers and queue consumption.

pub mod consumer;
pub mod digest;
pub mod execution;
pub mod handlers;
pub mod process;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod state;

pub use consumer::{BoundedQueueConsumer, ConsumerConfig, ConsumerSnapshot, ConsumerState};
pub use digest::{FailureDigest, FailureEntry};
pub use execution::ExecuteTransactionHandler;
pub use handlers::{
    BatchOutcome, ChainStateHandler, HandlerContext, HandlerSettings, QueuedHandler,
    ResubmitHandler, StatusHandler,
};
pub use process::{register_or_refuse, spawn_heartbeat};
pub use registry::StatusHandlerRegistry;
pub use retry::RetryPolicy;
pub use scheduler::{LeaseScheduler, SchedulerConfig, SchedulerSnapshot, SchedulerStats, TickReport};
pub use shutdown::{DrainOutcome, ShutdownController, ShutdownReason};
pub use state::{AppState, RuntimeSnapshot, RuntimeStats};
