//! Application state shared with the status API.

use std::sync::Arc;

use serde::Serialize;

use super::consumer::{ConsumerSnapshot, ConsumerState};
use super::scheduler::{SchedulerSnapshot, SchedulerStats};
use super::shutdown::ShutdownController;
use crate::domain::LockLeaseStore;

/// Runtime counters of whichever loop this process runs
#[derive(Clone)]
pub enum RuntimeStats {
    Observer(Arc<SchedulerStats>),
    Consumer(Arc<ConsumerState>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RuntimeSnapshot {
    Observer(SchedulerSnapshot),
    Consumer(ConsumerSnapshot),
}

impl RuntimeStats {
    pub fn role(&self) -> &'static str {
        match self {
            Self::Observer(_) => "observer",
            Self::Consumer(_) => "consumer",
        }
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        match self {
            Self::Observer(stats) => RuntimeSnapshot::Observer(stats.snapshot()),
            Self::Consumer(state) => RuntimeSnapshot::Consumer(state.snapshot()),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LockLeaseStore>,
    pub process_id: i32,
    pub runtime: RuntimeStats,
    pub shutdown: ShutdownController,
}

impl AppState {
    /// Create a new application state
    #[must_use]
    pub fn new(
        store: Arc<dyn LockLeaseStore>,
        process_id: i32,
        runtime: RuntimeStats,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            store,
            process_id,
            runtime,
            shutdown,
        }
    }
}
