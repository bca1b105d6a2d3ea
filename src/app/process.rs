//! Process registry bookkeeping shared by both binaries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use super::shutdown::ShutdownController;
use crate::domain::{AppError, ProcessRegistry, ValidationError};

/// Register this process, refusing to start if the id is held by a live process
pub async fn register_or_refuse(
    registry: &dyn ProcessRegistry,
    role: &str,
    process_id: i32,
    heartbeat_interval: Duration,
) -> Result<(), AppError> {
    let stale_after_secs =
        i64::try_from(heartbeat_interval.as_secs().saturating_mul(2)).unwrap_or(i64::MAX);
    if registry
        .register_process(role, process_id, stale_after_secs.max(1))
        .await?
    {
        info!(role, process_id, "Process registered");
        Ok(())
    } else {
        Err(AppError::Validation(ValidationError::InvalidField {
            field: "process_id".to_string(),
            message: format!("{} process {} is already running", role, process_id),
        }))
    }
}

/// Heartbeat until shutdown, then mark the process stopped
pub fn spawn_heartbeat(
    registry: Arc<dyn ProcessRegistry>,
    role: &'static str,
    process_id: i32,
    every: Duration,
    shutdown: ShutdownController,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = registry.heartbeat(role, process_id).await {
                        warn!(role, process_id, error = %e, "Heartbeat failed");
                    }
                }
                _ = shutdown.triggered() => break,
            }
        }
        if let Err(e) = registry.mark_stopped(role, process_id).await {
            warn!(role, process_id, error = %e, "Failed to mark process stopped");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::shutdown::ShutdownReason;
    use crate::test_utils::MockProcessRegistry;

    #[tokio::test]
    async fn test_second_registration_is_refused() {
        let registry = MockProcessRegistry::new();
        register_or_refuse(&registry, "observer", 1, Duration::from_secs(20))
            .await
            .unwrap();

        let second = register_or_refuse(&registry, "observer", 1, Duration::from_secs(20)).await;
        assert!(matches!(second, Err(AppError::Validation(_))));

        register_or_refuse(&registry, "consumer", 1, Duration::from_secs(20))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_marks_stopped_on_shutdown() {
        let registry = Arc::new(MockProcessRegistry::new());
        register_or_refuse(registry.as_ref(), "consumer", 4, Duration::from_secs(5))
            .await
            .unwrap();

        let shutdown = ShutdownController::new();
        let handle = spawn_heartbeat(
            registry.clone(),
            "consumer",
            4,
            Duration::from_secs(5),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.trigger(ShutdownReason::Signal("SIGINT"));
        handle.await.unwrap();

        assert!(registry.heartbeats("consumer", 4) >= 2);
        assert!(!registry.is_running("consumer", 4));
    }
}
