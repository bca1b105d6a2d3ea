//! The observer: periodic lease-claim-dispatch over `transaction_meta`.
//!
//! One tick claims a bounded batch of rows in monitored statuses whose
//! deadline has passed, partitions them by status and hands each partition
//! to its handler. Handlers for different statuses run concurrently. Whatever
//! the handlers do, every row still holding the tick's lease is released
//! before the tick ends.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use super::digest::FailureDigest;
use super::registry::StatusHandlerRegistry;
use super::retry::RetryPolicy;
use super::shutdown::ShutdownController;
use crate::domain::{
    AppError, ClaimCriteria, LeaseId, LockLeaseStore, TransactionMeta, partition_by_status,
};

/// Observer configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub process_id: i32,
    /// Most rows claimed per tick
    pub rows_to_process: i64,
    pub tick_interval: Duration,
    /// Leases older than this are presumed abandoned by a crashed process
    pub lease_ttl: Duration,
    /// Random delay before each tick so instances do not claim in lockstep
    pub max_jitter: Duration,
    pub digest_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            process_id: 0,
            rows_to_process: 100,
            tick_interval: Duration::from_secs(20),
            lease_ttl: Duration::from_secs(600),
            max_jitter: Duration::from_secs(2),
            digest_interval: Duration::from_secs(3_600),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables
    pub fn from_env(process_id: i32, rows_to_process: Option<i64>) -> Self {
        let defaults = Self::default();

        let tick_interval = env::var("OBSERVER_TICK_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.tick_interval);

        let lease_ttl = env::var("LEASE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_ttl);

        let digest_interval = env::var("DIGEST_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.digest_interval);

        Self {
            process_id,
            rows_to_process: rows_to_process.unwrap_or(defaults.rows_to_process),
            tick_interval,
            lease_ttl,
            digest_interval,
            ..defaults
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub lease: Option<LeaseId>,
    pub claimed: usize,
    pub partitions: usize,
    pub released: u64,
    pub lost: u64,
    pub requeued: usize,
    pub handler_failures: usize,
    /// Rows the handlers left leased, released unchanged by the tick
    pub stuck_leases: u64,
    pub reclaimed_expired: u64,
}

/// Tick history exposed on the status endpoint
#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    last: Mutex<Option<(DateTime<Utc>, TickReport)>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick: Option<TickReport>,
}

impl SchedulerStats {
    fn record(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some((Utc::now(), report.clone()));
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let last = match self.last.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        SchedulerSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            last_tick_at: last.as_ref().map(|(at, _)| *at),
            last_tick: last.map(|(_, report)| report),
        }
    }
}

pub struct LeaseScheduler {
    config: SchedulerConfig,
    store: Arc<dyn LockLeaseStore>,
    registry: StatusHandlerRegistry,
    retry: RetryPolicy,
    digest: Arc<FailureDigest>,
    stats: Arc<SchedulerStats>,
}

impl LeaseScheduler {
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn LockLeaseStore>,
        registry: StatusHandlerRegistry,
        retry: RetryPolicy,
        digest: Arc<FailureDigest>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            retry,
            digest,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Claim condition for a tick starting at `now_secs`
    fn criteria(&self, now_secs: i64) -> ClaimCriteria {
        ClaimCriteria {
            statuses: self.registry.monitored_statuses(),
            now_secs,
            max_retries: self.retry.max_retries,
            limit: self.config.rows_to_process,
        }
    }

    /// One claim-dispatch-release cycle
    #[instrument(skip(self), fields(process_id = self.config.process_id))]
    pub async fn tick(&self) -> Result<TickReport, AppError> {
        let mut report = TickReport::default();

        let ttl_millis = i64::try_from(self.config.lease_ttl.as_millis()).unwrap_or(i64::MAX);
        let older_than = Utc::now().timestamp_millis().saturating_sub(ttl_millis);
        match self.store.reclaim_expired_leases(older_than).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                warn!(reclaimed, "Cleared leases abandoned past their TTL");
                report.reclaimed_expired = reclaimed;
            }
            Err(e) => warn!(error = %e, "Expired lease sweep failed"),
        }

        if self.registry.is_empty() {
            return Ok(report);
        }

        let lease = LeaseId::generate(self.config.process_id);
        report.lease = Some(lease);
        let criteria = self.criteria(Utc::now().timestamp());

        let dispatched = match self.store.claim_and_fetch(lease, &criteria).await {
            Ok(rows) => {
                report.claimed = rows.len();
                self.dispatch(lease, rows, &mut report).await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        // Runs whatever happened above, including a failed claim
        match self.store.release_all(lease).await {
            Ok(0) => {}
            Ok(stuck) => {
                warn!(
                    lease = %lease,
                    stuck,
                    "Rows still leased after handlers returned, released unchanged"
                );
                report.stuck_leases = stuck;
            }
            Err(e) => error!(lease = %lease, error = %e, "Final lease release failed"),
        }

        dispatched?;
        self.stats.record(&report);

        if report.claimed > 0 {
            info!(
                lease = %lease,
                claimed = report.claimed,
                partitions = report.partitions,
                released = report.released,
                lost = report.lost,
                requeued = report.requeued,
                handler_failures = report.handler_failures,
                "Tick complete"
            );
        } else {
            debug!(lease = %lease, "Nothing to reclaim");
        }
        Ok(report)
    }

    async fn dispatch(&self, lease: LeaseId, rows: Vec<TransactionMeta>, report: &mut TickReport) {
        let partitions = partition_by_status(rows);
        report.partitions = partitions.len();

        let mut handlers = JoinSet::new();
        for (status, batch) in partitions {
            let Some(handler) = self.registry.get(status) else {
                warn!(
                    status = %status,
                    rows = batch.len(),
                    "No handler registered for claimed status"
                );
                continue;
            };
            handlers.spawn(async move { (status, handler.handle_batch(lease, batch).await) });
        }

        while let Some(joined) = handlers.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.released += outcome.released;
                    report.lost += outcome.lost;
                    report.requeued += outcome.requeued;
                }
                Ok((status, Err(e))) => {
                    report.handler_failures += 1;
                    error!(lease = %lease, status = %status, error = %e, "Status handler failed");
                    self.digest
                        .record(&format!("handler_error:{}", status), None, e.to_string());
                }
                Err(e) => {
                    report.handler_failures += 1;
                    error!(lease = %lease, error = %e, "Status handler panicked");
                    self.digest.record("handler_panic", None, e.to_string());
                }
            }
        }
    }

    async fn jitter(&self) {
        let max = self.config.max_jitter.as_millis() as u64;
        if max == 0 {
            return;
        }
        let delay = rand::thread_rng().gen_range(0..=max);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Tick until shutdown is triggered. A tick in progress always finishes.
    pub async fn run(&self, shutdown: ShutdownController) {
        info!(
            process_id = self.config.process_id,
            interval = ?self.config.tick_interval,
            rows = self.config.rows_to_process,
            statuses = ?self.registry.monitored_statuses(),
            "Starting lease scheduler"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_digest = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.triggered() => break,
            }
            tokio::select! {
                _ = self.jitter() => {}
                _ = shutdown.triggered() => break,
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduler tick failed");
            }

            if last_digest.elapsed() >= self.config.digest_interval {
                self.digest.report("observer");
                last_digest = Instant::now();
            }
        }

        self.digest.report("observer");
        info!("Lease scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransactionStatus;
    use crate::test_utils::{Harness, queued_row, row_with_status};

    fn scheduler(harness: &Harness) -> LeaseScheduler {
        LeaseScheduler::new(
            SchedulerConfig {
                process_id: 7,
                max_jitter: Duration::ZERO,
                ..SchedulerConfig::default()
            },
            harness.store.clone(),
            StatusHandlerRegistry::standard(harness.context()),
            harness.retry,
            Arc::clone(&harness.digest),
        )
    }

    #[tokio::test]
    async fn test_tick_claims_dispatches_and_releases() {
        let harness = Harness::new();
        harness.insert(queued_row(1, -60));
        harness.insert(queued_row(2, -60));
        harness.insert(queued_row(3, 600)); // Deadline not reached

        let report = scheduler(&harness).tick().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.partitions, 1);
        assert_eq!(report.released, 2);
        assert_eq!(report.stuck_leases, 0);

        assert!(harness.store.all().iter().all(|row| row.lock.is_none()));
        assert_eq!(harness.store.get(3).unwrap().status, TransactionStatus::Queued);
    }

    #[tokio::test]
    async fn test_rows_left_by_failing_handler_are_released() {
        let harness = Harness::new();
        harness.insert(row_with_status(1, TransactionStatus::GethDown, -60));
        harness.store.fail_releases(true);

        let report = scheduler(&harness).tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.handler_failures, 1);
        assert_eq!(report.stuck_leases, 1);

        let stored = harness.store.get(1).unwrap();
        assert_eq!(stored.lock, None);
        assert_eq!(stored.status, TransactionStatus::GethDown);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_expired_leases_are_swept() {
        let harness = Harness::new();
        let mut row = queued_row(1, 600);
        row.lock = Some(LeaseId::new(1_000, 3));
        harness.insert(row);

        let report = scheduler(&harness).tick().await.unwrap();
        assert_eq!(report.reclaimed_expired, 1);
        assert_eq!(harness.store.get(1).unwrap().lock, None);
    }

    #[tokio::test]
    async fn test_stats_track_last_tick() {
        let harness = Harness::new();
        harness.insert(queued_row(1, -60));
        let scheduler = scheduler(&harness);
        scheduler.tick().await.unwrap();

        let snapshot = scheduler.stats().snapshot();
        assert_eq!(snapshot.ticks, 1);
        assert_eq!(snapshot.last_tick.unwrap().claimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let harness = Harness::new();
        let scheduler = Arc::new(scheduler(&harness));
        let shutdown = ShutdownController::new();

        let runner = Arc::clone(&scheduler);
        let controller = shutdown.clone();
        let handle = tokio::spawn(async move { runner.run(controller).await });

        tokio::time::sleep(Duration::from_secs(45)).await;
        shutdown.trigger(crate::app::shutdown::ShutdownReason::Signal("SIGTERM"));
        handle.await.unwrap();

        assert!(scheduler.stats().snapshot().ticks >= 2);
    }
}
