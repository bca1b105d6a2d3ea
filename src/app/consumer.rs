//! Bounded-concurrency queue consumer with zombie detection.
//!
//! At most `prefetch` deliveries are in flight at once, each holding a
//! semaphore permit until it is acked. A watchdog flags deliveries that have
//! run past the handler timeout. Flagging never cancels the handler; it only
//! feeds the overload decision. Once outstanding zombies exceed a quarter of
//! the prefetch the consumer triggers its own shutdown, stops pulling and
//! drains, leaving the restart to the process supervisor.

use std::env;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::digest::FailureDigest;
use super::shutdown::{DrainOutcome, ShutdownController, ShutdownReason};
use crate::domain::{Delivery, MessageHandler, MessageSource};

/// Share of the prefetch that may be zombies before the consumer restarts
const ZOMBIE_RATIO: f64 = 0.25;

pub const DEFAULT_QUEUE: &str = "execute_transaction";
pub const DEFAULT_SLOW_QUEUE: &str = "execute_transaction_slow";

/// Consumer configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    pub prefetch: usize,
    /// Deliveries running longer than this count as zombies
    pub handler_timeout: Duration,
    pub watchdog_interval: Duration,
    /// Wait between polls when the queue is empty
    pub idle_poll_interval: Duration,
    pub drain_poll_interval: Duration,
    pub max_drain: Duration,
    pub digest_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            prefetch: 100,
            handler_timeout: Duration::from_millis(180_000),
            watchdog_interval: Duration::from_secs(1),
            idle_poll_interval: Duration::from_millis(500),
            drain_poll_interval: Duration::from_secs(1),
            max_drain: Duration::from_secs(600),
            digest_interval: Duration::from_secs(3_600),
        }
    }
}

impl ConsumerConfig {
    /// Profile for long-running transactions: separate queue, smaller prefetch
    #[must_use]
    pub fn slow() -> Self {
        Self {
            queue: DEFAULT_SLOW_QUEUE.to_string(),
            prefetch: 25,
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env(slow_processor: bool) -> Self {
        let defaults = if slow_processor {
            Self::slow()
        } else {
            Self::default()
        };
        let (queue_var, prefetch_var) = if slow_processor {
            ("SLOW_QUEUE_NAME", "SLOW_QUEUE_PREFETCH")
        } else {
            ("QUEUE_NAME", "QUEUE_PREFETCH")
        };

        let queue = env::var(queue_var)
            .ok()
            .filter(|q| !q.is_empty())
            .unwrap_or(defaults.queue.clone());

        let prefetch = env::var(prefetch_var)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|p| *p > 0)
            .unwrap_or(defaults.prefetch);

        let handler_timeout = env::var("CONSUMER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.handler_timeout);

        let max_drain = env::var("CONSUMER_MAX_DRAIN_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_drain);

        Self {
            queue,
            prefetch,
            handler_timeout,
            max_drain,
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    tag: i64,
    started: Instant,
    zombie: bool,
    transaction_uuid: Option<Uuid>,
}

/// Per-process bookkeeping of dispatched, unacknowledged deliveries
#[derive(Debug)]
pub struct ConsumerState {
    prefetch: usize,
    zombie_threshold: usize,
    pending: AtomicUsize,
    /// Keyed by dispatch id; a redelivered tag can be in flight twice
    in_flight: DashMap<u64, InFlight>,
    next_dispatch: AtomicU64,
    /// Set once an overflow has signalled; cleared when zombies fall back
    restart_latched: AtomicBool,
    restart_signals: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    zombies_total: AtomicU64,
}

/// Point-in-time view for the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerSnapshot {
    pub prefetch: usize,
    pub zombie_threshold: usize,
    pub pending: usize,
    pub zombies: usize,
    pub completed: u64,
    pub failed: u64,
    pub zombies_total: u64,
    pub restart_signals: u64,
}

impl ConsumerState {
    #[must_use]
    pub fn new(prefetch: usize) -> Self {
        Self {
            prefetch,
            zombie_threshold: Self::threshold_for(prefetch),
            pending: AtomicUsize::new(0),
            in_flight: DashMap::new(),
            next_dispatch: AtomicU64::new(0),
            restart_latched: AtomicBool::new(false),
            restart_signals: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            zombies_total: AtomicU64::new(0),
        }
    }

    /// `round(prefetch * 0.25)`
    #[must_use]
    pub fn threshold_for(prefetch: usize) -> usize {
        (prefetch as f64 * ZOMBIE_RATIO).round() as usize
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    pub fn zombie_threshold(&self) -> usize {
        self.zombie_threshold
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Record a delivery as dispatched, before its handler starts.
    /// Returns the dispatch id to pass to [`ConsumerState::finish`].
    pub fn begin(&self, tag: i64, transaction_uuid: Option<Uuid>) -> u64 {
        let dispatch = self.next_dispatch.fetch_add(1, Ordering::SeqCst);
        self.in_flight.insert(
            dispatch,
            InFlight {
                tag,
                started: Instant::now(),
                zombie: false,
                transaction_uuid,
            },
        );
        self.pending.fetch_add(1, Ordering::SeqCst);
        dispatch
    }

    /// Dispatches of `tag` not yet finished
    pub fn copies_in_flight(&self, tag: i64) -> usize {
        self.in_flight.iter().filter(|entry| entry.tag == tag).count()
    }

    /// Record a dispatch as acked. Returns whether it had been flagged a zombie.
    /// Unknown dispatch ids change nothing.
    pub fn finish(&self, dispatch: u64, succeeded: bool) -> bool {
        let Some((_, in_flight)) = self.in_flight.remove(&dispatch) else {
            return false;
        };
        self.pending.fetch_sub(1, Ordering::SeqCst);
        if succeeded {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        in_flight.zombie
    }

    /// Flag deliveries running longer than `timeout`; returns the newly flagged ones
    pub fn mark_zombies(&self, timeout: Duration) -> Vec<(i64, Option<Uuid>)> {
        let now = Instant::now();
        let mut flagged = Vec::new();
        for mut entry in self.in_flight.iter_mut() {
            if !entry.zombie && now.duration_since(entry.started) >= timeout {
                entry.zombie = true;
                flagged.push((entry.tag, entry.transaction_uuid));
            }
        }
        self.zombies_total
            .fetch_add(flagged.len() as u64, Ordering::Relaxed);
        flagged
    }

    /// Zombies that have not completed yet
    pub fn outstanding_zombies(&self) -> usize {
        self.in_flight.iter().filter(|entry| entry.zombie).count()
    }

    /// Zombie count if it just crossed the threshold. Fires once per overflow
    /// episode; the latch re-arms when zombies fall back to the threshold.
    pub fn check_overflow(&self) -> Option<usize> {
        let zombies = self.outstanding_zombies();
        if zombies > self.zombie_threshold {
            if !self.restart_latched.swap(true, Ordering::SeqCst) {
                self.restart_signals.fetch_add(1, Ordering::SeqCst);
                return Some(zombies);
            }
        } else {
            self.restart_latched.store(false, Ordering::SeqCst);
        }
        None
    }

    pub fn restart_signals(&self) -> u64 {
        self.restart_signals.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            prefetch: self.prefetch,
            zombie_threshold: self.zombie_threshold,
            pending: self.pending(),
            zombies: self.outstanding_zombies(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            zombies_total: self.zombies_total.load(Ordering::Relaxed),
            restart_signals: self.restart_signals(),
        }
    }
}

pub struct BoundedQueueConsumer {
    config: ConsumerConfig,
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn MessageHandler>,
    state: Arc<ConsumerState>,
    permits: Arc<Semaphore>,
    digest: Arc<FailureDigest>,
    shutdown: ShutdownController,
}

impl BoundedQueueConsumer {
    #[must_use]
    pub fn new(
        config: ConsumerConfig,
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn MessageHandler>,
        digest: Arc<FailureDigest>,
        shutdown: ShutdownController,
    ) -> Self {
        let prefetch = config.prefetch.max(1);
        Self {
            state: Arc::new(ConsumerState::new(prefetch)),
            permits: Arc::new(Semaphore::new(prefetch)),
            config,
            source,
            handler,
            digest,
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<ConsumerState> {
        Arc::clone(&self.state)
    }

    /// Consume until shutdown, then wait for in-flight deliveries
    #[instrument(skip(self), fields(queue = %self.config.queue, prefetch = self.config.prefetch))]
    pub async fn run(&self) -> DrainOutcome {
        info!(
            zombie_threshold = self.state.zombie_threshold(),
            timeout = ?self.config.handler_timeout,
            "Starting queue consumer"
        );

        let watchdog = self.spawn_watchdog();
        let mut last_digest = Instant::now();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // The fetch itself is never cancelled so a claimed delivery is not dropped
            match self.source.next_delivery().await {
                Ok(Some(delivery)) => self.dispatch(delivery, permit),
                Ok(None) => {
                    drop(permit);
                    self.idle().await;
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Failed to fetch next delivery");
                    self.idle().await;
                }
            }

            if last_digest.elapsed() >= self.config.digest_interval {
                self.digest.report("consumer");
                last_digest = Instant::now();
            }
        }

        info!(pending = self.state.pending(), "Consumer draining");
        let outcome = self
            .shutdown
            .wait_for_drain(
                || self.state.pending(),
                self.config.drain_poll_interval,
                self.config.max_drain,
            )
            .await;
        watchdog.abort();
        self.digest.report("consumer");
        outcome
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
            _ = self.shutdown.triggered() => {}
        }
    }

    fn dispatch(&self, delivery: Delivery, permit: OwnedSemaphorePermit) {
        if self.state.copies_in_flight(delivery.tag) > 0 {
            warn!(tag = delivery.tag, "Delivery redelivered while a copy is still in flight");
        }
        let dispatch = self.state.begin(delivery.tag, delivery.transaction_uuid);
        debug!(
            tag = delivery.tag,
            dispatch,
            redelivered = delivery.redelivered,
            "Dispatching delivery"
        );

        let state = Arc::clone(&self.state);
        let source = Arc::clone(&self.source);
        let handler = Arc::clone(&self.handler);
        let digest = Arc::clone(&self.digest);

        tokio::spawn(async move {
            let _permit = permit;
            let tag = delivery.tag;

            let result = AssertUnwindSafe(handler.handle(&delivery))
                .catch_unwind()
                .await;
            let succeeded = match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!(
                        tag,
                        uuid = ?delivery.transaction_uuid,
                        error = %e,
                        "Message handler failed"
                    );
                    digest.record("message_handler", delivery.transaction_uuid, e.to_string());
                    false
                }
                Err(_) => {
                    error!(tag, uuid = ?delivery.transaction_uuid, "Message handler panicked");
                    digest.record("message_handler_panic", delivery.transaction_uuid, "panic");
                    false
                }
            };

            // Acked regardless of outcome so a poison message cannot loop
            if let Err(e) = source.ack(tag).await {
                error!(tag, error = %e, "Ack failed, delivery will be redelivered");
                digest.record("ack_failed", delivery.transaction_uuid, e.to_string());
            }

            if state.finish(dispatch, succeeded) {
                info!(tag, "Zombie delivery finally completed");
            }
        });
    }

    fn spawn_watchdog(&self) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let timeout = self.config.handler_timeout;
        let every = self.config.watchdog_interval;

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for (tag, uuid) in state.mark_zombies(timeout) {
                    warn!(
                        tag,
                        uuid = ?uuid,
                        timeout = ?timeout,
                        "Delivery exceeded handler timeout"
                    );
                }
                if let Some(zombies) = state.check_overflow() {
                    error!(
                        zombies,
                        threshold = state.zombie_threshold(),
                        "Zombie deliveries over threshold, restarting consumer"
                    );
                    shutdown.trigger(ShutdownReason::ZombieOverflow {
                        zombies,
                        threshold: state.zombie_threshold(),
                    });
                }
            }
        })
    }
}
