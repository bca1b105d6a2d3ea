//! Signal-driven shutdown shared by the observer and the queue consumer.
//!
//! Either an OS signal or the consumer's own zombie watchdog can trigger the
//! controller. The first trigger wins; later ones are ignored so a process
//! drains exactly once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// What started the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal(&'static str),
    /// Too many deliveries outlived the handler timeout
    ZombieOverflow { zombies: usize, threshold: usize },
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {}", name),
            Self::ZombieOverflow { zombies, threshold } => {
                write!(f, "{} zombie deliveries exceed threshold {}", zombies, threshold)
            }
        }
    }
}

/// Result of waiting for in-flight work after shutdown was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut { remaining: usize },
}

#[derive(Clone)]
pub struct ShutdownController {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Start shutting down. Returns `false` if shutdown was already under way.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            info!(reason = %reason, "Shutdown triggered");
            *current = Some(reason.clone());
            accepted = true;
            true
        });
        accepted
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.tx.subscribe()
    }

    /// Resolves once shutdown has been triggered
    pub async fn triggered(&self) -> ShutdownReason {
        let mut rx = self.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            // The sender lives in `self`, so the channel cannot close here
            if rx.changed().await.is_err() {
                return ShutdownReason::Signal("channel closed");
            }
        }
    }

    /// Trigger on SIGINT or SIGTERM
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!(error = %e, "Failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            let reason = tokio::select! {
                _ = ctrl_c => ShutdownReason::Signal("SIGINT"),
                _ = terminate => ShutdownReason::Signal("SIGTERM"),
                // Triggered internally first; nothing left to listen for
                _ = controller.triggered() => return,
            };
            controller.trigger(reason);
        })
    }

    /// Poll `pending` until it reaches zero or `max_wait` elapses
    pub async fn wait_for_drain<F>(
        &self,
        pending: F,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> DrainOutcome
    where
        F: Fn() -> usize,
    {
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = pending();
            if remaining == 0 {
                info!("All in-flight work drained");
                return DrainOutcome::Drained;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "Drain deadline reached with work still in flight");
                return DrainOutcome::TimedOut { remaining };
            }
            info!(remaining, "Waiting for in-flight work to finish");
            tokio::time::sleep(poll_interval).await;
        }
    }
}
