//! Monitor loop: the single periodic task behind lease upkeep.
//!
//! Each cycle: wait for routing, expire or renew every connection, forget
//! stale lease requests, then run one bootstrap step. The next cycle is
//! armed only after the current one returns, so cycles never overlap.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use edgelink_core::config::RendezvousConfig;

use crate::bootstrap::BootstrapScheduler;
use crate::lease::LeaseProtocol;
use crate::registry::ConnectionRegistry;
use crate::transport::Transport;

/// Counters for one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub renewals: usize,
    pub expired: usize,
    pub pruned: usize,
    pub attempts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Monitor was stopped; nothing done.
    Skipped,
    /// Routing not up yet; retry after the startup delay.
    NotReady,
    Completed(CycleReport),
}

pub struct MonitorLoop {
    registry: Arc<ConnectionRegistry>,
    lease: Arc<LeaseProtocol>,
    bootstrap: Arc<BootstrapScheduler>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    startup_retry: Duration,
    pending_timeout: Duration,
    kick_delay: Duration,
    kick: Notify,
    stopped: AtomicBool,
}

impl MonitorLoop {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        lease: Arc<LeaseProtocol>,
        bootstrap: Arc<BootstrapScheduler>,
        transport: Arc<dyn Transport>,
        config: &RendezvousConfig,
    ) -> Self {
        Self {
            registry,
            lease,
            bootstrap,
            transport,
            interval: config.monitor_interval(),
            startup_retry: config.startup_retry(),
            pending_timeout: config.pending_request_timeout(),
            kick_delay: config.seed_kick_delay(),
            kick: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Run one cycle now.
    pub async fn run_once(&self) -> CycleOutcome {
        if self.stopped.load(Ordering::Acquire) {
            return CycleOutcome::Skipped;
        }
        if !self.transport.routing_ready() {
            tracing::debug!(retry_ms = self.startup_retry.as_millis() as u64, "routing not ready");
            return CycleOutcome::NotReady;
        }

        let mut report = CycleReport::default();
        let now = Instant::now();

        // Work on the snapshot; no registry lock is held across sends.
        for conn in self.registry.snapshot() {
            if !conn.is_connected() || conn.is_expired(now) {
                if self.lease.expire(&conn, now) {
                    report.expired += 1;
                }
            } else if conn.needs_renewal(now) {
                match self.lease.renew(&conn).await {
                    Ok(()) => report.renewals += 1,
                    Err(e) => {
                        tracing::warn!(peer = conn.peer_id().short(), error = %e, "renewal send failed")
                    }
                }
            }
        }

        report.pruned = self.lease.prune_pending(self.pending_timeout);
        if report.pruned > 0 {
            tracing::debug!(pruned = report.pruned, "dropped unanswered lease requests");
        }

        // Also at capacity: that is where the scheduler drops stale candidates.
        report.attempts = self.bootstrap.run_cycle().await;

        CycleOutcome::Completed(report)
    }

    /// Drive cycles until `shutdown` fires or `stop()` is called. The first
    /// cycle runs immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "rendezvous monitor started");
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = self.kick.notified() => {
                    let kicked = Instant::now() + self.kick_delay;
                    if kicked < deadline {
                        deadline = kicked;
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let delay = match AssertUnwindSafe(self.run_once()).catch_unwind().await {
                Ok(CycleOutcome::Skipped) => break,
                Ok(CycleOutcome::NotReady) => self.startup_retry,
                Ok(CycleOutcome::Completed(report)) => {
                    tracing::trace!(?report, "monitor cycle");
                    self.interval
                }
                Err(_) => {
                    tracing::error!("monitor cycle panicked, rescheduling");
                    self.interval
                }
            };
            deadline = Instant::now() + delay;
        }

        tracing::info!("rendezvous monitor shutting down");
    }

    /// Re-arm the next cycle to fire within the seed kick delay.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Cycles that have not started yet become no-ops.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
