//! Bootstrap scheduler: turns seed candidates into lease requests.
//!
//! At most `max_attempts` requests go out per cycle. Leftover candidates
//! stay queued for the next cycle; the queue is refilled from the seeding
//! source only once it runs dry. Nothing is attempted at capacity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::lease::LeaseProtocol;
use crate::registry::ConnectionRegistry;
use crate::seeding::{SeedCandidate, SeedingSource};

pub struct BootstrapScheduler {
    registry: Arc<ConnectionRegistry>,
    seeding: Arc<dyn SeedingSource>,
    lease: Arc<LeaseProtocol>,
    queue: Mutex<VecDeque<SeedCandidate>>,
    max_attempts: usize,
    stopped: AtomicBool,
}

impl BootstrapScheduler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        seeding: Arc<dyn SeedingSource>,
        lease: Arc<LeaseProtocol>,
        max_attempts: usize,
    ) -> Self {
        Self {
            registry,
            seeding,
            lease,
            queue: Mutex::new(VecDeque::new()),
            max_attempts,
            stopped: AtomicBool::new(false),
        }
    }

    /// One bootstrap step. Returns the number of lease requests sent
    /// successfully.
    pub async fn run_cycle(&self) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }
        if !self.registry.has_capacity() {
            self.lock_queue().clear();
            return 0;
        }

        if self.lock_queue().is_empty() {
            let fresh = self.seeding.active_seed_routes().await;
            if fresh.is_empty() {
                tracing::debug!("no seed candidates");
                return 0;
            }
            tracing::debug!(candidates = fresh.len(), "refilled bootstrap queue");
            self.lock_queue().extend(fresh);
        }

        let batch = self.next_batch();
        let mut sent = 0;
        for candidate in &batch {
            match self.lease.request_seed(candidate).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(seed = %candidate.address, error = %e, "seed attempt failed"),
            }
        }
        if !batch.is_empty() {
            tracing::debug!(attempted = batch.len(), sent, remaining = self.queued(), "bootstrap cycle");
        }
        sent
    }

    /// Put `candidate` at the head of the queue so the next cycle tries it
    /// first.
    pub fn enqueue_front(&self, candidate: SeedCandidate) {
        let mut queue = self.lock_queue();
        queue.retain(|c| c.destination() != candidate.destination());
        queue.push_front(candidate);
    }

    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.lock_queue().clear();
    }

    /// Pop up to `max_attempts` candidates, skipping peers we already hold a
    /// lease with. Lock order: queue, then registry.
    fn next_batch(&self) -> Vec<SeedCandidate> {
        let mut queue = self.lock_queue();
        let mut batch = Vec::with_capacity(self.max_attempts);
        while batch.len() < self.max_attempts {
            let Some(candidate) = queue.pop_front() else {
                break;
            };
            if let Some(id) = candidate.peer_id {
                if self.registry.contains(&id) {
                    continue;
                }
            }
            batch.push(candidate);
        }
        batch
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<SeedCandidate>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
