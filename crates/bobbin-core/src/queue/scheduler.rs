//! Scheduler / dispatcher: picks the next eligible task for a polling worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::{LEASE_EXPIRED, LeaseManager, WorkerRegistry};
use crate::domain::{Capabilities, QueueError, Task, WorkerId};
use crate::ports::{Clock, TaskStore};

/// Knobs for a [`Dispatcher`].
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub lease: Duration,
    /// Candidates tried per request before giving up under contention.
    pub scan_depth: usize,
    pub poll_interval: Duration,
    pub max_poll_timeout: Duration,
}

pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    registry: Arc<WorkerRegistry>,
    leases: Arc<LeaseManager>,
    clock: Arc<dyn Clock>,
    availability: Arc<Notify>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        registry: Arc<WorkerRegistry>,
        leases: Arc<LeaseManager>,
        clock: Arc<dyn Clock>,
        availability: Arc<Notify>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            tasks,
            registry,
            leases,
            clock,
            availability,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// One scheduling attempt. `Ok(None)` is `NoWorkAvailable`.
    ///
    /// A worker that still holds a live lease gets that task back. A lease
    /// that ran out is revoked on the spot, as the reaper would, and the
    /// request falls through to the scan. The first `scan_depth` eligible
    /// candidates are tried in queue order; a lost race moves on to the next
    /// candidate instead of failing the request.
    pub async fn request_work(&self, worker: &WorkerId, capabilities: &Capabilities) -> Result<Option<Task>, QueueError> {
        self.registry.heartbeat(worker).await?;

        let now = self.clock.now();
        if let Some(held) = self.tasks.held_by(worker).await? {
            if !held.lease_expired(now) {
                tracing::debug!(task_id = %held.id, worker_id = %worker, "redelivering held task");
                return Ok(Some(held));
            }
            // Ok(None): the reaper or a late release got there first
            self.leases.revoke(&held, LEASE_EXPIRED, now).await?;
        }

        let candidates = self
            .tasks
            .pending_candidates(now, capabilities, self.settings.scan_depth)
            .await?;

        for candidate in &candidates {
            match self.leases.claim_observed(candidate, worker, self.settings.lease).await {
                Ok(task) => return Ok(Some(task)),
                Err(e) if e.is_contention() => {
                    tracing::debug!(task_id = %candidate.id, worker_id = %worker, error = %e, "skipping candidate");
                }
                Err(e) => return Err(e),
            }
        }

        if !candidates.is_empty() {
            tracing::debug!(
                worker_id = %worker,
                scanned = candidates.len(),
                "scan exhausted without a claim"
            );
        }
        Ok(None)
    }

    /// Long-poll: retry [`request_work`](Self::request_work) until a task is
    /// claimed or `timeout` (capped at `max_poll_timeout`) elapses.
    ///
    /// Wakes on availability notifications (new or requeued tasks) and every
    /// `poll_interval` for work that becomes eligible without one, such as an
    /// expired retry backoff or a task written by another process.
    pub async fn poll(
        &self,
        worker: &WorkerId,
        capabilities: &Capabilities,
        timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + timeout.min(self.settings.max_poll_timeout);

        loop {
            // register interest before scanning so a notify between the scan and
            // the wait is not lost
            let notified = self.availability.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.request_work(worker, capabilities).await? {
                return Ok(Some(task));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = self.settings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
