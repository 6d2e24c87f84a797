//! ReaperLoop - Lease 期限切れの回収
//!
//! # フロー
//! 1. TaskStore::expired_leases() で期限切れ（claimed / running）を取得
//! 2. 不在の holder に代わって failure を合成（"lease expired"）
//! 3. Decider が requeue / failed を決める（worker 自身の release と同じ規則）
//! 4. reap_dead_workers が有効なら、死んだ worker の lease も期限前に回収
//!
//! Reaper と worker の release は同じ行を取り合うが、どちらも条件付き更新なので
//! 勝つのは一方だけ。負けた側は `conflicts` に数える。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Engine;
use crate::domain::{QueueError, Task, TaskId, TaskStatus};
use crate::ports::TaskStore;
use crate::queue::{LeaseManager, WorkerRegistry};

pub use crate::queue::LEASE_EXPIRED;
pub const WORKER_DEAD: &str = "worker dead";

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Back to `pending`.
    pub requeued: usize,
    /// Permanently `failed` (attempts exhausted).
    pub failed: usize,
    /// Lost to a concurrent release or renewal; nothing written.
    pub conflicts: usize,
}

impl ReapReport {
    pub fn reclaimed(&self) -> usize {
        self.requeued + self.failed
    }

    fn record(&mut self, outcome: Option<Task>) {
        match outcome {
            Some(task) if task.status == TaskStatus::Failed => self.failed += 1,
            Some(_) => self.requeued += 1,
            None => self.conflicts += 1,
        }
    }
}

pub struct Reaper {
    tasks: Arc<dyn TaskStore>,
    registry: Arc<WorkerRegistry>,
    leases: Arc<LeaseManager>,
    batch: usize,
    reap_dead_workers: bool,
}

impl Reaper {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        registry: Arc<WorkerRegistry>,
        leases: Arc<LeaseManager>,
        batch: usize,
        reap_dead_workers: bool,
    ) -> Self {
        Self {
            tasks,
            registry,
            leases,
            batch,
            reap_dead_workers,
        }
    }

    /// One pass at `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<ReapReport, QueueError> {
        let mut report = ReapReport::default();
        let mut seen: HashSet<TaskId> = HashSet::new();

        for task in self.tasks.expired_leases(now, self.batch).await? {
            seen.insert(task.id);
            report.record(self.leases.revoke(&task, LEASE_EXPIRED, now).await?);
        }

        if self.reap_dead_workers {
            let dead: HashSet<_> = self.registry.dead_workers(now).await?.into_iter().collect();
            if !dead.is_empty() {
                for task in self.tasks.leases_held().await? {
                    let orphaned = task.lease_holder.as_ref().is_some_and(|h| dead.contains(h));
                    if orphaned && seen.insert(task.id) {
                        report.record(self.leases.revoke(&task, WORKER_DEAD, now).await?);
                    }
                }
            }
        }

        if report != ReapReport::default() {
            tracing::info!(
                requeued = report.requeued,
                failed = report.failed,
                conflicts = report.conflicts,
                "reaper sweep"
            );
        }
        Ok(report)
    }
}

/// Periodic reaper task.
pub struct ReaperLoop;

impl ReaperLoop {
    /// Sweep every `interval` until the handle is shut down. Store failures
    /// are logged and the next tick tries again.
    pub fn spawn(engine: Arc<Engine>, interval: Duration) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reaper = engine.reaper();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // sender gone: the handle was dropped
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = reaper.sweep_once(engine.now()).await {
                    tracing::warn!(error = %e, "reaper sweep failed");
                }
            }
            tracing::debug!("reaper stopped");
        });

        ReaperHandle { shutdown_tx, join }
    }
}

pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}
