//! Status - キューの集計ビュー（GET /queue/status）

use serde::{Deserialize, Serialize};

use crate::ports::StatusCounts;

/// Task counts per status plus worker liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub counts: StatusCounts,
    pub total: u64,
    pub workers_alive: u64,
    pub workers_dead: u64,
}

impl QueueStatus {
    pub fn new(counts: StatusCounts, workers_alive: u64, workers_dead: u64) -> Self {
        Self {
            counts,
            total: counts.total(),
            workers_alive,
            workers_dead,
        }
    }

    /// Nothing pending or leased.
    pub fn is_drained(&self) -> bool {
        self.counts.pending == 0 && self.counts.claimed == 0 && self.counts.running == 0
    }
}
