//! Engine configuration.
//!
//! Durations (de)serialize as integer milliseconds so a config file reads
//! `"default_lease": 30000`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::BuildError;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lease granted on claim, and the default renewal extension.
    #[serde(with = "millis")]
    pub default_lease: Duration,

    /// Attempts before a task is permanently failed (per-task override allowed).
    pub max_attempts: u32,

    /// Candidates a single scheduling request tries before giving up.
    pub scan_depth: usize,

    /// A worker is dead once its last heartbeat is older than this.
    #[serde(with = "millis")]
    pub worker_liveness: Duration,

    #[serde(with = "millis")]
    pub reaper_interval: Duration,

    /// Expired leases handled per sweep.
    pub reaper_batch: usize,

    /// Long-poll recheck tick.
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    #[serde(with = "millis")]
    pub max_poll_timeout: Duration,

    pub retry: RetryPolicy,

    /// Also reclaim leases held by dead workers before the lease runs out.
    pub reap_dead_workers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(30),
            max_attempts: 3,
            scan_depth: 16,
            worker_liveness: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(5),
            reaper_batch: 100,
            poll_interval: Duration::from_millis(250),
            max_poll_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            reap_dead_workers: true,
        }
    }
}

impl EngineConfig {
    /// Fail fast on values the engine cannot run with.
    pub fn validate(&self) -> Result<(), BuildError> {
        let invalid = |field: &'static str, reason: &'static str| {
            Err(BuildError::InvalidConfig { field, reason })
        };

        for (field, value) in [
            ("default_lease", self.default_lease),
            ("worker_liveness", self.worker_liveness),
            ("reaper_interval", self.reaper_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return invalid(field, "must be non-zero");
            }
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts", "must be at least 1");
        }
        if self.scan_depth == 0 {
            return invalid("scan_depth", "must be at least 1");
        }
        if self.reaper_batch == 0 {
            return invalid("reaper_batch", "must be at least 1");
        }
        if let RetryPolicy::Exponential { multiplier, .. } = self.retry
            && !(multiplier.is_finite() && multiplier >= 1.0)
        {
            return invalid("retry.multiplier", "must be finite and at least 1.0");
        }
        Ok(())
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
