//! Clock port - 時刻の抽象化
//!
//! Lease expiry, liveness and backoff all read time through this trait so
//! tests can drive them with a [`FixedClock`] instead of sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Clock は現在時刻を提供
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall clock (本番用).
///
/// Truncated to milliseconds, the precision stores persist, so a task read
/// back equals the one that was written.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        from_millis(Utc::now().timestamp_millis())
    }
}

/// Manually driven clock (テスト用).
///
/// Clones share the same instant, so a test can hand one clone to the engine
/// and advance the other.
#[derive(Debug, Clone)]
pub struct FixedClock {
    millis: Arc<AtomicI64>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(at.timestamp_millis())),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(span(by).num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        from_millis(self.millis.load(Ordering::SeqCst))
    }
}

// Upper bound for configured spans; keeps timestamp arithmetic far from overflow.
const MAX_SPAN_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Convert a configured duration into a timestamp offset.
pub fn span(d: Duration) -> chrono::Duration {
    let ms = d.as_millis().min(MAX_SPAN_MS as u128) as i64;
    chrono::Duration::milliseconds(ms)
}

/// Epoch milliseconds back to a timestamp (stores persist millis).
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
