use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Source of server time for cache timestamps.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, millis: Timestamp) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) -> Timestamp {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Next cache timestamp for an object whose last one was `previous`. Strictly increasing.
pub fn next_cache_timestamp(clock: &dyn Clock, previous: Timestamp) -> Timestamp {
    clock.now_millis().max(previous.saturating_add(1))
}
