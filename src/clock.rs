//! Injectable time source.
//!
//! Every component that needs "now" takes a `Arc<dyn Clock>` instead of
//! calling `SystemTime::now()` directly, so reconnect backoff, heartbeat
//! timeouts, and cache TTLs can be driven deterministically from tests
//! without sleeping or monkey-patching a runtime clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time is before UNIX_EPOCH")
            .as_millis() as i64
    }
}

/// A settable clock for tests: starts at an arbitrary instant and only
/// advances when the test tells it to.
#[derive(Debug, Default)]
pub struct TestClock {
    millis: AtomicI64,
}

impl TestClock {
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self { millis: AtomicI64::new(start_ms) })
    }

    pub fn advance(&self, delta_ms: i64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.millis.store(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
