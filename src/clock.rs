//! Wall-clock port. Everything that reads time goes through [`Clock`] so tests
//! can drive windows and cooldowns deterministically.

/// Source of "now" in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    fn name(&self) -> &str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn name(&self) -> &str {
        "system"
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::Clock;

    /// Virtual clock advanced explicitly by tests.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        now: AtomicI64,
    }

    impl ManualClock {
        pub fn new(start_ms: i64) -> Self {
            Self { now: AtomicI64::new(start_ms) }
        }

        pub fn set(&self, ms: i64) {
            self.now.store(ms, Ordering::SeqCst);
        }

        pub fn advance(&self, ms: i64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }

        fn name(&self) -> &str {
            "manual"
        }
    }
}
