use std::collections::VecDeque;

/// Rolling notional accumulator. Entries older than the window are evicted
/// lazily when the window is read, so bursts of any density are exact.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window_ms: i64,
    entries: VecDeque<(i64, f64)>,
    total: f64,
}

impl SlidingWindow {
    pub fn new(window_ms: i64) -> Self {
        Self { window_ms, entries: VecDeque::new(), total: 0.0 }
    }

    pub fn push(&mut self, ts_ms: i64, notional: f64) {
        self.entries.push_back((ts_ms, notional));
        self.total += notional;
    }

    /// Sum over `(now - window, now]`.
    pub fn total(&mut self, now_ms: i64) -> f64 {
        self.evict(now_ms);
        // Drift from repeated add/subtract never goes below zero.
        self.total.max(0.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while let Some(&(ts, notional)) = self.entries.front() {
            if ts > cutoff {
                break;
            }
            self.entries.pop_front();
            self.total -= notional;
        }
        if self.entries.is_empty() {
            self.total = 0.0;
        }
    }
}

/// Price samples over a trailing window; the oldest surviving sample is the
/// reference a move is measured from.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    window_ms: i64,
    samples: VecDeque<(i64, f64)>,
}

impl PriceHistory {
    pub fn new(window_ms: i64) -> Self {
        Self { window_ms, samples: VecDeque::new() }
    }

    pub fn push(&mut self, ts_ms: i64, price: f64) {
        self.samples.push_back((ts_ms, price));
    }

    /// Oldest price within `[now - window, now]`, after evicting older samples.
    pub fn reference(&mut self, now_ms: i64) -> Option<(i64, f64)> {
        let cutoff = now_ms - self.window_ms;
        while self.samples.front().is_some_and(|&(ts, _)| ts < cutoff) {
            self.samples.pop_front();
        }
        self.samples.front().copied()
    }

    /// Restarts the history at one sample, so the next move is measured from here.
    pub fn rebase(&mut self, ts_ms: i64, price: f64) {
        self.samples.clear();
        self.samples.push_back((ts_ms, price));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
