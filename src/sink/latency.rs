//! Per-sink dispatch latency histograms.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use tracing::info;

/// Values stored in microseconds, 1us to 100s, 3 significant figures.
#[derive(Default)]
pub struct DispatchLatency {
    inner: Mutex<BTreeMap<String, Histogram<u64>>>,
}

impl DispatchLatency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sink: &str, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        let Ok(mut map) = self.inner.lock() else { return };
        if !map.contains_key(sink) {
            let Ok(h) = Histogram::new_with_bounds(1, 100_000_000, 3) else { return };
            map.insert(sink.to_string(), h);
        }
        if let Some(h) = map.get_mut(sink) {
            h.saturating_record(us.max(1));
        }
    }

    /// (p50_us, p95_us, p99_us). None if no samples.
    pub fn percentiles(&self, sink: &str) -> Option<(u64, u64, u64)> {
        let map = self.inner.lock().ok()?;
        let h = map.get(sink).filter(|h| h.len() > 0)?;
        Some((h.value_at_quantile(0.5), h.value_at_quantile(0.95), h.value_at_quantile(0.99)))
    }

    pub fn len(&self, sink: &str) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|m| m.get(sink).map(|h| h.len()))
            .unwrap_or(0)
    }

    pub fn log_summary(&self) {
        let Ok(map) = self.inner.lock() else { return };
        for (sink, h) in map.iter().filter(|(_, h)| h.len() > 0) {
            info!(
                sink = %sink,
                samples = h.len(),
                p50_us = h.value_at_quantile(0.5),
                p95_us = h.value_at_quantile(0.95),
                p99_us = h.value_at_quantile(0.99),
                max_us = h.max(),
                "[SINK] dispatch latency"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_per_sink() {
        let lat = DispatchLatency::new();
        assert!(lat.percentiles("redis").is_none());
        for ms in 1..=100 {
            lat.record("redis", Duration::from_millis(ms));
        }
        lat.record("stdout", Duration::ZERO);

        assert_eq!(lat.len("redis"), 100);
        assert_eq!(lat.len("stdout"), 1);
        let (p50, p95, p99) = lat.percentiles("redis").unwrap();
        assert!(p50 <= p95 && p95 <= p99);
        assert!((49_000..=51_000).contains(&p50), "p50 was {p50}");
    }
}
