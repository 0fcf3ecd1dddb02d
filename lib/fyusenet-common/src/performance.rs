use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Accumulated wall-clock timing for a single layer across however many forward calls have run
/// since the last reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceSample {
    pub calls: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

impl PerformanceSample {
    fn record(&mut self, dt: Duration) {
        self.calls += 1;
        self.total += dt;
        self.min = Some(self.min.map_or(dt, |m| m.min(dt)));
        self.max = Some(self.max.map_or(dt, |m| m.max(dt)));
    }

    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls as u32
        }
    }
}

/// Per-layer timing table, gated by the engine's `timings_enabled` config flag.
///
/// Kept as a wholly separate, cheaply-clonable unit from the engine so that `execute` can take
/// the timing lock briefly on each layer dispatch without contending with the much hotter
/// async-state lock.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    enabled: std::sync::atomic::AtomicBool,
    samples: Mutex<HashMap<i32, PerformanceSample>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Time `f` and, if enabled, record the elapsed duration under `layer_number`.
    pub fn time_layer<T>(&self, layer_number: i32, f: impl FnOnce() -> T) -> T {
        if !self.is_enabled() {
            return f();
        }
        let start = Instant::now();
        let result = f();
        let dt = start.elapsed();
        self.samples.lock().entry(layer_number).or_default().record(dt);
        result
    }

    pub fn sample(&self, layer_number: i32) -> Option<PerformanceSample> {
        self.samples.lock().get(&layer_number).copied()
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn disabled_tracker_does_not_record() {
        let tracker = PerformanceTracker::new();
        tracker.time_layer(0, || sleep(Duration::from_millis(1)));
        assert!(tracker.sample(0).is_none());
    }

    #[test]
    fn enabled_tracker_accumulates() {
        let tracker = PerformanceTracker::new();
        tracker.set_enabled(true);
        tracker.time_layer(2, || ());
        tracker.time_layer(2, || ());
        let sample = tracker.sample(2).unwrap();
        assert_eq!(sample.calls, 2);
    }

    #[test]
    fn reset_clears_samples() {
        let tracker = PerformanceTracker::new();
        tracker.set_enabled(true);
        tracker.time_layer(1, || ());
        tracker.reset();
        assert!(tracker.sample(1).is_none());
    }
}
