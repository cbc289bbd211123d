//! Rolling throughput sampling and network quality classification.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

/// Samples the monitor keeps however old they are, so a link that completes one large
/// chunk per window still gets classified.
const MONITOR_MIN_SAMPLES: usize = 3;

/// 速度计算器: sliding window of `(timestamp, bytes)` samples.
///
/// Samples older than the window are dropped, except that the newest `min_samples`
/// always stay.
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    history: VecDeque<(Instant, u64)>,
    window_size: Duration,
    min_samples: usize,
    max_entries: usize,
}

impl SpeedCalculator {
    pub fn new(window_size: Duration) -> Self {
        Self::with_min_samples(window_size, 1)
    }

    pub fn with_min_samples(window_size: Duration, min_samples: usize) -> Self {
        Self {
            history: VecDeque::new(),
            window_size,
            min_samples: min_samples.max(1),
            max_entries: 100,
        }
    }

    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    pub fn add_sample_at(&mut self, bytes: u64, now: Instant) {
        self.history.push_back((now, bytes));

        // 移除过期的数据点
        while let Some(&(time, _)) = self.history.front() {
            if self.history.len() > self.min_samples && now.duration_since(time) > self.window_size {
                self.history.pop_front();
            } else {
                break;
            }
        }

        while self.history.len() > self.max_entries {
            self.history.pop_front();
        }
    }

    /// Average bytes/second over the samples in the window; 0.0 with fewer than two.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return 0.0;
        };
        if self.history.len() < 2 {
            return 0.0;
        }

        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }

        // The first sample only marks the start of the window.
        let bytes: u64 = self.history.iter().skip(1).map(|(_, bytes)| bytes).sum();
        bytes as f64 / elapsed
    }

    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
        } else {
            None
        }
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Unknown,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct QualityThresholds {
    /// Sustained throughput at or above this is `Good` (bytes/s).
    pub good_above: f64,
    /// Sustained throughput below this is `Poor` (bytes/s).
    pub poor_below: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            good_above: 1024.0 * 1024.0,
            poor_below: 256.0 * 1024.0,
        }
    }
}

/// Classifies recent conditions from the same samples used for ETA.
///
/// Purely advisory: the scheduler may shrink its concurrency under `Poor`.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    speed: SpeedCalculator,
    thresholds: QualityThresholds,
}

impl NetworkMonitor {
    pub fn new(window_size: Duration, thresholds: QualityThresholds) -> Self {
        Self {
            speed: SpeedCalculator::with_min_samples(window_size, MONITOR_MIN_SAMPLES),
            thresholds,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.speed.add_sample(bytes);
    }

    pub fn record_at(&mut self, bytes: u64, now: Instant) {
        self.speed.add_sample_at(bytes, now);
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.speed.bytes_per_second()
    }

    pub fn quality(&self) -> NetworkQuality {
        if self.speed.sample_count() < 2 {
            return NetworkQuality::Unknown;
        }

        let speed = self.speed.bytes_per_second();
        if speed >= self.thresholds.good_above {
            NetworkQuality::Good
        } else if speed < self.thresholds.poor_below {
            NetworkQuality::Poor
        } else {
            NetworkQuality::Fair
        }
    }

    /// Forgets every sample; an idle gap must not read as a slow link.
    pub fn reset(&mut self) {
        self.speed.reset();
    }

    /// Concurrency hint for the configured value; never exceeds it and never drops below 1.
    pub fn recommended_concurrency(&self, configured: usize) -> usize {
        match self.quality() {
            NetworkQuality::Poor => (configured / 2).max(1),
            _ => configured.max(1),
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), QualityThresholds::default())
    }
}
