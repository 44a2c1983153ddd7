//! Download speed measurement.
//!
//! Bytes are accumulated into fixed time buckets; only buckets inside a
//! short sliding window count. The window keeps the figure responsive to
//! stalls without jittering on every chunk.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Width of one accumulation bucket.
const BUCKET: Duration = Duration::from_millis(100);

/// Buckets older than this are dropped.
const WINDOW: Duration = Duration::from_millis(1500);

/// Minimum elapsed span used in the rate division.
const MIN_SPAN_MS: u64 = 50;

struct Bucket {
    start: Instant,
    bytes: u64,
}

/// Sliding-bucket speed meter.
pub struct SpeedMeter {
    buckets: VecDeque<Bucket>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            buckets: VecDeque::new(),
        }
    }

    /// Records `bytes` arriving at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.prune(now);
        match self.buckets.back_mut() {
            Some(bucket) if now.duration_since(bucket.start) < BUCKET => {
                bucket.bytes += bytes;
            }
            _ => {
                self.buckets.push_back(Bucket { start: now, bytes });
            }
        }
    }

    /// Current rate in bytes per second as observed at `now`.
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.prune(now);
        let Some(oldest) = self.buckets.front() else {
            return 0;
        };
        let total: u64 = self.buckets.iter().map(|b| b.bytes).sum();
        let span_ms = now.duration_since(oldest.start).as_millis() as u64;
        1000 * total / span_ms.max(MIN_SPAN_MS)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(bucket) = self.buckets.front() {
            if now.duration_since(bucket.start) > WINDOW {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}
