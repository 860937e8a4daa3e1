//! Engine observability: prefixed counters and gauges plus coarse duration
//! histograms. The engine counts commits, commit failures, verify vetoes,
//! delivered notifications, provider waits and timeouts and dispatcher
//! volume, and records how long commits and verifier round-trips take.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Upper bucket bounds for duration histograms, in milliseconds. The ladder
/// is shaped by the engine's timeout policy: lock retries and file writes at
/// the bottom, the operational-data wait and verify deadline in the middle,
/// the long-request deadline at the top. Anything slower lands in the
/// overflow bucket.
const DURATION_BOUNDS_MS: [u64; 12] = [
    1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 15_000,
];

pub type SharedMetrics = Arc<Mutex<MetricsRegistry>>;

#[derive(Debug)]
pub struct MetricsRegistry {
    prefix: String,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, u64>,
    durations: BTreeMap<String, DurationHistogram>,
}

impl MetricsRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
            durations: BTreeMap::new(),
        }
    }

    pub fn shared(prefix: impl Into<String>) -> SharedMetrics {
        Arc::new(Mutex::new(Self::new(prefix)))
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    /// Bump a counter by `delta`, returning the new value.
    pub fn add(&mut self, name: &str, delta: u64) -> u64 {
        let key = self.key(name);
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(delta);
        *counter
    }

    pub fn gauge(&mut self, name: &str, value: u64) {
        let key = self.key(name);
        self.gauges.insert(key, value);
    }

    /// Record one elapsed duration under `name`. Histograms come into
    /// existence on first observation; there is no registration step.
    pub fn observe(&mut self, name: &str, elapsed: Duration) {
        let key = self.key(name);
        self.durations
            .entry(key)
            .or_insert_with(DurationHistogram::new)
            .record(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
            durations: self
                .durations
                .iter()
                .map(|(name, histogram)| (name.clone(), histogram.snapshot()))
                .collect(),
        }
    }
}

/// Latency distribution over the fixed millisecond ladder, plus the sample
/// count and millisecond sum for rough averages.
#[derive(Debug, Clone)]
pub struct DurationHistogram {
    counts: Vec<u64>,
    samples: u64,
    total_ms: u64,
}

impl DurationHistogram {
    fn new() -> Self {
        Self {
            counts: vec![0; DURATION_BOUNDS_MS.len() + 1],
            samples: 0,
            total_ms: 0,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
        let bucket = DURATION_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(DURATION_BOUNDS_MS.len());
        self.counts[bucket] = self.counts[bucket].saturating_add(1);
        self.samples = self.samples.saturating_add(1);
        self.total_ms = self.total_ms.saturating_add(ms);
    }

    fn snapshot(&self) -> DurationSnapshot {
        DurationSnapshot {
            bounds_ms: DURATION_BOUNDS_MS.to_vec(),
            counts: self.counts.clone(),
            samples: self.samples,
            total_ms: self.total_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DurationSnapshot {
    /// Upper bound of each bucket; `counts` has one extra overflow slot.
    pub bounds_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub samples: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
    pub durations: BTreeMap<String, DurationSnapshot>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn duration(&self, name: &str) -> Option<&DurationSnapshot> {
        self.durations.get(name)
    }
}
