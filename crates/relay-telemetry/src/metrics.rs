use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Can go up or down.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }
    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of every recorded metric.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

/// Thread-safe metrics recorder.
///
/// Metrics are created on first use. Recording takes a read lock on the
/// fast path; the write lock is only taken to insert a new name.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, n: u64) {
        if let Some(counter) = self.counters.read().get(name) {
            counter.increment(n);
            return;
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.set(value);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .set(value);
    }

    pub fn add_gauge(&self, name: &str, delta: i64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.add(delta);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .add(delta);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).map_or(0, Counter::get)
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.read().get(name).map_or(0, Gauge::get)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.get()))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.get()))
                .collect(),
        }
    }
}
