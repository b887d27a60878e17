//! Datums: single values held under a label tuple.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::json;

/// The kinds of metric a program can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Timer,
    Text,
    Histogram,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Timer => "timer",
            MetricKind::Text => "text",
            MetricKind::Histogram => "histogram",
        };
        f.write_str(s)
    }
}

/// Histogram state: per-range counts for upper-inclusive buckets plus an
/// implicit overflow bucket, with sum and total count.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketsData {
    /// Ascending upper bounds; range i is (bounds[i-1], bounds[i]].
    pub bounds: Vec<f64>,
    /// One count per bound, plus the trailing +Inf overflow count.
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl BucketsData {
    pub fn new(bounds: Vec<f64>) -> Self {
        let n = bounds.len() + 1;
        Self {
            bounds,
            counts: vec![0; n],
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, v: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|&b| v <= b)
            .unwrap_or(self.bounds.len());
        self.counts[idx] += 1;
        self.sum += v;
        self.count += 1;
    }
}

/// A datum's current value.
#[derive(Debug, Clone, PartialEq)]
pub enum DatumValue {
    Int(i64),
    Float(f64),
    Text(String),
    Buckets(BucketsData),
}

impl DatumValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DatumValue::Int(n) => json!(n),
            DatumValue::Float(x) => json!(x),
            DatumValue::Text(s) => json!(s),
            DatumValue::Buckets(b) => {
                let buckets: Vec<serde_json::Value> = b
                    .bounds
                    .iter()
                    .map(|bound| json!(bound))
                    .chain(std::iter::once(json!("+Inf")))
                    .zip(b.counts.iter())
                    .map(|(le, count)| json!({ "le": le, "count": count }))
                    .collect();
                json!({ "buckets": buckets, "sum": b.sum, "count": b.count })
            }
        }
    }
}

#[derive(Debug)]
struct DatumInner {
    value: DatumValue,
    time: DateTime<Utc>,
}

/// A single value with its last-modified time. Shared between the VM and
/// the store; all access goes through the internal lock.
#[derive(Debug)]
pub struct Datum {
    inner: Mutex<DatumInner>,
}

impl Datum {
    pub fn new(value: DatumValue, time: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(DatumInner { value, time }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DatumInner> {
        // A poisoned datum lock means a panic mid-update; propagating the
        // inner state is still coherent for plain values.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn value(&self) -> DatumValue {
        self.lock().value.clone()
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.lock().time
    }

    pub fn set_int(&self, v: i64, ts: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.value = DatumValue::Int(v);
        inner.time = ts;
    }

    /// Store a float; on a histogram datum this records an observation.
    pub fn set_float(&self, v: f64, ts: DateTime<Utc>) {
        let mut inner = self.lock();
        match &mut inner.value {
            DatumValue::Buckets(b) => b.observe(v),
            value => *value = DatumValue::Float(v),
        }
        inner.time = ts;
    }

    pub fn set_text(&self, v: String, ts: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.value = DatumValue::Text(v);
        inner.time = ts;
    }

    /// Add to an integer datum; `inc`/`dec` are deltas of ±1.
    pub fn add_int(&self, delta: i64, ts: DateTime<Utc>) {
        let mut inner = self.lock();
        if let DatumValue::Int(n) = &mut inner.value {
            *n = n.wrapping_add(delta);
        }
        inner.time = ts;
    }

    /// Add a float; on a histogram datum this records an observation.
    pub fn add_float(&self, delta: f64, ts: DateTime<Utc>) {
        let mut inner = self.lock();
        match &mut inner.value {
            DatumValue::Float(x) => *x += delta,
            DatumValue::Buckets(b) => b.observe(delta),
            _ => {}
        }
        inner.time = ts;
    }

    /// Record an observation into a histogram datum.
    pub fn observe(&self, v: f64, ts: DateTime<Utc>) {
        let mut inner = self.lock();
        if let DatumValue::Buckets(b) = &mut inner.value {
            b.observe(v);
        }
        inner.time = ts;
    }

    pub fn get_int(&self) -> i64 {
        match self.lock().value {
            DatumValue::Int(n) => n,
            DatumValue::Float(x) => x as i64,
            _ => 0,
        }
    }

    pub fn get_float(&self) -> f64 {
        match self.lock().value {
            DatumValue::Float(x) => x,
            DatumValue::Int(n) => n as f64,
            _ => 0.0,
        }
    }

    pub fn get_text(&self) -> String {
        match &self.lock().value {
            DatumValue::Text(s) => s.clone(),
            DatumValue::Int(n) => n.to_string(),
            DatumValue::Float(x) => x.to_string(),
            DatumValue::Buckets(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_upper_inclusive() {
        let mut b = BucketsData::new(vec![1.0, 10.0, 100.0]);
        for v in [5.0, 50.0, 500.0, 0.0] {
            b.observe(v);
        }
        // 0 → (−∞,1], 5 → (1,10], 50 → (10,100], 500 → +Inf.
        assert_eq!(b.counts, vec![1, 1, 1, 1]);
        assert_eq!(b.count, 4);
        assert_eq!(b.sum, 555.0);
        // Boundary values land in the bucket they bound.
        let mut edge = BucketsData::new(vec![1.0, 10.0]);
        edge.observe(1.0);
        edge.observe(10.0);
        assert_eq!(edge.counts, vec![1, 1, 0]);
    }

    #[test]
    fn test_datum_add_and_time() {
        let t0 = Utc::now();
        let d = Datum::new(DatumValue::Int(0), t0);
        let t1 = t0 + chrono::Duration::seconds(5);
        d.add_int(1, t1);
        d.add_int(1, t1);
        assert_eq!(d.get_int(), 2);
        assert_eq!(d.time(), t1);
    }
}
