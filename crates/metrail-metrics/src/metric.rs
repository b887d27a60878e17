//! Metrics: named, typed, labelled collections of datums.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::json;

use crate::datum::{BucketsData, Datum, DatumValue, MetricKind};

/// Storage type of a metric's datums. Part of the reload-reconciliation
/// identity: a gauge that changes from Int to Float is a new metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatumType {
    Int,
    Float,
    Text,
    Buckets,
}

/// One datum under its label tuple, with an optional expiry set by
/// `del … after`.
#[derive(Debug, Clone)]
pub struct LabelValue {
    pub datum: Arc<Datum>,
    pub expiry: Option<Duration>,
}

/// A named, typed, labelled metric. Label values sit behind the metric's
/// own lock so the VM's updates never hold the store-level lock.
#[derive(Debug)]
pub struct Metric {
    pub name: String,
    pub exported_name: Option<String>,
    pub program: String,
    /// Source file the owning program was loaded from.
    pub source: String,
    pub kind: MetricKind,
    pub value_type: DatumType,
    pub keys: Vec<String>,
    pub hidden: bool,
    pub buckets: Vec<f64>,
    label_values: Mutex<IndexMap<Vec<String>, LabelValue>>,
}

impl Metric {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        source: impl Into<String>,
        kind: MetricKind,
        value_type: DatumType,
        keys: Vec<String>,
        hidden: bool,
        buckets: Vec<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            exported_name: None,
            program: program.into(),
            source: source.into(),
            kind,
            value_type,
            keys,
            hidden,
            buckets,
            label_values: Mutex::new(IndexMap::new()),
        }
    }

    pub fn with_exported_name(mut self, exported: Option<String>) -> Self {
        self.exported_name = exported;
        self
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<Vec<String>, LabelValue>> {
        match self.label_values.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn zero(&self) -> DatumValue {
        match self.value_type {
            DatumType::Int => DatumValue::Int(0),
            DatumType::Float => DatumValue::Float(0.0),
            DatumType::Text => DatumValue::Text(String::new()),
            DatumType::Buckets => DatumValue::Buckets(BucketsData::new(self.buckets.clone())),
        }
    }

    /// Datum under `labels`, created zero-valued on first touch.
    pub fn datum(&self, labels: &[String], ts: DateTime<Utc>) -> Arc<Datum> {
        let mut lvs = self.lock();
        if let Some(lv) = lvs.get(labels) {
            return Arc::clone(&lv.datum);
        }
        let datum = Arc::new(Datum::new(self.zero(), ts));
        lvs.insert(
            labels.to_vec(),
            LabelValue {
                datum: Arc::clone(&datum),
                expiry: None,
            },
        );
        datum
    }

    /// Datum under `labels`, if present.
    pub fn get_datum(&self, labels: &[String]) -> Option<Arc<Datum>> {
        self.lock().get(labels).map(|lv| Arc::clone(&lv.datum))
    }

    /// Remove the datum under `labels` now. Reports whether it existed.
    pub fn remove_datum(&self, labels: &[String]) -> bool {
        self.lock().shift_remove(labels).is_some()
    }

    /// Mark the datum under `labels` for removal once it has been idle
    /// for `expiry`.
    pub fn set_expiry(&self, labels: &[String], expiry: Duration) {
        if let Some(lv) = self.lock().get_mut(labels) {
            lv.expiry = Some(expiry);
        }
    }

    /// Snapshot of the current label values.
    pub fn label_values(&self) -> Vec<(Vec<String>, LabelValue)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove expired label values; returns how many went.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let mut lvs = self.lock();
        let before = lvs.len();
        lvs.retain(|_, lv| match lv.expiry {
            Some(expiry) => {
                let age = now.signed_duration_since(lv.datum.time());
                age.to_std().map(|age| age <= expiry).unwrap_or(true)
            }
            None => true,
        });
        before - lvs.len()
    }

    /// Adopt compatible label values from a predecessor metric.
    pub fn carry_over(&self, old: &Metric) {
        let mut lvs = self.lock();
        for (labels, lv) in old.lock().iter() {
            lvs.entry(labels.clone()).or_insert_with(|| lv.clone());
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let label_values: Vec<serde_json::Value> = self
            .lock()
            .iter()
            .map(|(labels, lv)| {
                json!({
                    "labels": labels,
                    "value": lv.datum.value().to_json(),
                    "time": lv.datum.time().to_rfc3339(),
                })
            })
            .collect();
        json!({
            "name": self.exported_name.as_ref().unwrap_or(&self.name),
            "program": self.program,
            "kind": self.kind,
            "keys": self.keys,
            "label_values": label_values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(name: &str, keys: Vec<String>) -> Metric {
        Metric::new(
            name,
            "prog",
            "prog.mtl",
            MetricKind::Counter,
            DatumType::Int,
            keys,
            false,
            vec![],
        )
    }

    #[test]
    fn test_datum_created_on_first_touch() {
        let m = counter("c", vec!["host".into()]);
        let ts = Utc::now();
        let d = m.datum(&["a".to_string()], ts);
        d.add_int(3, ts);
        assert_eq!(m.datum(&["a".to_string()], ts).get_int(), 3);
        assert_eq!(m.datum(&["b".to_string()], ts).get_int(), 0);
    }

    #[test]
    fn test_expire_removes_only_idle_marked() {
        let m = counter("c", vec!["id".into()]);
        let t0 = Utc::now();
        m.datum(&["old".to_string()], t0);
        m.datum(&["keep".to_string()], t0);
        m.set_expiry(&["old".to_string()], Duration::from_secs(300));

        // Not yet idle long enough.
        assert_eq!(m.expire(t0 + chrono::Duration::seconds(200)), 0);
        // Past the expiry; only the marked one goes.
        assert_eq!(m.expire(t0 + chrono::Duration::seconds(301)), 1);
        assert!(m.get_datum(&["old".to_string()]).is_none());
        assert!(m.get_datum(&["keep".to_string()]).is_some());
    }

    #[test]
    fn test_carry_over() {
        let old = counter("c", vec!["k".into()]);
        let ts = Utc::now();
        old.datum(&["x".to_string()], ts).add_int(7, ts);
        let new = counter("c", vec!["k".into()]);
        new.carry_over(&old);
        assert_eq!(new.datum(&["x".to_string()], ts).get_int(), 7);
    }
}
