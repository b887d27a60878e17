//! The metric store: a concurrent mapping from metric name to metric
//! instances, with reload reconciliation and expiry.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::metric::Metric;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metric {name} has kind {adding}, existing registration has kind {existing}")]
    KindMismatch {
        name: String,
        existing: String,
        adding: String,
    },
    #[error("no metric named {0}")]
    NoSuchMetric(String),
    #[error("no datum with labels {labels:?} in metric {name}")]
    NoSuchLabels { name: String, labels: Vec<String> },
}

/// Store of metrics. Exported readers share the read lock; any mutation
/// of the metric set takes the write lock. Datum updates go through the
/// metric's own lock and never block the store.
#[derive(Debug, Default)]
pub struct Store {
    metrics: RwLock<IndexMap<String, Vec<Arc<Metric>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<String, Vec<Arc<Metric>>>> {
        match self.metrics.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexMap<String, Vec<Arc<Metric>>>> {
        match self.metrics.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a metric, reconciling with predecessors.
    ///
    /// All instances under a name must share a kind. When the new metric
    /// matches an existing one's program, type and source it replaces
    /// it, carrying label values over when the key lists are identical
    /// and discarding them otherwise.
    pub fn add(&self, m: Arc<Metric>) -> Result<()> {
        let mut metrics = self.write();
        let list = metrics.entry(m.name.clone()).or_default();

        if let Some(first) = list.first() {
            if first.kind != m.kind {
                return Err(StoreError::KindMismatch {
                    name: m.name.clone(),
                    existing: first.kind.to_string(),
                    adding: m.kind.to_string(),
                });
            }
        }

        let dupe = list.iter().position(|old| {
            old.program == m.program && old.value_type == m.value_type && old.source == m.source
        });
        if let Some(idx) = dupe {
            let old = &list[idx];
            if old.keys == m.keys {
                debug!(metric = %m.name, program = %m.program, "carrying over label values");
                m.carry_over(old);
            } else {
                debug!(metric = %m.name, program = %m.program, "key list changed, discarding old data");
            }
            list.remove(idx);
        }
        list.push(m);
        Ok(())
    }

    /// All metric instances registered under `name`.
    pub fn get(&self, name: &str) -> Vec<Arc<Metric>> {
        self.read()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove one labelled datum from every instance of `name`.
    pub fn remove(&self, name: &str, labels: &[String]) -> Result<()> {
        let metrics = self.read();
        let list = metrics
            .get(name)
            .ok_or_else(|| StoreError::NoSuchMetric(name.to_string()))?;
        let mut removed = false;
        for m in list {
            removed |= m.remove_datum(labels);
        }
        if removed {
            Ok(())
        } else {
            Err(StoreError::NoSuchLabels {
                name: name.to_string(),
                labels: labels.to_vec(),
            })
        }
    }

    /// Drop every metric owned by `program` and loaded from `source`.
    pub fn remove_program(&self, program: &str, source: &str) {
        let mut metrics = self.write();
        for list in metrics.values_mut() {
            list.retain(|m| !(m.program == program && m.source == source));
        }
        metrics.retain(|_, list| !list.is_empty());
    }

    /// Sweep expired label values out of every metric. Returns how many
    /// datums were removed.
    pub fn gc(&self) -> usize {
        let now = Utc::now();
        let metrics = self.read();
        let mut removed = 0;
        for list in metrics.values() {
            for m in list {
                removed += m.expire(now);
            }
        }
        if removed > 0 {
            info!(removed, "metric store gc");
        }
        removed
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Serialise every non-hidden metric. Export order is insensitive.
    pub fn to_json(&self) -> serde_json::Value {
        let metrics = self.read();
        let all: Vec<serde_json::Value> = metrics
            .values()
            .flatten()
            .filter(|m| !m.hidden)
            .map(|m| m.to_json())
            .collect();
        json!(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::MetricKind;
    use crate::metric::DatumType;

    fn metric(name: &str, program: &str, kind: MetricKind, keys: Vec<String>) -> Arc<Metric> {
        Arc::new(Metric::new(
            name,
            program,
            format!("{}.mtl", program),
            kind,
            DatumType::Int,
            keys,
            false,
            vec![],
        ))
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let store = Store::new();
        store
            .add(metric("m", "a", MetricKind::Counter, vec![]))
            .unwrap();
        let err = store
            .add(metric("m", "b", MetricKind::Gauge, vec![]))
            .unwrap_err();
        assert!(matches!(err, StoreError::KindMismatch { .. }));
    }

    #[test]
    fn test_reload_carries_values_when_keys_match() {
        let store = Store::new();
        let old = metric("m", "p", MetricKind::Counter, vec!["k".into()]);
        store.add(Arc::clone(&old)).unwrap();
        let ts = Utc::now();
        old.datum(&["x".to_string()], ts).add_int(5, ts);

        let new = metric("m", "p", MetricKind::Counter, vec!["k".into()]);
        store.add(Arc::clone(&new)).unwrap();

        assert_eq!(store.get("m").len(), 1);
        assert_eq!(new.datum(&["x".to_string()], ts).get_int(), 5);
    }

    #[test]
    fn test_reload_discards_values_when_keys_differ() {
        let store = Store::new();
        let old = metric("m", "p", MetricKind::Counter, vec!["k".into()]);
        store.add(Arc::clone(&old)).unwrap();
        let ts = Utc::now();
        old.datum(&["x".to_string()], ts).add_int(5, ts);

        let new = metric("m", "p", MetricKind::Counter, vec!["j".into(), "k".into()]);
        store.add(Arc::clone(&new)).unwrap();

        assert_eq!(store.get("m").len(), 1);
        assert!(new.get_datum(&["x".to_string()]).is_none());
    }

    #[test]
    fn test_same_name_different_programs_coexist() {
        let store = Store::new();
        store
            .add(metric("m", "a", MetricKind::Counter, vec![]))
            .unwrap();
        store
            .add(metric("m", "b", MetricKind::Counter, vec![]))
            .unwrap();
        assert_eq!(store.get("m").len(), 2);
    }

    #[test]
    fn test_gc_removes_expired() {
        let store = Store::new();
        let m = metric("m", "p", MetricKind::Gauge, vec!["id".into()]);
        store.add(Arc::clone(&m)).unwrap();
        let past = Utc::now() - chrono::Duration::seconds(600);
        m.datum(&["gone".to_string()], past);
        m.set_expiry(&["gone".to_string()], std::time::Duration::from_secs(300));
        m.datum(&["stays".to_string()], past);

        assert_eq!(store.gc(), 1);
        assert!(m.get_datum(&["gone".to_string()]).is_none());
        assert!(m.get_datum(&["stays".to_string()]).is_some());
    }

    #[test]
    fn test_json_skips_hidden() {
        let store = Store::new();
        store
            .add(metric("visible", "p", MetricKind::Counter, vec![]))
            .unwrap();
        store
            .add(Arc::new(Metric::new(
                "internal",
                "p",
                "p.mtl",
                MetricKind::Counter,
                DatumType::Int,
                vec![],
                true,
                vec![],
            )))
            .unwrap();
        let v = store.to_json();
        let names: Vec<&str> = v
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["visible"]);
    }

    #[test]
    fn test_remove_program() {
        let store = Store::new();
        store
            .add(metric("m", "a", MetricKind::Counter, vec![]))
            .unwrap();
        store
            .add(metric("n", "a", MetricKind::Counter, vec![]))
            .unwrap();
        store
            .add(metric("m", "b", MetricKind::Counter, vec![]))
            .unwrap();
        store.remove_program("a", "a.mtl");
        assert_eq!(store.get("m").len(), 1);
        assert!(store.get("n").is_empty());
    }
}
