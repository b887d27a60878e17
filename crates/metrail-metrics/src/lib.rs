//! In-process metric store for metrail.
//!
//! Programs mutate [`Metric`] datums through the VM; an exporter reads
//! the whole [`Store`] as JSON. Reload reconciliation and label-value
//! expiry follow the contract the loader depends on.

mod datum;
mod metric;
mod store;

pub use datum::{BucketsData, Datum, DatumValue, MetricKind};
pub use metric::{DatumType, LabelValue, Metric};
pub use store::{Result, Store, StoreError};
