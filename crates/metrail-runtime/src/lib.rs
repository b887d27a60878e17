//! Execution layer for metrail: the per-program VM, the loader that owns
//! VMs and dispatches log lines, and the polling file tailer.

mod line;
mod loader;
mod tailer;
mod vm;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use metrail_compiler::{MetricType, Program};
use metrail_dsl::ast::VarKind;
use metrail_metrics::{DatumType, Metric, MetricKind, Store};

pub use line::LogLine;
pub use loader::{compile_dir, Loader};
pub use tailer::Tailer;
pub use vm::Vm;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] metrail_metrics::StoreError),
}

fn metric_kind(kind: VarKind) -> MetricKind {
    match kind {
        VarKind::Counter => MetricKind::Counter,
        VarKind::Gauge => MetricKind::Gauge,
        VarKind::Timer => MetricKind::Timer,
        VarKind::Text => MetricKind::Text,
        VarKind::Histogram => MetricKind::Histogram,
    }
}

fn datum_type(vt: MetricType) -> DatumType {
    match vt {
        MetricType::Int => DatumType::Int,
        MetricType::Float => DatumType::Float,
        MetricType::Text => DatumType::Text,
        MetricType::Buckets => DatumType::Buckets,
    }
}

/// Build store metrics for a compiled program's declarations, in metric
/// table order so VM operands index them directly.
pub fn instantiate_metrics(program: &Program, source: &str) -> Vec<Arc<Metric>> {
    program
        .metrics
        .iter()
        .map(|mi| {
            Arc::new(
                Metric::new(
                    mi.name.clone(),
                    program.name.clone(),
                    source,
                    metric_kind(mi.kind),
                    datum_type(mi.value_type),
                    mi.keys.clone(),
                    mi.hidden,
                    mi.buckets.clone(),
                )
                .with_exported_name(mi.exported.clone()),
            )
        })
        .collect()
}

/// Periodic metric-store expiry sweep, until shutdown. An interval of
/// zero disables it.
pub fn spawn_store_gc(
    store: Arc<Store>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if every.is_zero() {
            info!("metric store expiry disabled");
            return;
        }
        info!(every = ?every, "metric store expiry loop started");
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    store.gc();
                }
            }
        }
    })
}
