//! The program loader.
//!
//! Owns one VM per compiled program file, fans log lines out to them
//! over a broadcast channel, and re-scans the program directory on an
//! interval. A program whose recompile fails keeps running its previous
//! build; the failure is logged and counted. Lagging VMs lose the
//! oldest lines, never block the tailer, and count what they dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use metrail_compiler::{compile, Diagnostic, Program};
use metrail_metrics::{Datum, DatumType, Metric, MetricKind, Store};

use crate::line::LogLine;
use crate::vm::Vm;
use crate::{instantiate_metrics, Result};

/// File extensions the loader treats as programs.
const PROGRAM_EXTENSIONS: &[&str] = &["mtl", "mtail"];

/// Loader-owned telemetry, exported through the store as hidden metrics.
struct InternalMetrics {
    loads: Arc<Metric>,
    load_errors: Arc<Metric>,
    runtime_errors: Arc<Metric>,
    lines_dropped: Arc<Metric>,
}

impl InternalMetrics {
    fn register(store: &Store) -> metrail_metrics::Result<Self> {
        let counter = |name: &str| {
            Arc::new(Metric::new(
                name,
                "metrail",
                "<internal>",
                MetricKind::Counter,
                DatumType::Int,
                vec!["prog".to_string()],
                true,
                vec![],
            ))
        };
        let loads = counter("prog_loads_total");
        let load_errors = counter("prog_load_errors_total");
        let runtime_errors = counter("prog_runtime_errors_total");
        let lines_dropped = counter("lines_dropped_total");
        for m in [&loads, &load_errors, &runtime_errors, &lines_dropped] {
            store.add(Arc::clone(m))?;
        }
        Ok(Self {
            loads,
            load_errors,
            runtime_errors,
            lines_dropped,
        })
    }
}

struct ProgramHandle {
    program: Arc<Program>,
    mtime: SystemTime,
    shutdown: watch::Sender<bool>,
}

/// Compiles programs, owns their VM tasks and dispatches log lines.
pub struct Loader {
    store: Arc<Store>,
    lines: broadcast::Sender<Arc<LogLine>>,
    shutdown: watch::Receiver<bool>,
    programs: HashMap<PathBuf, ProgramHandle>,
    stop_tx: mpsc::Sender<PathBuf>,
    stop_rx: mpsc::Receiver<PathBuf>,
    internal: InternalMetrics,
}

impl Loader {
    pub fn new(
        store: Arc<Store>,
        lines: broadcast::Sender<Arc<LogLine>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let internal = InternalMetrics::register(&store)?;
        let (stop_tx, stop_rx) = mpsc::channel(8);
        Ok(Self {
            store,
            lines,
            shutdown,
            programs: HashMap::new(),
            stop_tx,
            stop_rx,
            internal,
        })
    }

    /// Compile and start every program in `dir`. Returns how many loaded.
    pub async fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for path in program_files(dir).await? {
            if self.load_file(&path).await? {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Drive reloads and unload requests until shutdown.
    pub async fn run(mut self, dir: PathBuf, poll: Duration) {
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(path) = self.stop_rx.recv() => self.unload(&path),
                _ = interval.tick() => {
                    if let Err(err) = self.scan(&dir).await {
                        warn!(dir = %dir.display(), "program scan failed: {}", err);
                    }
                }
            }
        }
        for (_, handle) in self.programs.drain() {
            let _ = handle.shutdown.send(true);
        }
        info!("loader stopped");
    }

    /// Reload changed programs; unload removed ones.
    async fn scan(&mut self, dir: &Path) -> Result<()> {
        let present = program_files(dir).await?;
        for path in &present {
            let mtime = modified(path).await?;
            match self.programs.get(path) {
                Some(handle) if handle.mtime >= mtime => {}
                _ => {
                    self.load_file(path).await?;
                }
            }
        }
        let gone: Vec<PathBuf> = self
            .programs
            .keys()
            .filter(|p| !present.contains(p))
            .cloned()
            .collect();
        for path in gone {
            self.unload(&path);
        }
        Ok(())
    }

    /// Compile one program file and swap its VM in. A compile failure
    /// keeps the previous program running.
    pub async fn load_file(&mut self, path: &Path) -> Result<bool> {
        let source_text = tokio::fs::read_to_string(path).await?;
        let mtime = modified(path).await?;
        let name = program_name(path);
        let now = Utc::now();

        let program = match compile(&name, &source_text) {
            Ok(program) => Arc::new(program),
            Err(diags) => {
                for d in &diags {
                    error!(program = %name, "{}: {}", path.display(), d);
                }
                self.internal
                    .load_errors
                    .datum(&[name.clone()], now)
                    .add_int(1, now);
                return Ok(false);
            }
        };

        let source_key = path.display().to_string();
        let metrics = instantiate_metrics(&program, &source_key);
        for m in &metrics {
            if let Err(err) = self.store.add(Arc::clone(m)) {
                error!(program = %name, "{}: {}", path.display(), err);
                self.internal
                    .load_errors
                    .datum(&[name.clone()], now)
                    .add_int(1, now);
                return Ok(false);
            }
        }

        let error_counter = self.internal.runtime_errors.datum(&[name.clone()], now);
        let dropped = self.internal.lines_dropped.datum(&[name.clone()], now);
        let vm = Vm::new(Arc::clone(&program), metrics, Some(error_counter));

        // Swap: stop the outgoing VM, then subscribe the new one so it
        // only sees lines from here on.
        if let Some(old) = self.programs.remove(path) {
            let _ = old.shutdown.send(true);
        }
        let (vm_shutdown_tx, vm_shutdown_rx) = watch::channel(false);
        let rx = self.lines.subscribe();
        tokio::spawn(run_vm(
            vm,
            rx,
            vm_shutdown_rx,
            self.stop_tx.clone(),
            dropped,
            path.to_path_buf(),
        ));

        self.programs.insert(
            path.to_path_buf(),
            ProgramHandle {
                program: Arc::clone(&program),
                mtime,
                shutdown: vm_shutdown_tx,
            },
        );
        self.internal
            .loads
            .datum(&[name.clone()], now)
            .add_int(1, now);
        info!(
            program = %name,
            instructions = program.instrs.len(),
            metrics = program.metrics.len(),
            "program loaded"
        );
        Ok(true)
    }

    fn unload(&mut self, path: &Path) {
        if let Some(handle) = self.programs.remove(path) {
            let _ = handle.shutdown.send(true);
            info!(program = %handle.program.name, "program unloaded");
        }
    }

    /// Programs currently loaded, by source path.
    pub fn loaded(&self) -> Vec<PathBuf> {
        self.programs.keys().cloned().collect()
    }
}

/// One VM's line-consumption loop.
async fn run_vm(
    mut vm: Vm,
    mut rx: broadcast::Receiver<Arc<LogLine>>,
    mut shutdown: watch::Receiver<bool>,
    stop_tx: mpsc::Sender<PathBuf>,
    dropped: Arc<Datum>,
    path: PathBuf,
) {
    let name = vm.program().name.clone();
    loop {
        // Shutdown wins over pending lines; a replaced VM must not race
        // its successor for the next line.
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            line = rx.recv() => match line {
                Ok(line) => {
                    vm.process_line(&line);
                    if vm.terminated() {
                        info!(program = %name, "program executed stop");
                        let _ = stop_tx.send(path.clone()).await;
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    dropped.add_int(n as i64, Utc::now());
                    warn!(program = %name, dropped = n, "lagging, dropped oldest lines");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!(program = %name, "vm exited");
}

/// Compile every program in `dir` without loading; used by
/// `--compile-only`. Returns per-file diagnostics for the failures.
pub async fn compile_dir(dir: &Path) -> Result<Vec<(PathBuf, Vec<Diagnostic>)>> {
    let mut failures = Vec::new();
    for path in program_files(dir).await? {
        let source_text = tokio::fs::read_to_string(&path).await?;
        if let Err(diags) = compile(&program_name(&path), &source_text) {
            failures.push((path, diags));
        }
    }
    Ok(failures)
}

fn program_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn program_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_program = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PROGRAM_EXTENSIONS.contains(&e));
        if is_program {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn modified(path: &Path) -> Result<SystemTime> {
    Ok(tokio::fs::metadata(path).await?.modified()?)
}
