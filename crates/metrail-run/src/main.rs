//! metrail - extracts whitebox metrics from application logs.
//!
//! Loads every program in the program directory, tails the given log
//! files, and feeds each appended line to every program's VM. Metrics
//! accumulate in the in-process store; `--dump-metrics` prints the
//! store as JSON on shutdown for an external collector to consume.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrail_metrics::Store;
use metrail_runtime::{compile_dir, spawn_store_gc, Loader, Tailer};

#[derive(Parser, Debug)]
#[command(name = "metrail")]
#[command(about = "Extract whitebox metrics from application logs")]
struct Cli {
    /// Directory containing metric programs (.mtl)
    #[arg(long)]
    progs: PathBuf,

    /// Log file to tail; repeat for several files
    #[arg(long = "logs")]
    logs: Vec<PathBuf>,

    /// How often to poll log files and the program directory
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    poll_interval: Duration,

    /// How often to sweep expired metric labels (0 disables)
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    gc_interval: Duration,

    /// Only compile the programs, reporting errors, then exit
    #[arg(long)]
    compile_only: bool,

    /// Print the metric store as JSON on shutdown
    #[arg(long)]
    dump_metrics: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num.parse().map_err(|_| format!("invalid duration {:?}", s))?;
    let scale = match unit {
        "ms" => 1e-3,
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(format!("unknown duration unit {:?}", unit)),
    };
    Ok(Duration::from_secs_f64(value * scale))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metrail=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if cli.compile_only {
        match compile_dir(&cli.progs).await {
            Ok(failures) if failures.is_empty() => {
                info!("all programs compiled");
                return;
            }
            Ok(failures) => {
                for (path, diags) in failures {
                    for d in diags {
                        error!("{}: {}", path.display(), d);
                    }
                }
                std::process::exit(2);
            }
            Err(err) => {
                error!("couldn't read programs: {}", err);
                std::process::exit(1);
            }
        }
    }

    let store = Arc::new(Store::new());
    let (lines_tx, _) = tokio::sync::broadcast::channel(1024);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut loader = match Loader::new(Arc::clone(&store), lines_tx.clone(), shutdown_rx.clone()) {
        Ok(loader) => loader,
        Err(err) => {
            error!("loader setup failed: {}", err);
            std::process::exit(1);
        }
    };
    match loader.load_dir(&cli.progs).await {
        Ok(count) => info!(programs = count, "initial load complete"),
        Err(err) => {
            error!("couldn't load programs from {}: {}", cli.progs.display(), err);
            std::process::exit(1);
        }
    }

    let gc_task = spawn_store_gc(Arc::clone(&store), cli.gc_interval, shutdown_rx.clone());
    let tailer = Tailer::new(cli.logs.clone(), lines_tx.clone());
    let tailer_task = tokio::spawn(tailer.run(cli.poll_interval, shutdown_rx.clone()));
    let loader_task = tokio::spawn(loader.run(cli.progs.clone(), cli.poll_interval));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("couldn't listen for shutdown: {}", err);
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(loader_task, tailer_task, gc_task);

    if cli.dump_metrics {
        println!("{}", store.to_json());
    }
}
