use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use colo_probe::config::{ProbeConfig, ProbeMode, DEFAULT_TRACE_HOST};
use colo_probe::location::{self, LocationMap};
use colo_probe::progress::SharedProgress;
use colo_probe::server::{self, AppState};
use colo_probe::types::ProbeOutcome;
use colo_probe::{filter, targets, Scheduler};

/// colo-probe — concurrent edge endpoint latency prober.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "colo-probe",
    version,
    about = "Probe edge IPs for reachability and latency, and report which data center answers.",
    long_about = None
)]
struct Cli {
    /// Comma separated IPs, ip:port pairs or IPv4 CIDRs, or a path to a file of them.
    #[arg(long)]
    targets: String,

    /// Port for targets that do not name one.
    #[arg(long, default_value_t = 443)]
    port: u16,

    /// JSON file with data-center locations (array of {iata, region, cca2, city}).
    #[arg(long)]
    locations: Option<PathBuf>,

    /// Max concurrent probes.
    #[arg(long, default_value_t = 200)]
    concurrency: usize,

    /// Stop dispatching once this many endpoints are accepted (0 = no limit).
    #[arg(long = "max-accepted", default_value_t = 0)]
    max_accepted: u64,

    /// Only time the TCP connect; skip the trace fetch.
    #[arg(long = "tcp-only", default_value_t = false)]
    tcp_only: bool,

    /// Fetch the trace over TLS.
    #[arg(long, default_value_t = false)]
    tls: bool,

    /// Require a successful WebSocket upgrade on a second connection.
    #[arg(long, default_value_t = false)]
    upgrade: bool,

    /// Only accept these data-center codes, e.g. LAX,SJC.
    #[arg(long)]
    colos: Option<String>,

    /// Host header and TLS server name for trace requests.
    #[arg(long = "trace-host", default_value = DEFAULT_TRACE_HOST)]
    trace_host: String,

    /// Connect timeout in milliseconds.
    #[arg(long = "connect-timeout-ms", default_value_t = 1000)]
    connect_timeout_ms: u64,

    /// Request/response timeout in milliseconds.
    #[arg(long = "request-timeout-ms", default_value_t = 2000)]
    request_timeout_ms: u64,

    /// Write accepted results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve a read-only status API on this address, e.g. 127.0.0.1:8080.
    #[arg(long = "serve-status")]
    serve_status: Option<String>,

    /// Do not print the progress line.
    #[arg(long = "no-progress", default_value_t = false)]
    no_progress: bool,

    /// Log per-endpoint errors.
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

impl Cli {
    fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            max_parallel: self.concurrency,
            max_accepted: self.max_accepted,
            mode: if self.tcp_only { ProbeMode::RawConnect } else { ProbeMode::TraceFetch },
            tls: self.tls,
            validate_upgrade: self.upgrade,
            verbose: self.verbose,
            trace_host: self.trace_host.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            allowed_colos: self.colos.as_deref().and_then(filter::parse_colo_list),
            show_progress: !self.no_progress,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();

    let config = cli.probe_config();
    if cli.tcp_only && (cli.upgrade || cli.colos.is_some()) {
        warn!("--tcp-only yields no data-center codes; --upgrade is ignored and --colos drops everything");
    }

    let endpoints = targets::load_targets(&cli.targets, cli.port)?;
    if endpoints.is_empty() {
        bail!("no targets to probe");
    }
    let locations: LocationMap = match cli.locations.as_deref() {
        Some(path) => location::load_locations_from_path(path)?,
        None => LocationMap::new(),
    };

    println!("colo-probe configuration:");
    println!("  endpoints    : {}", endpoints.len());
    println!("  concurrency  : {}", config.max_parallel);
    println!("  max_accepted : {}", config.max_accepted);
    println!("  mode         : {:?}", config.mode);
    println!("  tls          : {}", config.tls);
    println!("  upgrade      : {}", config.validate_upgrade);
    println!("  locations    : {}", locations.len());

    let scheduler = Scheduler::new(config, Arc::new(locations))?;
    let progress = SharedProgress::new();
    let cancel = CancellationToken::new();

    // Ctrl-C stops further dispatch; in-flight probes still finish.
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let app = AppState::new(progress.clone());
    if let Some(bind) = cli.serve_status.clone() {
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, app).await {
                eprintln!("status server error: {e}");
            }
        });
    }
    app.mark_running().await;

    let run = scheduler.run_with_shared(endpoints, cancel, progress).await;
    let mut results = run.collect().await;
    results.sort_by_key(|o| o.latency);
    app.finish(results.clone()).await;

    print_results_table(&results);
    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_results_json(path, &results) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            info!("wrote JSON results to {}", path.display());
        }
    }

    if cli.serve_status.is_some() {
        println!("Press Ctrl+C to stop the status server...");
        let _ = tokio::signal::ctrl_c().await;
    }

    Ok(())
}

fn print_results_table(results: &[ProbeOutcome]) {
    let mut addr_w = "endpoint".len();
    let mut city_w = "city".len();
    for o in results {
        addr_w = addr_w.max(o.endpoint.to_string().len());
        city_w = city_w.max(o.city.as_deref().unwrap_or("").len());
    }

    println!("\nAccepted endpoints: {}", results.len());
    println!(
        "{:<addr_w$}  {:<4}  {:<7}  {:<city_w$}  {:>10}",
        "endpoint", "colo", "country", "city", "latency_ms",
    );
    println!(
        "{:-<addr_w$}  {:-<4}  {:-<7}  {:-<city_w$}  {:->10}",
        "", "", "", "", "",
    );
    for o in results {
        println!(
            "{:<addr_w$}  {:<4}  {:<7}  {:<city_w$}  {:>10}",
            o.endpoint.to_string(),
            o.data_center.as_deref().unwrap_or("-"),
            o.country_code.as_deref().unwrap_or("-"),
            o.city.as_deref().unwrap_or(""),
            o.latency_ms(),
        );
    }
}

fn write_results_json(path: &Path, results: &[ProbeOutcome]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}
