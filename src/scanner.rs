use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::filter;
use crate::location::LocationMap;
use crate::progress::{ProgressReporter, SharedProgress};
use crate::prober::Prober;
use crate::types::{Endpoint, ProbeOutcome, ProgressSnapshot};

/// Upper bound on concurrent probes regardless of configuration.
pub const MAX_PARALLEL: usize = 5_000;

/// What a finished run hands back.
///
/// `results` is already closed: it yields every accepted outcome in
/// completion order and then `None`.
#[derive(Debug)]
pub struct ProbeRun {
    pub results: mpsc::Receiver<ProbeOutcome>,
    pub progress: ProgressSnapshot,
    pub stopped_early: bool,
}

impl ProbeRun {
    /// Drain the closed result channel into a vector.
    pub async fn collect(mut self) -> Vec<ProbeOutcome> {
        let mut out = Vec::with_capacity(self.progress.accepted as usize);
        while let Some(o) = self.results.recv().await {
            out.push(o);
        }
        out
    }
}

/// Probe the endpoints with a one-off scheduler.
pub async fn probe_endpoints(
    endpoints: Vec<Endpoint>,
    config: ProbeConfig,
    locations: Arc<LocationMap>,
) -> Result<ProbeRun> {
    let scheduler = Scheduler::new(config, locations)?;
    Ok(scheduler.run(endpoints).await)
}

/// Bounded-parallel dispatcher of endpoint probes.
pub struct Scheduler {
    prober: Arc<Prober>,
    filter: Option<Arc<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(config: ProbeConfig, locations: Arc<LocationMap>) -> Result<Self> {
        config.validate()?;
        let filter = config.allowed_colos.clone().map(Arc::new);
        let prober = Arc::new(Prober::new(config, locations)?);
        Ok(Self { prober, filter })
    }

    pub fn config(&self) -> &ProbeConfig {
        self.prober.config()
    }

    pub async fn run(&self, endpoints: Vec<Endpoint>) -> ProbeRun {
        self.run_internal(endpoints, CancellationToken::new(), SharedProgress::new())
            .await
    }

    /// Variant for callers that observe the counters while the run is going
    /// (status server) or want to stop further dispatch (Ctrl-C).
    pub async fn run_with_shared(
        &self,
        endpoints: Vec<Endpoint>,
        cancel: CancellationToken,
        shared: SharedProgress,
    ) -> ProbeRun {
        self.run_internal(endpoints, cancel, shared).await
    }

    async fn run_internal(
        &self,
        endpoints: Vec<Endpoint>,
        cancel: CancellationToken,
        shared: SharedProgress,
    ) -> ProbeRun {
        let config = self.prober.config();
        let limit = config.accepted_limit();
        let verbose = config.verbose;

        shared.reset(endpoints.len() as u64);
        // Each endpoint sends at most once, so sends never wait.
        let (tx, rx) = mpsc::channel(endpoints.len().max(1));
        let sem = Arc::new(Semaphore::new(config.max_parallel.clamp(1, MAX_PARALLEL)));
        let mut set = JoinSet::new();
        let reporter = config
            .show_progress
            .then(|| ProgressReporter::start(shared.clone()));
        let mut stopped_early = false;

        for endpoint in endpoints {
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            if cancel.is_cancelled() {
                break;
            }
            if shared.limit_reached(limit) {
                stopped_early = true;
                break;
            }

            let prober = self.prober.clone();
            let filter = self.filter.clone();
            let shared = shared.clone();
            let tx = tx.clone();
            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                // Counts the attempt even if the probe unwinds.
                let mut attempt = shared.attempt_guard();

                let result = prober.probe(endpoint).await;
                attempt.finish();
                match result {
                    Ok(outcome) => {
                        if let Some(accepted) = route(outcome, filter.as_deref(), limit, &shared) {
                            let _ = tx.send(accepted).await;
                        }
                    }
                    Err(e) => {
                        if verbose {
                            debug!("{endpoint} discarded: {e}");
                        }
                    }
                }
            });
        }
        drop(tx);

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                debug!("probe task failed: {e}");
            }
        }

        let progress = match reporter {
            Some(r) => r.finish().await,
            None => shared.snapshot(),
        };
        if stopped_early {
            info!(
                "accepted budget met, skipped remaining probes (accepted: {})",
                progress.accepted
            );
        }

        ProbeRun { results: rx, progress, stopped_early }
    }
}

/// Decide what happens to a successful probe: dropped by the filter,
/// dropped as over budget, or counted and returned for emission.
fn route(
    outcome: ProbeOutcome,
    allowed: Option<&HashSet<String>>,
    limit: Option<u64>,
    shared: &SharedProgress,
) -> Option<ProbeOutcome> {
    let colo = outcome.data_center.as_deref().unwrap_or("-");
    let city = outcome.city.as_deref().unwrap_or("");
    if !filter::accepts(&outcome, allowed) {
        info!(
            "found {} colo {} {} latency {}ms, filtered out",
            outcome.endpoint,
            colo,
            city,
            outcome.latency_ms()
        );
        return None;
    }
    if !shared.try_accept(limit) {
        debug!("found {} but accepted budget is already met", outcome.endpoint);
        return None;
    }
    info!(
        "found {} colo {} {} latency {}ms",
        outcome.endpoint,
        colo,
        city,
        outcome.latency_ms()
    );
    Some(outcome)
}
