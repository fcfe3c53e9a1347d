//! Batch orchestrator: walks the record store, resolves what the ledger
//! hasn't settled, and checkpoints the results.
//!
//! Sequential mode runs a single worker over every candidate. Parallel mode
//! splits candidates round-robin into disjoint shards, one tokio task per
//! shard, each with its own chain, browser session and failure log. Workers
//! hand back their ledger deltas and the orchestrator merges them once.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use cepgeo_common::{canonical_cep, CepGeoError, Record};

use crate::infra::rate_limit::RateLimiter;
use crate::infra::run_log::{EventKind, RunLog};
use crate::infra::util::partition;
use crate::ledger::{FailureLog, Ledger, LedgerDelta};
use crate::resolver::FallbackResolver;
use crate::store::RecordStore;
use crate::traits::PageFetcher;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Limits on one run. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    /// Per worker.
    pub max_attempts: Option<u32>,
    /// Shared deadline measured from the start of the run.
    pub max_wall_clock: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Sequential,
    Parallel { workers: usize },
}

/// Who shares a geocoder rate limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitScope {
    #[default]
    PerWorker,
    /// One limiter for every worker, so the geocoder sees the global rate.
    Shared,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub budget: Budget,
    pub concurrency: Concurrency,
    pub rate_limit_scope: RateLimitScope,
    pub retry_failed: bool,
    pub geocode_min_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            budget: Budget::default(),
            concurrency: Concurrency::Sequential,
            rate_limit_scope: RateLimitScope::default(),
            retry_failed: false,
            geocode_min_interval: Duration::from_millis(1100),
        }
    }
}

// ---------------------------------------------------------------------------
// Chain construction seam
// ---------------------------------------------------------------------------

/// A worker's resolver plus the browser session it holds, if any.
pub struct WorkerChain {
    pub resolver: FallbackResolver,
    pub page: Option<Arc<dyn PageFetcher>>,
}

/// Builds one worker's source chain. Production opens a WebDriver session
/// per worker; tests hand back scripted sources.
#[async_trait]
pub trait ChainFactory: Send + Sync {
    async fn build(&self, worker: usize, limiter: Arc<RateLimiter>) -> Result<WorkerChain>;
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub candidates: usize,
    pub workers: usize,
    /// Records counted against the attempt budget.
    pub attempted: u32,
    pub resolved: u32,
    pub failed: u32,
    /// Records that already had coordinates.
    pub skipped: u32,
    pub total_succeeded: usize,
    pub total_failed: usize,
}

impl RunStats {
    fn absorb(&mut self, w: &WorkerStats) {
        self.attempted += w.attempted;
        self.resolved += w.resolved;
        self.failed += w.failed;
        self.skipped += w.skipped;
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Run Complete ===")?;
        writeln!(f, "Candidates:       {}", self.candidates)?;
        writeln!(f, "Workers:          {}", self.workers)?;
        writeln!(f, "Attempted:        {}", self.attempted)?;
        writeln!(f, "Newly succeeded:  {}", self.resolved)?;
        writeln!(f, "Newly failed:     {}", self.failed)?;
        writeln!(f, "Already resolved: {}", self.skipped)?;
        writeln!(f, "Total succeeded:  {}", self.total_succeeded)?;
        write!(f, "Total failed:     {}", self.total_failed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerStats {
    attempted: u32,
    resolved: u32,
    failed: u32,
    skipped: u32,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct BatchOrchestrator {
    store: RecordStore,
    ledger_dir: PathBuf,
    data_dir: PathBuf,
    factory: Arc<dyn ChainFactory>,
    options: RunOptions,
}

/// Everything a worker task owns.
struct WorkerContext {
    index: usize,
    shard: Vec<String>,
    chain: WorkerChain,
    store: RecordStore,
    budget: Budget,
    deadline: Option<Instant>,
    failure_log: Option<FailureLog>,
    run_id: String,
}

struct WorkerOutput {
    delta: LedgerDelta,
    stats: WorkerStats,
    log: RunLog,
}

enum RecordResult {
    Resolved,
    Failed,
    Skipped,
}

impl BatchOrchestrator {
    pub fn new(
        store: RecordStore,
        ledger_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        factory: Arc<dyn ChainFactory>,
        options: RunOptions,
    ) -> Self {
        Self {
            store,
            ledger_dir: ledger_dir.into(),
            data_dir: data_dir.into(),
            factory,
            options,
        }
    }

    /// Identifiers to process this run, sorted.
    pub fn candidates(&self, ledger: &Ledger) -> Result<Vec<String>, CepGeoError> {
        Ok(self
            .store
            .list_identifiers()?
            .into_iter()
            .filter(|id| !ledger.is_settled(id, self.options.retry_failed))
            .collect())
    }

    pub async fn run(&self) -> Result<RunStats> {
        let run_id = Uuid::new_v4().to_string();
        let mut ledger = Ledger::load(&self.ledger_dir).context("Failed to load ledger")?;
        let candidates = self.candidates(&ledger).context("Failed to list records")?;
        let deadline = self.options.budget.max_wall_clock.map(|d| Instant::now() + d);

        let (mode, shards) = match self.options.concurrency {
            Concurrency::Sequential => {
                let shards = if candidates.is_empty() {
                    Vec::new()
                } else {
                    vec![candidates.clone()]
                };
                ("sequential".to_string(), shards)
            }
            Concurrency::Parallel { workers } => {
                let shards: Vec<Vec<String>> = partition(&candidates, workers)
                    .into_iter()
                    .filter(|s| !s.is_empty())
                    .collect();
                (format!("parallel({})", workers.max(1)), shards)
            }
        };
        let parallel = matches!(self.options.concurrency, Concurrency::Parallel { .. });

        info!(
            run_id = run_id.as_str(),
            mode = mode.as_str(),
            candidates = candidates.len(),
            succeeded = ledger.succeeded().len(),
            failed = ledger.failed().len(),
            "Starting run"
        );

        let chains = self.build_chains(shards.len()).await?;
        let sources = chains
            .first()
            .map(|c| c.resolver.source_names())
            .unwrap_or_default();

        let mut run_log = RunLog::new(run_id.clone());
        run_log.log(EventKind::RunStarted {
            mode,
            candidates: candidates.len(),
            sources,
        });

        let mut stats = RunStats {
            candidates: candidates.len(),
            workers: shards.len(),
            ..Default::default()
        };
        let mut delta = LedgerDelta::default();

        let contexts = shards
            .into_iter()
            .zip(chains)
            .enumerate()
            .map(|(index, (shard, chain))| WorkerContext {
                index,
                shard,
                chain,
                store: self.store.clone(),
                budget: self.options.budget,
                deadline,
                failure_log: parallel.then(|| FailureLog::for_worker(&self.ledger_dir, index)),
                run_id: run_id.clone(),
            });

        if parallel {
            let handles: Vec<(usize, tokio::task::JoinHandle<WorkerOutput>)> = contexts
                .map(|ctx| (ctx.index, tokio::spawn(run_worker(ctx))))
                .collect();
            let (indices, handles): (Vec<usize>, Vec<_>) = handles.into_iter().unzip();
            let joined = futures::future::join_all(handles).await;

            for (worker, result) in indices.into_iter().zip(joined) {
                match result {
                    Ok(output) => {
                        stats.absorb(&output.stats);
                        delta.extend(output.delta);
                        run_log.absorb(output.log);
                    }
                    Err(e) => {
                        error!(worker, error = %e, "Worker aborted");
                        run_log.log(EventKind::WorkerAborted {
                            worker,
                            error: e.to_string(),
                        });
                    }
                }
            }
        } else {
            for ctx in contexts {
                let output = run_worker(ctx).await;
                stats.absorb(&output.stats);
                delta.extend(output.delta);
                run_log.absorb(output.log);
            }
        }

        ledger.merge(&delta);
        ledger.save().context("Failed to persist ledger")?;
        stats.total_succeeded = ledger.succeeded().len();
        stats.total_failed = ledger.failed().len();

        if let Err(e) = run_log.save(&self.data_dir, &stats) {
            warn!(error = %e, "Failed to save run log");
        }

        info!(
            run_id = run_id.as_str(),
            resolved = stats.resolved,
            failed = stats.failed,
            skipped = stats.skipped,
            "Run finished"
        );
        Ok(stats)
    }

    /// One chain per worker, each with the limiter its scope calls for.
    /// A failure closes whatever sessions were already opened.
    async fn build_chains(&self, workers: usize) -> Result<Vec<WorkerChain>> {
        let shared = Arc::new(RateLimiter::new(self.options.geocode_min_interval));
        let mut chains: Vec<WorkerChain> = Vec::with_capacity(workers);

        for worker in 0..workers {
            let limiter = match self.options.rate_limit_scope {
                RateLimitScope::Shared => shared.clone(),
                RateLimitScope::PerWorker => {
                    Arc::new(RateLimiter::new(self.options.geocode_min_interval))
                }
            };
            match self.factory.build(worker, limiter).await {
                Ok(chain) => chains.push(chain),
                Err(e) => {
                    for chain in &chains {
                        close_page(chain, worker).await;
                    }
                    return Err(e.context(format!("Failed to build source chain for worker {worker}")));
                }
            }
        }
        Ok(chains)
    }
}

async fn close_page(chain: &WorkerChain, worker: usize) {
    if let Some(page) = &chain.page {
        if let Err(e) = page.close().await {
            warn!(worker, error = %e, "Failed to close browser session");
        }
    }
}

fn past_deadline(ctx: &WorkerContext) -> bool {
    ctx.deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

fn budget_exhausted(ctx: &WorkerContext, attempted: u32) -> Option<String> {
    if let Some(max) = ctx.budget.max_attempts {
        if attempted >= max {
            return Some(format!("attempt limit {max} reached"));
        }
    }
    if past_deadline(ctx) {
        return Some("time limit reached".to_string());
    }
    None
}

async fn run_worker(ctx: WorkerContext) -> WorkerOutput {
    let worker = ctx.index;
    let mut out = WorkerOutput {
        delta: LedgerDelta::default(),
        stats: WorkerStats::default(),
        log: RunLog::new(ctx.run_id.clone()),
    };
    info!(worker, records = ctx.shard.len(), "Worker started");

    let mut exhausted = false;
    for id in &ctx.shard {
        if !exhausted {
            if let Some(reason) = budget_exhausted(&ctx, out.stats.attempted) {
                info!(worker, attempts = out.stats.attempted, reason = reason.as_str(), "Budget exhausted");
                out.log.log(EventKind::BudgetExhausted {
                    worker,
                    attempts: out.stats.attempted,
                    reason,
                });
                exhausted = true;
            }
        }

        // Out of attempts, only already-resolved records are checkpointed.
        // Out of time, stop.
        if exhausted {
            if past_deadline(&ctx) {
                break;
            }
            if skip_if_resolved(&ctx, id, &mut out.log).await {
                out.stats.skipped += 1;
                out.delta.succeeded.insert(id.clone());
            }
            continue;
        }

        match process_record(&ctx, id, &mut out.log).await {
            RecordResult::Resolved => {
                out.stats.attempted += 1;
                out.stats.resolved += 1;
                out.delta.succeeded.insert(id.clone());
            }
            RecordResult::Failed => {
                out.stats.attempted += 1;
                out.stats.failed += 1;
                out.delta.failed.insert(id.clone());
                if let Some(log) = &ctx.failure_log {
                    if let Err(e) = append_failure(log, id).await {
                        warn!(worker, cep = id.as_str(), error = %e, "Failed to append to worker failure log");
                    }
                }
            }
            RecordResult::Skipped => {
                out.stats.skipped += 1;
                out.delta.succeeded.insert(id.clone());
            }
        }
    }

    close_page(&ctx.chain, worker).await;

    let s = out.stats;
    info!(
        worker,
        attempted = s.attempted,
        resolved = s.resolved,
        failed = s.failed,
        skipped = s.skipped,
        "Worker finished"
    );
    out.log.log(EventKind::WorkerFinished {
        worker,
        attempted: s.attempted,
        resolved: s.resolved,
        failed: s.failed,
        skipped: s.skipped,
    });
    out
}

fn fail(log: &mut RunLog, worker: usize, id: &str, reason: String) -> RecordResult {
    warn!(worker, cep = id, reason = reason.as_str(), "Record failed");
    log.log(EventKind::RecordFailed {
        worker,
        cep: id.to_string(),
        reason,
    });
    RecordResult::Failed
}

fn skip(log: &mut RunLog, worker: usize, id: &str) -> RecordResult {
    info!(worker, cep = id, "Already resolved, skipping");
    log.log(EventKind::RecordSkipped {
        worker,
        cep: id.to_string(),
    });
    RecordResult::Skipped
}

async fn load_record(store: &RecordStore, id: &str) -> Result<Record, CepGeoError> {
    let store = store.clone();
    let id = id.to_string();
    tokio::task::spawn_blocking(move || store.load(&id))
        .await
        .unwrap_or_else(|e| Err(CepGeoError::Store(format!("load task failed: {e}"))))
}

async fn save_record(store: &RecordStore, id: &str, mut record: Record) -> Result<(), CepGeoError> {
    let store = store.clone();
    let id = id.to_string();
    tokio::task::spawn_blocking(move || store.save(&id, &mut record))
        .await
        .unwrap_or_else(|e| Err(CepGeoError::Store(format!("save task failed: {e}"))))
}

async fn append_failure(log: &FailureLog, id: &str) -> std::io::Result<()> {
    let log = log.clone();
    let id = id.to_string();
    tokio::task::spawn_blocking(move || log.append(&id))
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)))
}

/// Checkpoint `id` as succeeded if its record already has coordinates.
/// Unreadable records are left for a later run.
async fn skip_if_resolved(ctx: &WorkerContext, id: &str, log: &mut RunLog) -> bool {
    match load_record(&ctx.store, id).await {
        Ok(mut record) => {
            record.normalize();
            if record.has_coordinates() {
                skip(log, ctx.index, id);
                return true;
            }
            false
        }
        Err(_) => false,
    }
}

async fn process_record(ctx: &WorkerContext, id: &str, log: &mut RunLog) -> RecordResult {
    let worker = ctx.index;

    let mut record = match load_record(&ctx.store, id).await {
        Ok(record) => record,
        Err(e) => return fail(log, worker, id, e.to_string()),
    };
    record.normalize();

    if record.has_coordinates() {
        return skip(log, worker, id);
    }

    let Some(raw) = record.identifier() else {
        return fail(log, worker, id, "record has no cep field".to_string());
    };
    let cep = canonical_cep(raw);
    if cep.is_empty() {
        return fail(log, worker, id, format!("cep {raw:?} has no digits"));
    }

    let report = ctx.chain.resolver.resolve_record(&cep, &record).await;
    for attempt in &report.attempts {
        log.log(EventKind::SourceAttempt {
            worker,
            cep: cep.clone(),
            source: attempt.source.clone(),
            outcome: attempt.outcome.label().to_string(),
            reason: attempt.outcome.reason().map(str::to_string),
        });
    }

    let Some(resolution) = report.resolution else {
        return fail(log, worker, id, report.failure_summary());
    };

    record.set_coordinates(&resolution.coordinates);
    if let Err(e) = save_record(&ctx.store, id, record).await {
        return fail(log, worker, id, format!("resolved but not saved: {e}"));
    }

    info!(
        worker,
        cep = id,
        source = resolution.source.as_str(),
        latitude = resolution.coordinates.latitude.as_str(),
        longitude = resolution.coordinates.longitude.as_str(),
        "Record resolved"
    );
    log.log(EventKind::RecordResolved {
        worker,
        cep: id.to_string(),
        source: resolution.source,
        latitude: resolution.coordinates.latitude,
        longitude: resolution.coordinates.longitude,
    });
    RecordResult::Resolved
}
