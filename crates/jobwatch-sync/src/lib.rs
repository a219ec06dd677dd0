//! Scrape orchestration: query-space enumeration, bounded source calls,
//! per-tuple flushing into the lifecycle store, run finalization and reports.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use jobwatch_adapters::{candidates_from_rows, HttpClientConfig, QueryContext};
use jobwatch_core::{
    BackoffPolicy, PostingCandidate, QueryTuple, RawPostingRow, RunStatus, RunSummary, SourceSpec, WorkerRequest,
    WorkerResponse,
};
use jobwatch_storage::{LifecycleStore, RunRecorder, StoreConfig, StoreError};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod report;
mod task;

pub use config::{ConfigError, IsolationMode, ScrapeConfig, SyncConfig, ThrottleConfig, MAX_SOURCE_PAGES};
pub use report::{render_daily_brief, render_runs_markdown, write_run_reports};
pub use task::{
    decode_worker_output, run_bounded, AdapterFactory, BuiltinAdapters, InProcessLauncher,
    ProcessLauncher, TaskError, WorkerHandle, WorkerLauncher,
};

pub const CRATE_NAME: &str = "jobwatch-sync";

/// Source of "now" for the orchestrator.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock for deterministic multi-day scenarios.
#[derive(Debug)]
pub struct FixedClock {
    now: StdMutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let next = self.now() + by;
        self.set(next);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Why one source produced nothing for a tuple. Absorbed by the orchestrator.
#[derive(Debug, Error)]
pub enum SourceFailure {
    #[error("source `{source_name}` timed out after {after:?}")]
    Timeout { source_name: String, after: Duration },
    #[error("source `{source_name}` failed: {cause}")]
    Error { source_name: String, cause: String },
    #[error("source `{source_name}` still throttled after {attempts} attempts")]
    Throttled { source_name: String, attempts: usize },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    StoreUnavailable(StoreError),
}

/// Enumerates tuples in fixed order: role outer, function middle, location
/// inner. Blank roles and locations are skipped.
pub fn query_space(roles: &[String], functions: &[String], locations: &[String]) -> Vec<QueryTuple> {
    let mut tuples = Vec::new();
    for role in roles.iter().filter(|r| !r.trim().is_empty()) {
        for function in functions {
            for location in locations.iter().filter(|l| !l.trim().is_empty()) {
                tuples.push(QueryTuple::new(role.trim(), function.trim(), location.trim()));
            }
        }
    }
    tuples
}

/// Runtime knobs of one orchestrator, resolved from [`ScrapeConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub tuples: Vec<QueryTuple>,
    pub sources: Vec<SourceSpec>,
    pub source_timeout: Duration,
    pub max_run_duration: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub staleness_window_days: i64,
    pub results_wanted: u32,
    pub hours_old: u32,
    pub max_parallel_sources: usize,
    pub flush_retries: usize,
    pub throttle: BackoffPolicy,
    pub reports_dir: Option<PathBuf>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ScrapeConfig) -> Self {
        Self {
            tuples: query_space(&config.roles, &config.functions, &config.locations),
            sources: config.sources.clone(),
            source_timeout: Duration::from_secs(config.source_timeout_secs),
            max_run_duration: Duration::from_secs(config.max_run_duration_secs),
            jitter_min: Duration::from_secs(config.jitter_min_secs),
            jitter_max: Duration::from_secs(config.jitter_max_secs),
            staleness_window_days: config.staleness_window_days,
            results_wanted: config.results_wanted,
            hours_old: config.hours_old,
            max_parallel_sources: config.max_parallel_sources.max(1),
            flush_retries: config.flush_retries,
            throttle: config.throttle.policy(),
            reports_dir: None,
        }
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    fn timeout_for(&self, source: &SourceSpec) -> Duration {
        source
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.source_timeout)
    }

    fn jitter_delay(&self) -> Duration {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }
        let min = self.jitter_min.as_millis() as u64;
        let max = self.jitter_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    store: LifecycleStore,
    recorder: RunRecorder,
    launcher: Arc<dyn WorkerLauncher>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    run_guard: Mutex<()>,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, store: LifecycleStore, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let recorder = store.recorder();
        Self {
            settings,
            store,
            recorder,
            launcher,
            clock: Arc::new(SystemClock),
            stop: Arc::new(AtomicBool::new(false)),
            run_guard: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shares an externally owned stop flag, e.g. one set by a signal handler.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> &LifecycleStore {
        &self.store
    }

    /// Flag checked between tuples; setting it ends the current run after
    /// its in-flight tuple, as a budget overrun would.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Executes one full run: every tuple (until budget or stop), then
    /// finalization, then the run record and report files.
    ///
    /// Source failures are absorbed into the summary. Only an unavailable
    /// store aborts the run, and even then a report is written.
    pub async fn run_once(&self) -> Result<RunSummary, OrchestratorError> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            return Err(OrchestratorError::AlreadyRunning);
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        let result = self.execute(run_id).instrument(span).await;
        self.stop.store(false, Ordering::SeqCst);
        result
    }

    async fn execute(&self, run_id: Uuid) -> Result<RunSummary, OrchestratorError> {
        let tuples = &self.settings.tuples;
        let started = Instant::now();
        let mut summary = RunSummary::started(run_id, self.clock.now(), tuples.len());
        info!(tuples = tuples.len(), sources = self.settings.sources.len(), "run started");

        let mut fatal = None;
        for (index, tuple) in tuples.iter().enumerate() {
            let span = info_span!(
                "tuple",
                role = %tuple.role,
                function = %tuple.function,
                location = %tuple.location
            );
            if let Err(err) = self.process_tuple(tuple, &mut summary).instrument(span).await {
                warn!(error = %err, "store unavailable; aborting run");
                fatal = Some(err);
                break;
            }

            let is_last = index + 1 == tuples.len();
            if started.elapsed() >= self.settings.max_run_duration {
                if !is_last {
                    warn!(elapsed = ?started.elapsed(), "run budget exhausted; stopping early");
                    summary.status = RunStatus::StoppedEarly;
                }
                break;
            }
            if self.stop.load(Ordering::SeqCst) {
                if !is_last {
                    info!("stop requested; stopping early");
                    summary.status = RunStatus::StoppedEarly;
                }
                break;
            }
            if !is_last {
                let delay = self.settings.jitter_delay();
                debug!(?delay, "pacing before next tuple");
                tokio::time::sleep(delay).await;
            }
        }
        summary.duration_scrape_ms = started.elapsed().as_millis() as u64;

        if fatal.is_none() {
            let finalize_started = Instant::now();
            match self
                .store
                .finalize_run(self.settings.staleness_window_days, self.clock.today())
                .await
            {
                Ok(closed) => summary.closed_postings = closed,
                Err(err) if err.is_unavailable() => fatal = Some(err),
                Err(err) => warn!(error = %err, "finalize failed; stale postings stay open"),
            }
            summary.duration_finalize_ms = finalize_started.elapsed().as_millis() as u64;
        }

        let status_counts = if fatal.is_none() {
            match self.store.count_by_status().await {
                Ok(counts) => counts,
                Err(err) => {
                    warn!(error = %err, "could not count postings");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        summary.total_postings = status_counts.iter().map(|(_, n)| n).sum();

        if fatal.is_some() {
            summary.status = RunStatus::Failed;
        }
        summary.finished_at = self.clock.now();
        summary.duration_total_ms = started.elapsed().as_millis() as u64;

        if let Err(err) = self.recorder.record(&summary).await {
            warn!(error = %err, "could not append run log row");
        }
        if let Some(dir) = &self.settings.reports_dir {
            match write_run_reports(dir, &summary, &status_counts).await {
                Ok(path) => info!(path = %path.display(), "run reports written"),
                Err(err) => warn!(error = %err, "could not write run reports"),
            }
        }

        info!(
            status = summary.status.as_str(),
            new = summary.new_postings,
            updated = summary.updated_postings,
            closed = summary.closed_postings,
            timeouts = summary.source_timeouts,
            errors = summary.source_errors,
            "run finished"
        );

        match fatal {
            Some(err) => Err(OrchestratorError::StoreUnavailable(err)),
            None => Ok(summary),
        }
    }

    /// Dispatch, collect, merge and flush one tuple. Returns `Err` only when
    /// the store is unavailable.
    async fn process_tuple(&self, tuple: &QueryTuple, summary: &mut RunSummary) -> Result<(), StoreError> {
        let requests = self
            .settings
            .sources
            .iter()
            .map(|source| WorkerRequest::for_tuple(source, tuple, self.settings.results_wanted, self.settings.hours_old))
            .collect::<Vec<_>>();

        let calls = requests
            .into_iter()
            .map(|request| async move {
                let result = self.call_source(&request).await;
                (request.source, result)
            })
            .collect::<Vec<_>>();
        let results = stream::iter(calls)
            .buffered(self.settings.max_parallel_sources)
            .collect::<Vec<_>>()
            .await;

        let ctx = QueryContext {
            query_title: tuple.query_term(),
            query_location: tuple.location.clone(),
        };
        let mut candidates = Vec::new();
        for (source, result) in results {
            match result {
                Ok(rows) => {
                    summary.rows_received += rows.len();
                    let batch = candidates_from_rows(&rows, &ctx, &source.name);
                    summary.rows_dropped += batch.dropped;
                    candidates.extend(batch.candidates);
                }
                Err(failure @ SourceFailure::Timeout { .. }) => {
                    warn!(error = %failure, "source timed out");
                    summary.source_timeouts += 1;
                }
                Err(failure) => {
                    warn!(error = %failure, "source failed");
                    summary.source_errors += 1;
                }
            }
        }

        if !candidates.is_empty() {
            self.flush(&candidates, summary).await?;
        }
        summary.tuples_completed += 1;
        Ok(())
    }

    async fn flush(&self, candidates: &[PostingCandidate], summary: &mut RunSummary) -> Result<(), StoreError> {
        let attempts = self.settings.flush_retries + 1;
        for attempt in 1..=attempts {
            match self.store.upsert_batch(candidates, self.clock.now()).await {
                Ok(outcome) => {
                    info!(
                        inserted = outcome.inserted,
                        updated = outcome.updated,
                        reopened = outcome.reopened,
                        "tuple flushed"
                    );
                    summary.new_postings += outcome.inserted;
                    summary.updated_postings += outcome.updated;
                    summary.reopened_postings += outcome.reopened;
                    return Ok(());
                }
                Err(err) if err.is_unavailable() => return Err(err),
                Err(err) => warn!(attempt, attempts, error = %err, "tuple flush rolled back"),
            }
        }
        summary.failed_flushes += 1;
        Ok(())
    }

    /// One source for one tuple, retrying throttled calls with escalating
    /// cooldowns.
    async fn call_source(&self, request: &WorkerRequest) -> Result<Vec<RawPostingRow>, SourceFailure> {
        let source_name = request.source.name.clone();
        let deadline = self.settings.timeout_for(&request.source);
        let policy = self.settings.throttle;
        let mut attempt = 0usize;

        loop {
            match run_bounded(self.launcher.as_ref(), request, deadline).await {
                Ok(WorkerResponse::Rows { rows }) => {
                    debug!(source = %source_name, rows = rows.len(), "source returned rows");
                    return Ok(rows);
                }
                Ok(WorkerResponse::Failed { message }) => {
                    return Err(SourceFailure::Error {
                        source_name,
                        cause: message,
                    })
                }
                Ok(WorkerResponse::Throttled {
                    retry_after_secs,
                    message,
                }) => {
                    if attempt >= policy.max_retries {
                        return Err(SourceFailure::Throttled {
                            source_name,
                            attempts: attempt + 1,
                        });
                    }
                    let requested = retry_after_secs
                        .map(Duration::from_secs)
                        .unwrap_or_default()
                        .min(policy.max_delay);
                    let cooldown = policy.delay_for_attempt(attempt).max(requested);
                    warn!(source = %source_name, attempt, ?cooldown, message = %message, "source throttled; cooling down");
                    tokio::time::sleep(cooldown).await;
                    attempt += 1;
                }
                Err(TaskError::TimedOut(after)) => return Err(SourceFailure::Timeout { source_name, after }),
                Err(err) => {
                    return Err(SourceFailure::Error {
                        source_name,
                        cause: err.to_string(),
                    })
                }
            }
        }
    }
}

/// Registers the two cron triggers when the scheduler is enabled. A trigger
/// that fires while a run is in progress is skipped.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<Orchestrator>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let orchestrator = Arc::clone(&orchestrator);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                match orchestrator.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                    Err(OrchestratorError::AlreadyRunning) => {
                        info!("scheduled trigger skipped; previous run still in progress")
                    }
                    Err(err) => warn!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Loads config and opens the store as described by `sync`, and picks the
/// launcher for the configured isolation mode.
pub async fn build_orchestrator(sync: &SyncConfig) -> anyhow::Result<Orchestrator> {
    let scrape = ScrapeConfig::load(&sync.config_path).await?;
    let store_config =
        StoreConfig::new(&sync.database_path).with_new_to_active_days(scrape.new_to_active_days);
    let store = LifecycleStore::connect(&store_config)
        .await
        .with_context(|| format!("opening {}", sync.database_path.display()))?;

    let launcher: Arc<dyn WorkerLauncher> = match scrape.isolation {
        IsolationMode::Process => {
            let args = vec!["worker".to_string()];
            let launcher = match &sync.worker_program {
                Some(program) => ProcessLauncher::new(program, args),
                None => ProcessLauncher::current_exe(args).context("locating worker executable")?,
            };
            Arc::new(launcher)
        }
        IsolationMode::Task => Arc::new(InProcessLauncher::new(Arc::new(BuiltinAdapters {
            http: HttpClientConfig::default(),
        }))),
    };

    let settings = OrchestratorSettings::from_config(&scrape).with_reports_dir(&sync.reports_dir);
    Ok(Orchestrator::new(settings, store, launcher))
}
