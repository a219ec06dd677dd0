use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use jobwatch_adapters::{run_worker, HttpClientConfig};
use jobwatch_core::{JobHash, PostingStatus, WorkerRequest, WorkerResponse};
use jobwatch_storage::{enrichment_value_from_text, LifecycleStore, PostingFilter, StoreConfig};
use jobwatch_sync::{build_orchestrator, maybe_build_scheduler, render_runs_markdown, SyncConfig};
use serde_json::Value as JsonValue;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobwatch-cli")]
#[command(about = "Job posting watch: scrape, deduplicate and track postings over time")]
struct Cli {
    /// Debug-level logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full scrape over the configured query space.
    Sync,
    /// Create or upgrade the database schema.
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Print stored postings as JSON.
    List {
        #[arg(long)]
        status: Option<PostingStatus>,
        #[arg(long)]
        company: Option<String>,
        /// Only postings last seen on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print the most recent runs as markdown.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Set enrichment fields on one posting.
    Patch {
        job_hash: String,
        /// `field=value`; the value is read as the field's type, empty clears it.
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        set: Vec<String>,
    },
    /// Answer one source request read from stdin.
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // stdout belongs to the worker protocol and to command output.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let stop = Arc::new(AtomicBool::new(false));
            spawn_stop_listener(Arc::clone(&stop));
            let orchestrator = build_orchestrator(&config).await?.with_stop_flag(stop);
            let summary = orchestrator.run_once().await?;
            println!(
                "sync complete: run_id={} status={} tuples={}/{} new={} updated={} closed={} timeouts={} errors={}",
                summary.run_id,
                summary.status.as_str(),
                summary.tuples_completed,
                summary.tuples_planned,
                summary.new_postings,
                summary.updated_postings,
                summary.closed_postings,
                summary.source_timeouts,
                summary.source_errors
            );
        }
        Commands::Migrate => {
            let store = open_store(&config).await?;
            store.migrate().await?;
            println!("schema ready at {}", config.database_path.display());
        }
        Commands::Schedule => {
            let stop = Arc::new(AtomicBool::new(false));
            let orchestrator = Arc::new(build_orchestrator(&config).await?.with_stop_flag(Arc::clone(&stop)));
            let Some(mut sched) = maybe_build_scheduler(&config, orchestrator).await? else {
                bail!("scheduler disabled; set JOBWATCH_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            stop.store(true, Ordering::SeqCst);
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::List {
            status,
            company,
            since,
            limit,
        } => {
            let store = open_store(&config).await?;
            let filter = PostingFilter {
                status,
                company,
                seen_since: since,
                limit: Some(limit),
            };
            let postings = store.list_postings(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&postings)?);
        }
        Commands::Runs { limit } => {
            let store = open_store(&config).await?;
            let runs = store.recorder().recent_runs(limit).await?;
            println!("{}", render_runs_markdown(&runs));
        }
        Commands::Patch { job_hash, set } => {
            let store = open_store(&config).await?;
            let fields = parse_assignments(&set)?;
            let found = store.patch_fields(&JobHash::from_stored(job_hash.clone()), &fields).await?;
            if !found {
                bail!("no posting with job_hash {job_hash}");
            }
            println!("patched {} field(s) on {job_hash}", fields.len());
        }
        Commands::Worker => {
            let response = worker_from_stdin().await;
            println!("{}", serde_json::to_string(&response)?);
            let code = response.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<LifecycleStore> {
    LifecycleStore::connect(&StoreConfig::new(&config.database_path))
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))
}

fn spawn_stop_listener(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested; finishing the current tuple");
            stop.store(true, Ordering::SeqCst);
        }
    });
}

async fn worker_from_stdin() -> WorkerResponse {
    let mut input = String::new();
    if let Err(err) = tokio::io::stdin().read_to_string(&mut input).await {
        return WorkerResponse::Failed {
            message: format!("reading request: {err}"),
        };
    }
    match serde_json::from_str::<WorkerRequest>(&input) {
        Ok(request) => run_worker(&request, &HttpClientConfig::default()).await,
        Err(err) => WorkerResponse::Failed {
            message: format!("parsing request: {err}"),
        },
    }
}

fn parse_assignments(items: &[String]) -> Result<BTreeMap<String, JsonValue>> {
    let mut fields = BTreeMap::new();
    for item in items {
        let Some((key, raw)) = item.split_once('=') else {
            bail!("expected FIELD=VALUE, got `{item}`");
        };
        let key = key.trim();
        fields.insert(key.to_string(), enrichment_value_from_text(key, raw)?);
    }
    Ok(fields)
}
