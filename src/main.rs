//! ashare-etl entry point.
//!
//! Subcommands: `run` executes a named pipeline, `check` audits the SLO
//! window, `guard` wraps an arbitrary command with retry and idempotency
//! protection. Exit codes: 0 success, 1 strict-stage or SLO failure,
//! 2 configuration error; `guard` forwards the subcommand's code.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ashare_etl::calendar::{SystemClock, TradeCalendar};
use ashare_etl::config::Config;
use ashare_etl::context::EtlContext;
use ashare_etl::error::EtlError;
use ashare_etl::events::{EtlEvent, EventBus};
use ashare_etl::limiter::RateBuckets;
use ashare_etl::pipeline::{named_pipeline, run_pipeline};
use ashare_etl::registry::bucket_rates;
use ashare_etl::slo::check_slo;
use ashare_etl::stage::RangeArgs;
use ashare_etl::store::{pool, MySqlStore, Store};
use ashare_etl::vendor::pro::ProClient;
use ashare_etl::wrapper::{run_guarded, GuardArgs};
use ashare_etl::logging;

#[derive(Parser)]
#[command(name = "ashare-etl", version, about = "A-share daily ETL engine")]
struct Cli {
    /// Path to the TOML config file (default: config/etl.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one named pipeline incrementally.
    Run {
        #[arg(long, default_value = "afternoon_core")]
        pipeline: String,
        /// Explicit range start (YYYYMMDD); defaults to watermark + 1.
        #[arg(long)]
        start_date: Option<u32>,
        /// Explicit range end (YYYYMMDD); always clamped to today's cap.
        #[arg(long)]
        end_date: Option<u32>,
        /// Downgrade stage failures to warnings where possible.
        #[arg(long)]
        lenient: bool,
    },
    /// Audit the run log and quality log over an SLO window.
    Check {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Run a command under retry + idempotency protection.
    Guard {
        #[arg(long)]
        task_name: String,
        #[arg(long)]
        idempotency_key: String,
        #[arg(long, default_value_t = 2)]
        retries: u32,
        /// Seconds between attempts.
        #[arg(long, default_value_t = 120)]
        retry_delay: u64,
        /// Per-attempt timeout in seconds.
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
        /// The command to run, after `--`.
        #[arg(last = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    logging::init_logging(&config.logging);

    let code = match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            1
        }
    };
    std::process::exit(code);
}

async fn run(command: Commands, config: Config) -> anyhow::Result<i32> {
    let db_pool = pool::create_pool(&config.store.url()).await?;
    pool::run_migrations(&db_pool).await?;
    let store: Arc<dyn Store> = Arc::new(MySqlStore::new(db_pool));

    match command {
        Commands::Run {
            pipeline,
            start_date,
            end_date,
            lenient,
        } => {
            let def = match named_pipeline(&pipeline) {
                Some(d) => d,
                None => {
                    eprintln!("unknown pipeline: {pipeline}");
                    return Ok(2);
                }
            };
            let effective_lenient =
                config.lenient_for(&def.name, lenient, def.lenient_default);

            let ctx = build_context(config, store)?;
            install_signal_handler(ctx.cancel.clone());
            spawn_event_logger(&ctx);

            // Load whatever calendar exists; the ingest_base stage repairs
            // an empty or stale one from upstream.
            if let Err(e) = ctx.reload_calendar().await {
                warn!(error = %e, "calendar preload failed; continuing to bootstrap");
            }

            let args = RangeArgs {
                start: start_date,
                end: end_date,
            };
            info!(
                pipeline = %def.name,
                lenient = effective_lenient,
                start_date, end_date,
                "pipeline starting"
            );
            match run_pipeline(&ctx, &def, &args, effective_lenient).await {
                Ok(outcome) => {
                    println!("{}", outcome.summary_line());
                    Ok(if outcome.ok { 0 } else { 1 })
                }
                Err(EtlError::ConcurrentRun { api, run_id }) => {
                    error!(api = %api, run_id, "another run is in flight; refusing");
                    Ok(1)
                }
                Err(EtlError::Cancelled) => {
                    warn!("pipeline cancelled");
                    Ok(1)
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::Check { hours } => {
            let report = check_slo(store.as_ref(), hours, config.batch.zombie_threshold_min).await?;
            println!("{}", report.render());
            Ok(if report.breached() { 1 } else { 0 })
        }
        Commands::Guard {
            task_name,
            idempotency_key,
            retries,
            retry_delay,
            timeout,
            command,
        } => {
            let args = GuardArgs {
                task_name,
                idempotency_key,
                retries,
                retry_delay: Duration::from_secs(retry_delay),
                timeout: Duration::from_secs(timeout),
                command,
            };
            Ok(run_guarded(store.as_ref(), &args).await?)
        }
    }
}

fn build_context(config: Config, store: Arc<dyn Store>) -> anyhow::Result<EtlContext> {
    let config = Arc::new(config);
    let vendor = Arc::new(ProClient::new(
        &config.upstream.base_url,
        &config.upstream.token,
    ));
    let buckets = Arc::new(RateBuckets::new(bucket_rates(&config.rate_limit)));

    Ok(EtlContext {
        config,
        store,
        vendor,
        buckets,
        calendar: Arc::new(TradeCalendar::empty()),
        clock: Arc::new(SystemClock),
        events: Arc::new(EventBus::new(1024)),
        cancel: CancellationToken::new(),
    })
}

/// SIGINT/SIGTERM flip the cancellation token; in-flight fetch attempts and
/// write transactions finish, then workers exit.
fn install_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => { info!("received SIGINT"); }
                _ = sigterm.recv() => { info!("received SIGTERM"); }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received SIGINT");
        }
        cancel.cancel();
    });
}

/// Forward bus events to the log; this doubles as the reference subscriber
/// for notification collaborators.
fn spawn_event_logger(ctx: &EtlContext) {
    let mut rx = ctx.events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let EtlEvent::PipelineSummary {
                pipeline,
                ok,
                succeeded,
                failed,
                skipped,
                duration_ms,
            } = &event
            {
                info!(
                    pipeline = %pipeline,
                    ok,
                    succeeded,
                    failed,
                    skipped,
                    duration_ms,
                    "pipeline summary"
                );
            }
        }
    });
}
