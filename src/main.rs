use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedwire::config::Config;
use feedwire::delivery::transport::{
    BrokerTransport, MediumTransport, RecordingTransport, ShardAssignment, Transport,
};
use feedwire::delivery::{DeliveryMode, DeliveryPipeline, DestinationLimiter, TemplateRenderer};
use feedwire::failure::FailureTracker;
use feedwire::fetch::HttpFetcher;
use feedwire::scheduler::{ScheduleManager, TriggerEvent};
use feedwire::storage::open_store;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(
    name = "feedwire",
    version,
    about = "Scheduled feed polling with rate-limited fan-out delivery",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json), overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every schedule until interrupted
    Run {
        /// Render and record deliveries without sending them
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// Run a single cycle of one schedule and print its report
    Cycle {
        /// Schedule name
        #[arg(default_value = "default")]
        schedule: String,
    },

    /// Validate the configuration and print the schedules
    Validate,

    /// Show cycle statistics and failing URLs
    Stats,

    /// Delete the fail record of a URL so it rejoins cycles
    ResetFailure {
        url: String,
    },

    /// Fetch one URL immediately and deliver its new items
    Refresh {
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&config.logging.level, &log_format, cli.verbose)?;

    config.validate().context("Invalid configuration")?;

    if let Err(e) = feedwire::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed, continuing without metrics");
    }

    tracing::info!(mode = %config.delivery.mode, "feedwire starting");

    match cli.command {
        Commands::Run { dry_run } => {
            if dry_run {
                config.delivery.mode = DeliveryMode::DryRun;
            }
            run(config).await?;
        }
        Commands::Cycle { schedule } => {
            cycle(config, &schedule).await?;
        }
        Commands::Validate => {
            validate(&config)?;
        }
        Commands::Stats => {
            stats(&config).await?;
        }
        Commands::ResetFailure { url } => {
            reset_failure(&config, &url).await?;
        }
        Commands::Refresh { url } => {
            refresh(config, &url).await?;
        }
    }

    Ok(())
}

fn setup_tracing(level: &str, format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("feedwire=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("feedwire={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

// ============================================================================
// Wiring
// ============================================================================

fn shard_assignment(config: &Config) -> ShardAssignment {
    ShardAssignment::new(config.delivery.shard_ids.clone(), config.delivery.shard_count)
}

fn build_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    let timeout = config.delivery_timeout();
    let transport: Arc<dyn Transport> = match config.delivery.mode {
        DeliveryMode::Brokered => {
            let broker_url = config
                .delivery
                .broker_url
                .as_deref()
                .context("broker_url is required in brokered mode")?;
            Arc::new(BrokerTransport::new(
                broker_url,
                config.delivery.api_base.clone(),
                timeout,
            )?)
        }
        DeliveryMode::InProcess => Arc::new(MediumTransport::new(
            config.delivery.api_base.clone(),
            config.delivery.token.clone(),
            shard_assignment(config),
            timeout,
        )?),
        DeliveryMode::DryRun => Arc::new(RecordingTransport::new()),
    };
    Ok(transport)
}

/// Everything a schedule runtime needs
struct Runtime {
    pipeline: Arc<DeliveryPipeline>,
    manager: ScheduleManager,
    dispatcher: tokio::task::JoinHandle<()>,
}

fn build_runtime(config: &Config) -> Result<Runtime> {
    let store = open_store(&config.storage).context("Failed to open store")?;
    let transport = build_transport(config)?;
    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);

    let limiter = Arc::new(DestinationLimiter::new(
        config.rate_limits.standard_per_minute,
        config.rate_limits.supporter_per_minute,
        config.supporter_guilds(),
    ));
    let renderer = Arc::new(TemplateRenderer::new(config.delivery.max_message_length));
    let pipeline = Arc::new(DeliveryPipeline::new(
        config.delivery.mode,
        renderer,
        Arc::clone(&transport),
        limiter,
        store.clone(),
    ));

    let (tx, rx) = mpsc::channel(config.delivery.channel_capacity.max(1));
    let dispatcher = pipeline.spawn_dispatcher(rx);

    let failures = FailureTracker::new(store.clone(), transport, config.cycle.hours_until_fail);
    let schedules = Arc::new(config.schedule_set()?);
    let settings = config.cycle_settings(shard_assignment(config).primary_shard());
    let manager = ScheduleManager::new(schedules, store.clone(), fetcher, failures, settings, tx);

    Ok(Runtime {
        pipeline,
        manager,
        dispatcher,
    })
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: Config) -> Result<()> {
    let runtime = build_runtime(&config)?;

    for schedule in runtime.manager.schedules().all() {
        tracing::info!(
            schedule = %schedule.name,
            refresh_rate_minutes = schedule.refresh_rate_minutes,
            "Schedule registered"
        );
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let triggers = runtime.manager.start(stop_rx.clone());

    let mut events = runtime.manager.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let TriggerEvent::CycleFinished { report } = event {
                tracing::info!(
                    schedule = %report.schedule,
                    run = report.run,
                    urls = report.url_count,
                    failed = report.fail_count,
                    new_articles = report.new_articles,
                    hung = report.hung.len(),
                    "Cycle finished"
                );
            }
        }
    });

    let pipeline = Arc::clone(&runtime.pipeline);
    let mut housekeeping_stop = stop_rx;
    let housekeeping = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => pipeline.housekeeping(),
                changed = housekeeping_stop.changed() => {
                    if changed.is_err() || *housekeeping_stop.borrow() {
                        break;
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    let _ = stop_tx.send(true);
    runtime.manager.abort_all();
    futures::future::join_all(triggers).await;
    let _ = housekeeping.await;

    // Closing the article channel ends the dispatcher
    drop(runtime.manager);
    let _ = runtime.dispatcher.await;
    runtime.pipeline.drain().await;
    event_log.abort();

    let stats = runtime.pipeline.stats();
    tracing::info!(
        sent = stats.sent,
        blocked = stats.blocked,
        failed = stats.failed,
        "feedwire stopped"
    );
    Ok(())
}

async fn cycle(config: Config, schedule: &str) -> Result<()> {
    let runtime = build_runtime(&config)?;
    let report = runtime.manager.run_once(schedule).await?;

    drop(runtime.manager);
    let _ = runtime.dispatcher.await;
    runtime.pipeline.drain().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", serde_json::to_string_pretty(&runtime.pipeline.stats())?);
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    let schedules = config.schedule_set()?;
    println!("Configuration is valid");
    println!("  Delivery mode: {}", config.delivery.mode);
    println!("  Storage: {:?}", config.storage.backend);
    println!(
        "  Hours until fail: {}",
        if config.cycle.hours_until_fail > 0.0 {
            config.cycle.hours_until_fail.to_string()
        } else {
            "disabled".to_string()
        }
    );
    for schedule in schedules.all() {
        println!(
            "  Schedule '{}': every {} minutes",
            schedule.name, schedule.refresh_rate_minutes
        );
    }
    Ok(())
}

async fn stats(config: &Config) -> Result<()> {
    let store = open_store(&config.storage)?;

    let cycle_stats = store.all_cycle_stats().await?;
    if cycle_stats.is_empty() {
        println!("No cycles recorded yet");
    }
    for stats in cycle_stats {
        println!(
            "{}: {} subscriptions, {} URLs, {} failed, {:.1}s (updated {})",
            stats.schedule_name,
            stats.subscription_count,
            stats.cycle_url_count,
            stats.cycle_fail_count,
            stats.cycle_time_seconds,
            stats.last_updated.to_rfc3339()
        );
    }

    let mut failing: Vec<_> = store.fail_records().await?.into_values().collect();
    failing.sort_by(|a, b| a.first_failed_at.cmp(&b.first_failed_at));
    if !failing.is_empty() {
        println!("\nFailing URLs:");
    }
    for record in failing {
        println!(
            "  {} since {}{}: {}",
            record.url,
            record.first_failed_at.to_rfc3339(),
            if record.alerted { " (alerted)" } else { "" },
            record.reason
        );
    }
    Ok(())
}

async fn reset_failure(config: &Config, url: &str) -> Result<()> {
    let store = open_store(&config.storage)?;
    if store.delete_fail_record(url).await? {
        println!("Fail record of {url} removed");
    } else {
        println!("{url} has no fail record");
    }
    Ok(())
}

async fn refresh(config: Config, url: &str) -> Result<()> {
    let runtime = build_runtime(&config)?;
    let report = runtime.manager.refresh_url(url).await?;

    drop(runtime.manager);
    let _ = runtime.dispatcher.await;
    runtime.pipeline.drain().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
