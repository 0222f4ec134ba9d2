//! Cobalt Store CLI
//!
//! Command-line interface for inspecting and driving the aggregation store:
//! - Show table statistics and stored aggregates
//! - Record enablement changes
//! - Log events through a metric registry
//! - Run the periodic generation job
//! - Inspect and clean up stored data

use anyhow::Context;
use clap::{Parser, Subcommand};
use cobalt_store::{
    AggregateValue, CobaltLogger, Config, DataService, EnabledFlag, NoOpOperationLogger,
    NonPrivateGeneratorFactory, PeriodicJob, PeriodicJobConfig, Registry, ReleaseStage, Store,
    SystemClock, SystemProfile,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cobalt-store")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Privacy-preserving telemetry aggregation store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show row counts per table
    Stats,

    /// List stored aggregates
    Aggregates,

    /// Record that logging is enabled now
    Enable,

    /// Record that logging is disabled now
    Disable,

    /// Log occurrences of an event through the registry
    LogOccurrence {
        #[arg(long)]
        customer: u32,
        #[arg(long)]
        project: u32,
        #[arg(long)]
        metric: u32,
        /// Number of occurrences
        #[arg(long, default_value_t = 1)]
        count: i64,
        /// Event codes, comma-separated
        #[arg(long, value_delimiter = ',')]
        codes: Vec<i32>,
    },

    /// Log a string through the registry
    LogString {
        #[arg(long)]
        customer: u32,
        #[arg(long)]
        project: u32,
        #[arg(long)]
        metric: u32,
        value: String,
        /// Event codes, comma-separated
        #[arg(long, value_delimiter = ',')]
        codes: Vec<i32>,
    },

    /// List queued observation batches
    Observations {
        /// Maximum batches shown
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Remove the listed batches after printing
        #[arg(long)]
        remove: bool,
    },

    /// Delete aggregates before a day and reports missing from the registry
    Cleanup {
        /// Oldest day index to keep
        #[arg(long)]
        keep_from_day: u32,
    },

    /// Run one pass of the periodic job with non-private generators
    RunJob,

    /// Print a default config file
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        print!("{}", cobalt_store::config::generate_default_config());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_tracing(&config);

    let data_dir = PathBuf::from(&config.storage.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
    let db_path = config.storage.database_path();
    tracing::debug!("Opening store at {:?}", db_path);

    let store = Arc::new(Store::open(&db_path)?);
    let data_service = Arc::new(DataService::with_config(
        store,
        Arc::new(NoOpOperationLogger),
        config.aggregation.data_service_config(),
    ));
    let json = cli.format == "json";

    match cli.command {
        Commands::Stats => {
            let stats = data_service.stats().await?;
            if json {
                let value = serde_json::json!({
                    "reports": stats.reports,
                    "system_profiles": stats.system_profiles,
                    "aggregates": stats.aggregates,
                    "string_hashes": stats.string_hashes,
                    "observation_batches": stats.observation_batches,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Cobalt Store v{}", env!("CARGO_PKG_VERSION"));
                println!("Database: {:?}", db_path);
                println!("{}", stats);
            }
        }

        Commands::Aggregates => {
            let rows = data_service.aggregate_rows().await?;
            if json {
                let values: Vec<_> = rows
                    .iter()
                    .map(|row| {
                        serde_json::json!({
                            "report": row.report,
                            "day_index": row.day_index,
                            "event_vector": row.event_vector,
                            "system_profile": row.system_profile,
                            "value": row.aggregate_value,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&values)?);
            } else if rows.is_empty() {
                println!("No aggregates stored.");
            } else {
                println!("{:<16} {:<8} {:<16} {}", "Report", "Day", "Events", "Value");
                println!("{}", "-".repeat(60));
                for row in rows {
                    println!(
                        "{:<16} {:<8} {:<16} {}",
                        row.report.to_string(),
                        row.day_index,
                        row.event_vector.to_db_string(),
                        format_value(&row.aggregate_value)
                    );
                }
            }
        }

        Commands::Enable => {
            let enabled = data_service.logger_enabled(chrono::Utc::now()).await?;
            println!("Logging enabled since {}", enabled.to_rfc3339());
        }

        Commands::Disable => {
            data_service.logger_disabled(chrono::Utc::now()).await?;
            println!("Logging disabled");
        }

        Commands::LogOccurrence {
            customer,
            project,
            metric,
            count,
            codes,
        } => {
            let logger = build_logger(&config, customer, project, data_service)?;
            logger.log_occurrence(metric, count, &codes).await?;
            println!("Logged {} occurrence(s) of metric {}", count, metric);
        }

        Commands::LogString {
            customer,
            project,
            metric,
            value,
            codes,
        } => {
            let logger = build_logger(&config, customer, project, data_service)?;
            logger.log_string(metric, &value, &codes).await?;
            println!("Logged {:?} for metric {}", value, metric);
        }

        Commands::Observations { limit, remove } => {
            let queued = data_service.oldest_observations(limit).await?;
            if json {
                let values: Vec<_> = queued
                    .iter()
                    .map(|q| {
                        serde_json::json!({
                            "id": q.id,
                            "metadata": q.batch.metadata,
                            "observations": q.batch.observation_count(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&values)?);
            } else if queued.is_empty() {
                println!("No observations queued.");
            } else {
                println!("{:<8} {:<16} {:<8} {}", "ID", "Report", "Day", "Observations");
                println!("{}", "-".repeat(48));
                for q in &queued {
                    println!(
                        "{:<8} {:<16} {:<8} {}",
                        q.id,
                        q.batch.metadata.report.to_string(),
                        q.batch.metadata.day_index,
                        q.batch.observation_count()
                    );
                }
            }

            if remove {
                let ids = queued.iter().map(|q| q.id).collect();
                let removed = data_service.remove_sent_observations(ids).await?;
                eprintln!("Removed {} batches", removed);
            }
        }

        Commands::Cleanup { keep_from_day } => {
            let registry = load_registry(&config)?;
            let summary = data_service
                .cleanup(registry.report_keys(), keep_from_day)
                .await?;
            println!("Cleanup before day {}:", keep_from_day);
            println!("  Aggregates: {}", summary.old_aggregates);
            println!("  String hashes: {}", summary.old_string_hashes);
            println!("  Reports: {}", summary.reports);
            println!("  System profiles: {}", summary.system_profiles);
        }

        Commands::RunJob => {
            let registry = Arc::new(load_registry(&config)?);
            let job = PeriodicJob::new(
                data_service,
                registry,
                Arc::new(NonPrivateGeneratorFactory),
                Arc::new(SystemClock),
                EnabledFlag::new(true),
                PeriodicJobConfig {
                    retention_days: config.aggregation.retention_days,
                    ..PeriodicJobConfig::default()
                },
            );
            let summary = job.generate_aggregated_observations().await?;

            println!(
                "Generated through day {}",
                summary
                    .most_recent_day_index
                    .map_or_else(|| "-".to_string(), |d| d.to_string())
            );
            println!("  Reports processed: {}", summary.reports_processed);
            println!("  Reports skipped: {}", summary.reports_skipped);
            println!("  Reports failed: {}", summary.reports_failed);
            println!("  Batches generated: {}", summary.batches_generated);
            println!("  Batches queued: {}", summary.batches_queued);
        }

        Commands::Config => {}
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cobalt_store={}", config.logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Cleanup treats every report outside the registry as irrelevant, so an
/// absent registry is an error rather than an empty one.
fn load_registry(config: &Config) -> anyhow::Result<Registry> {
    let path = config.registry.required_path()?;
    Registry::load(path).with_context(|| format!("Failed to load registry {:?}", path))
}

fn build_logger(
    config: &Config,
    customer_id: u32,
    project_id: u32,
    data_service: Arc<DataService>,
) -> anyhow::Result<CobaltLogger> {
    let registry = Arc::new(load_registry(config)?);

    Ok(CobaltLogger::new(
        customer_id,
        project_id,
        registry,
        data_service,
        Arc::new(SystemClock),
        EnabledFlag::new(true),
    )
    .with_release_stage(ReleaseStage::Ga)
    .with_system_profile(
        SystemProfile::default()
            .system_version(std::env::consts::OS)
            .app_version(env!("CARGO_PKG_VERSION")),
    ))
}

fn format_value(value: &AggregateValue) -> String {
    match value {
        AggregateValue::Integer(count) => count.to_string(),
        AggregateValue::IndexHistogram(buckets) => buckets
            .iter()
            .map(|(index, count)| format!("{}:{}", index, count))
            .collect::<Vec<_>>()
            .join(" "),
    }
}
