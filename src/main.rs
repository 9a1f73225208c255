//! Mailcheck CLI - extraction scoring and email test execution

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailcheck_core::analysis::{self, AnalysisRequest, AnalysisType};
use mailcheck_core::batch;
use mailcheck_core::clients::MemoryClientStore;
use mailcheck_core::server::{ApiServer, AppState};
use mailcheck_core::{
    ExecutionMonitor, ExecutionOptions, MemoryQueueStore, QueueStatus, QueueStore, Settings, SimulatedExecutor,
    SqliteQueueStore,
};

#[derive(Parser)]
#[command(name = "mailcheck")]
#[command(about = "Extraction accuracy scoring and email test execution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON settings file
    #[arg(short, long, global = true, env = "MAILCHECK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score an actual extraction against the expected one
    Analyze {
        /// JSON object with the expected field values
        #[arg(short, long)]
        expected: PathBuf,

        /// JSON object with the extracted field values
        #[arg(short, long)]
        actual: PathBuf,

        /// Test result identifier recorded in the analysis
        #[arg(short, long, default_value = "local")]
        test_result_id: String,

        /// Analysis depth (basic, detailed, comprehensive)
        #[arg(long, default_value = "comprehensive")]
        analysis_type: AnalysisType,

        /// Skip recommendations
        #[arg(long)]
        no_recommendations: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Path to save the analysis (JSON)
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Analyze every case file in a directory
    Batch {
        /// Directory containing *.json analysis requests
        dir: PathBuf,

        /// Analysis depth (basic, detailed, comprehensive)
        #[arg(long, default_value = "comprehensive")]
        analysis_type: AnalysisType,

        /// Path to save the batch report (JSON)
        #[arg(short, long, default_value = "./batch_report.json")]
        report: PathBuf,
    },

    /// Run test cases through the simulated execution queue
    Run {
        /// Client owning the test cases
        #[arg(long, default_value = "local")]
        client: String,

        /// Test case IDs (comma separated)
        #[arg(long, value_delimiter = ',', required = true)]
        cases: Vec<String>,

        /// Test cases executed concurrently per batch
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Total attempts per test case
        #[arg(long)]
        retries: Option<u32>,

        /// Persist queue state in this SQLite database
        #[arg(short, long)]
        database: Option<PathBuf>,
    },

    /// Serve the email testing HTTP API
    Serve {
        #[arg(long, env = "MAILCHECK_HOST")]
        host: Option<String>,

        #[arg(long, env = "MAILCHECK_PORT")]
        port: Option<u16>,

        /// JSON array of client documents to load at startup
        #[arg(long)]
        clients: Option<PathBuf>,

        /// Persist queue state in this SQLite database
        #[arg(short, long)]
        database: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Analyze {
            expected,
            actual,
            test_result_id,
            analysis_type,
            no_recommendations,
            format,
            report,
        } => {
            let request = AnalysisRequest {
                test_result_id,
                expected_extraction: read_object(&expected)?,
                actual_extraction: read_object(&actual)?,
                analysis_type,
                include_recommendations: !no_recommendations,
            };
            let result = analysis::analyze(&request);

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                analysis::print_summary(&result);
            }
            if let Some(path) = report {
                analysis::save_report(&result, &path)?;
            }
        }

        Commands::Batch {
            dir,
            analysis_type,
            report,
        } => {
            let batch_report = batch::run_batch(&dir, analysis_type)?;
            batch::print_batch_summary(&batch_report);
            analysis::save_report(&batch_report, &report)?;
        }

        Commands::Run {
            client,
            cases,
            parallel,
            retries,
            database,
        } => {
            run_queue(&settings, &client, cases, parallel, retries, database.as_deref()).await?;
        }

        Commands::Serve {
            host,
            port,
            clients,
            database,
        } => {
            let mut server_config = settings.server.clone();
            if let Some(host) = host {
                server_config.host = host;
            }
            if let Some(port) = port {
                server_config.port = port;
            }

            let clients = match clients {
                Some(path) => MemoryClientStore::load(&path)?,
                None => MemoryClientStore::new(),
            };
            let monitor = Arc::new(build_monitor(&settings, database.as_deref())?);
            let cleanup = monitor.spawn_cleanup();

            let state = Arc::new(AppState {
                clients: Arc::new(clients),
                monitor: monitor.clone(),
            });
            let result = ApiServer::new(server_config, state).start().await;

            cleanup.abort();
            monitor.shutdown();
            result?;
        }
    }

    Ok(())
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value: Value = serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{:?} must contain a JSON object", path),
    }
}

fn build_monitor(settings: &Settings, database: Option<&Path>) -> Result<ExecutionMonitor> {
    let store: Arc<dyn QueueStore> = match database {
        Some(path) => {
            tracing::info!("Persisting queues to {:?}", path);
            Arc::new(SqliteQueueStore::open(path).with_context(|| format!("Failed to open queue database {:?}", path))?)
        }
        None => Arc::new(MemoryQueueStore::new()),
    };
    let executor = Arc::new(SimulatedExecutor::new(settings.simulator.clone()));
    Ok(ExecutionMonitor::new(store, executor, settings.monitor.clone()))
}

async fn run_queue(
    settings: &Settings,
    client: &str,
    cases: Vec<String>,
    parallel: Option<usize>,
    retries: Option<u32>,
    database: Option<&Path>,
) -> Result<()> {
    let monitor = build_monitor(settings, database)?;
    let defaults = settings.monitor.default_options();
    let options = ExecutionOptions {
        parallel_limit: parallel.unwrap_or(defaults.parallel_limit),
        retry_attempts: retries.unwrap_or(defaults.retry_attempts),
        retry_backoff_ms: defaults.retry_backoff_ms,
    };

    let total = cases.len();
    let queue_id = monitor.start(client, cases, Some(options))?;
    println!("Queue {} started with {} test cases", queue_id.yellow(), total);

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")?
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut poll = tokio::time::interval(Duration::from_millis(250));
    let queue = loop {
        tokio::select! {
            _ = poll.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                monitor.cancel(&queue_id)?;
                pb.set_message("cancelling...");
            }
        }
        let queue = monitor.status(&queue_id)?;
        pb.set_position(queue.progress.processed() as u64);
        pb.set_message(format!(
            "{} ok, {} failed, ~{}s left",
            queue.progress.completed,
            queue.progress.failed,
            queue.estimated_time_remaining_ms / 1000
        ));
        if queue.status.is_terminal() {
            break queue;
        }
    };
    pb.finish_with_message(format!("✓ {}", queue.status.as_str()));
    monitor.wait(&queue_id).await;

    let status = match queue.status {
        QueueStatus::Completed => queue.status.as_str().green(),
        QueueStatus::Cancelled => queue.status.as_str().yellow(),
        _ => queue.status.as_str().red(),
    };
    println!("\nStatus:     {}", status);
    println!("Completed:  {}", queue.progress.completed.to_string().green());
    println!("Failed:     {}", queue.progress.failed.to_string().red());
    for result_id in &queue.results {
        println!("  {} {}", "•".cyan(), result_id);
    }

    Ok(())
}
