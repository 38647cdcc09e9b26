use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use rental_etl::config::Config;
use rental_etl::domain::DatasetKind;
use rental_etl::logging;
use rental_etl::pipeline::events::{StopHandle, TracingSink};
use rental_etl::pipeline::storage::SqliteConnector;
use rental_etl::pipeline::{PipelineCoordinator, PipelineReport, PipelineStage, PipelineStatus};

#[derive(Parser)]
#[command(name = "rental-etl")]
#[command(about = "Transform and load property rental listings, reviews and calendars")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file (defaults to rental_etl.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean the raw dumps into transformed artifacts
    Transform,
    /// Load transformed artifacts into the warehouse
    Load {
        /// Datasets to load (repeatable). Available: listings, reviews, calendar
        #[arg(long = "dataset")]
        datasets: Vec<DatasetKind>,
        /// Skip batches before this index
        #[arg(long, default_value_t = 0)]
        start_batch: usize,
    },
    /// Transform, then load
    Run {
        /// Datasets to load (repeatable). All three are always transformed
        #[arg(long = "dataset")]
        datasets: Vec<DatasetKind>,
    },
}

fn print_summary(report: &PipelineReport) {
    let icon = match report.status {
        PipelineStatus::Succeeded => "✅",
        PipelineStatus::PartiallyFailed => "⚠️ ",
        PipelineStatus::Failed => "❌",
    };
    println!("\n{} Pipeline run {}: {:?}", icon, report.run_id, report.status);
    for outcome in &report.datasets {
        let mut line = format!("   - {}:", outcome.dataset);
        if let Some(t) = &outcome.transform {
            line.push_str(&format!(" transformed {} rows ({} orphans)", t.rows_written, t.orphans));
        }
        if let Some(l) = &outcome.load {
            line.push_str(&format!(" loaded {} rows, skipped {}, failed {}", l.inserted, l.skipped, l.failed));
        }
        if let Some(e) = &outcome.error {
            line.push_str(&format!(" [{}]", e));
        }
        println!("{}", line);
    }
    println!("   Issues: {}", report.issues);
}

async fn run(cli: Cli) -> anyhow::Result<PipelineStatus> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let _guard = logging::init_logging(&config.paths.log_dir).context("Failed to initialize logging")?;

    let (stage, datasets, start_batch) = match cli.command {
        Commands::Transform => {
            println!("🔄 Running transform...");
            (PipelineStage::TransformOnly, Vec::new(), 0)
        }
        Commands::Load { datasets, start_batch } => {
            println!("📥 Running load...");
            (PipelineStage::LoadOnly, datasets, start_batch)
        }
        Commands::Run { datasets } => {
            println!("🚀 Running full pipeline (transform + load)...");
            (PipelineStage::TransformAndLoad, datasets, 0)
        }
    };

    let stop = StopHandle::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 Interrupt received, stopping after the current batch");
                stop.request_stop();
            }
        });
    }

    let connector = SqliteConnector::new(&config.load.database_path)
        .with_busy_timeout(Duration::from_millis(config.load.busy_timeout_ms));
    let report_dir = config.paths.report_dir.clone();
    let coordinator = PipelineCoordinator::new(config, Arc::new(connector), Arc::new(TracingSink))
        .with_stop_handle(stop);

    let report = coordinator.run(stage, &datasets, start_batch).await?;
    let path = report.write_to(&report_dir).context("Failed to write pipeline report")?;
    info!("📝 Report written to {}", path.display());

    print_summary(&report);
    Ok(report.status)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(PipelineStatus::Succeeded) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("Pipeline failed: {:#}", e);
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
