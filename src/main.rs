use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use pulmoscan::config::PipelineConfig;
use pulmoscan::db::Database;
use pulmoscan::logging::configure_logging;
use pulmoscan::model::init_model;
use pulmoscan::pipeline::worker::pipeline_loop;
use pulmoscan::pipeline::Pipeline;
use pulmoscan::volume::ScanFormat;

#[derive(Parser)]
#[command(name = "pulmoscan", about = "Lung CT nodule analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline worker daemon.
    Worker {
        /// Number of worker tasks pulling from the run queue.
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Register a scan location for a case.
    Register {
        case_id: String,
        scan_path: PathBuf,
        /// Scan format: "npy" or "series".
        #[arg(long, default_value = "npy")]
        format: String,
    },
    /// Trigger processing for a registered case.
    Trigger {
        case_id: String,
        /// Explicitly restart a completed or failed case.
        #[arg(long)]
        force: bool,
    },
    /// Show the run status for a case.
    Status { case_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();
    let cli = Cli::parse();

    let config = PipelineConfig::from_env()?;
    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    match cli.command {
        Commands::Worker { workers } => {
            let model = init_model(&config).context("Failed to load model")?;
            let pipeline = Pipeline::new(db, model, config);

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_err() {
                    error!("Failed to listen for ctrl-c");
                }
                info!("Shutdown requested, stopping workers");
                let _ = cancel_tx.send(true);
            });

            info!("Starting {} pipeline worker(s)", workers);
            let mut handles = Vec::new();
            for worker_id in 0..workers {
                handles.push(tokio::spawn(pipeline_loop(
                    pipeline.clone(),
                    worker_id,
                    cancel_rx.clone(),
                )));
            }
            for handle in handles {
                handle.await?;
            }
        }
        Commands::Register { case_id, scan_path, format } => {
            let format = ScanFormat::parse(&format)
                .ok_or_else(|| anyhow!("unknown scan format '{}', expected npy or series", format))?;
            let scan_path = scan_path
                .canonicalize()
                .with_context(|| format!("scan path {} not readable", scan_path.display()))?;
            db.register_scan(&case_id, &scan_path.to_string_lossy(), format).await?;
            println!("registered {} -> {}", case_id, scan_path.display());
        }
        Commands::Trigger { case_id, force } => {
            let model = init_model(&config).context("Failed to load model")?;
            let pipeline = Pipeline::new(db, model, config);
            let status = if force {
                pipeline.retrigger(&case_id).await?
            } else {
                pipeline.trigger(&case_id).await?
            };
            println!("{}: {}", case_id, status.as_str());
        }
        Commands::Status { case_id } => match db.run_status(&case_id).await? {
            Some(record) => {
                println!("{}: {}", record.case_id, record.status.as_str());
                if let Some(stage) = record.stage {
                    println!("  stage: {}", stage);
                }
                if let Some(error) = record.error {
                    println!("  error: {}", error);
                }
                for warning in record.warnings {
                    println!("  warning: {}", warning);
                }
            }
            None => println!("{}: unknown case", case_id),
        },
    }

    Ok(())
}
