// src/main.rs
mod cvm;
mod extractors;
mod pipeline;
mod storage;
mod store;
mod utils;

use chrono::Datelike;
use clap::{Parser, Subcommand};
use cvm::models::ProcessingStatus;
use pipeline::{Pipeline, PipelineConfig};
use std::time::Duration;
use storage::StorageManager;
use store::FilingStore;
use utils::AppError;

/// Command Line Interface for the FRE ESG ingestion pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Working directory for downloads and extracted attachments
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Path of the filing state database
    #[arg(long, default_value = "./data/filings.db")]
    db_path: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the yearly bulk dataset and register filings
    Ingest {
        /// Dataset year (defaults to the current year)
        #[arg(long)]
        year: Option<i32>,
    },
    /// Process a batch of pending filings
    Process {
        /// Maximum records per batch
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Retry ceiling; exhausted records stay in error until reset
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Also re-queue records currently in error
        #[arg(long)]
        retry_errors: bool,

        /// Per-document download timeout in seconds
        #[arg(long, default_value_t = 300)]
        download_timeout: u64,
    },
    /// Ingest, then process one batch
    Run {
        #[arg(long)]
        year: Option<i32>,

        #[arg(long, default_value_t = 5)]
        limit: usize,

        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Setup Logging (reads RUST_LOG env var)
    utils::logging::setup_logging();

    // 2. Parse CLI Arguments
    let args = Args::parse();
    tracing::info!("Starting pipeline with args: {:?}", args);

    // 3. Initialize storage and the state store
    let storage = StorageManager::new(&args.data_dir)?;
    let filing_store = FilingStore::open(&args.db_path)?;

    match args.command {
        Command::Ingest { year } => {
            let pipeline = Pipeline::new(filing_store, storage, PipelineConfig::default());
            let year = year.unwrap_or_else(|| chrono::Utc::now().year());
            let summary = pipeline.ingest_bulk(year).await?;
            if summary.succeeded == 0 && summary.failed > 0 {
                return Err(AppError::Config(format!(
                    "Failed to register any of {} issuers",
                    summary.failed
                )));
            }
        }
        Command::Process {
            limit,
            max_retries,
            retry_errors,
            download_timeout,
        } => {
            let config = PipelineConfig {
                batch_size: limit,
                max_retries,
                download_timeout: Duration::from_secs(download_timeout),
            };
            let pipeline = Pipeline::new(filing_store, storage, config);

            let statuses: &[ProcessingStatus] = if retry_errors {
                &[ProcessingStatus::Pending, ProcessingStatus::Error]
            } else {
                &[ProcessingStatus::Pending]
            };
            let summary = pipeline.process_pending(statuses).await?;
            if summary.succeeded == 0 && summary.failed > 0 {
                return Err(AppError::Config(format!(
                    "Failed to process all {} filings in the batch",
                    summary.failed
                )));
            }
        }
        Command::Run {
            year,
            limit,
            max_retries,
        } => {
            let config = PipelineConfig {
                batch_size: limit,
                max_retries,
                ..PipelineConfig::default()
            };
            let pipeline = Pipeline::new(filing_store, storage, config);

            let year = year.unwrap_or_else(|| chrono::Utc::now().year());
            pipeline.ingest_bulk(year).await?;
            pipeline.process_pending(&[ProcessingStatus::Pending]).await?;
        }
    }

    tracing::info!("Pipeline finished");
    Ok(())
}
