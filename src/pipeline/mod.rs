// src/pipeline/mod.rs

// --- Imports ---
use crate::cvm::models::{FilingRecord, FilingRow, Issuer, ProcessingStatus};
use crate::cvm::{client, selector};
use crate::extractors::{archive, esg};
use crate::storage::StorageManager;
use crate::store::FilingStore;
use crate::utils::error::FetchError;
use crate::utils::AppError;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;

/// Externally supplied knobs: batch size, retry ceiling, and a
/// per-document download timeout so one stalled fetch cannot hold up
/// the rest of the batch.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub download_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            batch_size: 5,
            max_retries: 3,
            download_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Sequences download -> archive resolution -> structured extraction for
/// each record handed out by the store, advancing state at every stage
/// boundary. One record's failure never aborts the batch.
pub struct Pipeline {
    store: FilingStore,
    storage: StorageManager,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(store: FilingStore, storage: StorageManager, config: PipelineConfig) -> Self {
        Self {
            store,
            storage,
            config,
        }
    }

    /// Initial ingest: download the yearly bulk dataset, select the
    /// authoritative filing per issuer, and register issuers and filing
    /// records. Per-issuer failures are logged and skipped.
    pub async fn ingest_bulk(&self, year: i32) -> Result<BatchSummary, AppError> {
        tracing::info!("Starting bulk ingest for {}", year);
        let zip_path = client::download_bulk_dataset(year, self.storage.base_dir()).await?;
        let rows = selector::read_bulk_rows(&zip_path)?;
        let latest = selector::select_latest(rows);

        let mut summary = BatchSummary::default();
        let total = latest.len();
        for row in &latest {
            match self.register_filing(row) {
                Ok(()) => {
                    summary.succeeded += 1;
                    if summary.succeeded % 10 == 0 {
                        tracing::info!("Ingest progress: {}/{} issuers", summary.succeeded, total);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to register issuer {}: {}", row.company_name, e);
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            "Bulk ingest finished: {}/{} issuers registered",
            summary.succeeded,
            total
        );
        Ok(summary)
    }

    fn register_filing(&self, row: &FilingRow) -> Result<(), AppError> {
        self.store.upsert_issuer(&Issuer::from(row))?;
        self.store.create_or_replace(row)?;
        Ok(())
    }

    /// Processes one batch of records in the given statuses.
    ///
    /// Each record is first claimed with a conditional status update so a
    /// concurrent worker pulling the same batch cannot double-process it;
    /// a lost claim is skipped, not an error.
    pub async fn process_pending(
        &self,
        statuses: &[ProcessingStatus],
    ) -> Result<BatchSummary, AppError> {
        let batch = self
            .store
            .next_pending(self.config.batch_size, statuses, self.config.max_retries)?;
        tracing::info!("Processing {} pending filings", batch.len());

        let mut summary = BatchSummary::default();
        for record in batch {
            if !self
                .store
                .claim(record.id, record.status, ProcessingStatus::Downloading)?
            {
                tracing::debug!("Filing {} claimed elsewhere, skipping", record.id);
                summary.skipped += 1;
                continue;
            }

            match self.process_one(&record).await {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    tracing::error!("Failed to process filing {}: {}", record.id, e);
                    summary.failed += 1;
                    if let Err(advance_err) =
                        self.store
                            .advance(record.id, ProcessingStatus::Error, Some(&e.to_string()), None)
                    {
                        tracing::error!(
                            "Could not record error for filing {}: {}",
                            record.id,
                            advance_err
                        );
                    }
                }
            }
        }

        tracing::info!(
            "Batch finished. Success: {}, Failures: {}, Skipped: {}",
            summary.succeeded,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    /// Runs one record through the remaining stages. The caller has
    /// already claimed it into `Downloading`.
    async fn process_one(&self, record: &FilingRecord) -> Result<(), AppError> {
        let issuer_dir = self.storage.issuer_dir(record.cod_cvm)?;

        // Download the filing container into the issuer's directory.
        let archive_path = issuer_dir.join(format!("{}.zip", record.doc_id));
        tokio::time::timeout(
            self.config.download_timeout,
            client::download_to(&record.url, &archive_path),
        )
        .await
        .map_err(|_| FetchError::TimedOut(record.url.clone()))??;

        let mut patch = serde_json::Map::new();
        patch.insert("archive_path".into(), json!(archive_path.display().to_string()));
        self.store
            .advance(record.id, ProcessingStatus::Downloaded, None, Some(&patch))?;

        self.store
            .advance(record.id, ProcessingStatus::Processing, None, None)?;

        // Locate and extract the FRE XML member.
        let xml_path = archive::extract_filing_xml(
            &archive_path,
            record.cod_cvm,
            record.reference_date,
            record.version,
            &issuer_dir,
        )?;
        let mut patch = serde_json::Map::new();
        patch.insert("xml_path".into(), json!(xml_path.display().to_string()));
        self.store
            .advance(record.id, ProcessingStatus::XmlExtracted, None, Some(&patch))?;

        // Structured ESG extraction.
        let xml_text = esg::load_filing_xml(&xml_path)?;
        let payload = esg::EsgExtractor::new(&self.storage, record.cod_cvm).extract(&xml_text)?;

        let mut patch = serde_json::Map::new();
        patch.insert("esg".into(), serde_json::to_value(&payload).map_err(
            crate::utils::error::StoreError::Serialization,
        )?);
        patch.insert("stats".into(), json!({ "processed_at": Utc::now().to_rfc3339() }));
        self.store
            .advance(record.id, ProcessingStatus::Processed, None, Some(&patch))?;

        Ok(())
    }
}
