// src/cvm/client.rs
use crate::utils::error::FetchError;
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const CVM_USER_AGENT: &str = "fre_extractor/0.1 (ESG research pipeline)";
// The open-data portal has no published rate limit, but stay polite.
const CVM_REQUEST_DELAY_MS: u64 = 150;
const FRE_DATASET_BASE_URL: &str = "https://dados.cvm.gov.br/dados/CIA_ABERTA/DOC/FRE/DADOS";

/// Shared reqwest client configured for the CVM portal.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent(CVM_USER_AGENT)
        .timeout(Duration::from_secs(300))
        .build()
        .expect("Failed to build HTTP client")
});

/// Downloads the bulk FRE dataset for the given year into `dest_dir`.
/// The file is named `fre_cia_aberta_{year}.zip` on the portal.
pub async fn download_bulk_dataset(year: i32, dest_dir: &Path) -> Result<PathBuf, FetchError> {
    let filename = format!("fre_cia_aberta_{year}.zip");
    let url = format!("{FRE_DATASET_BASE_URL}/{filename}");
    let dest = dest_dir.join(filename);
    download_to(&url, &dest).await?;
    Ok(dest)
}

/// Downloads a single document to `dest`, streaming the body to disk.
/// Includes the mandatory User-Agent and basic rate limiting.
pub async fn download_to(url: &str, dest: &Path) -> Result<(), FetchError> {
    tracing::info!("Downloading document from: {}", url);

    // --- Basic Rate Limiting ---
    tokio::time::sleep(Duration::from_millis(CVM_REQUEST_DELAY_MS)).await;
    // --------------------------

    let response = HTTP_CLIENT.get(url).send().await?;

    // Check if the request was successful (status code 2xx)
    let status = response.status();
    if !status.is_success() {
        tracing::error!("HTTP error status: {} for URL: {}", status, url);
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!("Received 404 Not Found for URL: {}", url);
            return Err(FetchError::NotFound(url.to_string()));
        }
        // Return generic HTTP error
        return Err(FetchError::Http(status));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut response = response;
    let mut written = 0usize;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;

    tracing::debug!("Wrote {} bytes from {} to {}", written, url, dest.display());
    Ok(())
}
