// src/cvm/selector.rs

// --- Imports ---
use crate::cvm::models::FilingRow;
use crate::utils::error::DatasetError;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Reads the filing rows out of the bulk dataset ZIP.
///
/// The portal ships one `;`-delimited CSV member encoded as Windows-1252
/// (not UTF-8 — naive decoding mangles company names). Malformed rows are
/// logged and skipped rather than failing the whole ingest.
pub fn read_bulk_rows(zip_path: &Path) -> Result<Vec<FilingRow>, DatasetError> {
    tracing::info!("Reading bulk dataset: {}", zip_path.display());

    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let csv_name = archive
        .file_names()
        .find(|name| name.ends_with(".csv"))
        .map(String::from)
        .ok_or_else(|| DatasetError::MissingCsv(zip_path.display().to_string()))?;
    tracing::debug!("Found CSV member: {}", csv_name);

    let mut member = archive.by_name(&csv_name)?;
    let mut raw = Vec::new();
    member.read_to_end(&mut raw)?;

    let (text, _, had_errors) = encoding_rs::WINDOWS_1252.decode(&raw);
    if had_errors {
        tracing::warn!("Bulk CSV contained bytes invalid for Windows-1252");
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<FilingRow>().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => tracing::warn!("Skipping malformed bulk row {}: {}", index + 1, e),
        }
    }

    tracing::info!("Loaded {} filing rows from bulk dataset", rows.len());
    Ok(rows)
}

/// Selects the single authoritative filing per issuer tax id.
///
/// Within each CNPJ group the winner has the latest receipt date, ties
/// broken by the highest version. A full tie keeps the earliest row of
/// the source table, so repeated runs over the same input are stable.
/// Output preserves first-seen issuer order.
pub fn select_latest(rows: Vec<FilingRow>) -> Vec<FilingRow> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, FilingRow> = HashMap::new();

    for row in rows {
        match best.entry(row.cnpj.clone()) {
            Entry::Vacant(slot) => {
                order.push(row.cnpj.clone());
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                // Strict greater-than keeps the earlier row on a full tie.
                if (row.received_at, row.version) > (current.received_at, current.version) {
                    slot.insert(row);
                }
            }
        }
    }

    let selected: Vec<FilingRow> = order.into_iter().filter_map(|cnpj| best.remove(&cnpj)).collect();
    tracing::info!("Selected {} authoritative filings", selected.len());
    selected
}
