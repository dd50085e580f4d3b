// src/utils/error.rs
use crate::cvm::models::ProcessingStatus;
use thiserror::Error;

// Define specific error types for different parts of the application
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error), // Automatically convert reqwest errors

    #[error("HTTP error: {0}")]
    Http(reqwest::StatusCode), // e.g., 404 Not Found, 403 Forbidden

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Download timed out: {0}")]
    TimedOut(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors while reading the bulk dataset (the yearly fre_cia_aberta ZIP).
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("No CSV member found in bulk archive: {0}")]
    MissingCsv(String),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors while locating the FRE XML member inside a filing container.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("No archive member matches expected pattern: {0}")]
    MemberNotFound(String),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the structured ESG extraction pass.
/// Malformed XML is fatal for the attempt; individual bad fields are not.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Malformed filing XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("Filing record not found: {0}")]
    NotFound(i64),

    #[error("Unknown status value in store: {0}")]
    UnknownStatus(String),

    #[error("Corrupt record field: {0}")]
    Corrupt(String),

    #[error("Metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error), // Automatically convert IO errors

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Bulk dataset processing failed: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Archive resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
