// src/store/mod.rs

// --- Imports ---
use crate::cvm::models::{FilingRecord, FilingRow, Issuer, ProcessingStatus};
use crate::utils::error::StoreError;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const FILING_COLUMNS: &str = "id, cod_cvm, reference_year, reference_date, received_at, version, \
     doc_id, category, url, status, attempts, last_error, metadata, created_at, updated_at";

/// Persistent state tracker for issuers and filing records.
///
/// Owns every status transition: writers go through `create_or_replace`,
/// `claim` and `advance`, which validate the transition table and keep
/// retry/error bookkeeping consistent. The handle is explicitly
/// constructed and passed around; there is no global connection.
pub struct FilingStore {
    conn: Mutex<Connection>,
}

impl FilingStore {
    /// Opens (and migrates) a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("cannot create store dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL keeps readers unblocked while a worker writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS issuers (
                 cod_cvm    INTEGER NOT NULL,
                 cnpj       TEXT NOT NULL,
                 name       TEXT NOT NULL,
                 sector     TEXT NOT NULL DEFAULT '',
                 situation  TEXT NOT NULL DEFAULT '',
                 active     INTEGER NOT NULL DEFAULT 1,
                 first_seen TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 UNIQUE (cod_cvm, cnpj)
             );
             CREATE TABLE IF NOT EXISTS filings (
                 id             INTEGER PRIMARY KEY,
                 cod_cvm        INTEGER NOT NULL,
                 reference_year INTEGER NOT NULL,
                 reference_date TEXT NOT NULL,
                 received_at    TEXT NOT NULL,
                 version        INTEGER NOT NULL,
                 doc_id         TEXT NOT NULL,
                 category       TEXT NOT NULL,
                 url            TEXT NOT NULL,
                 status         TEXT NOT NULL,
                 attempts       INTEGER NOT NULL DEFAULT 0,
                 last_error     TEXT,
                 metadata       TEXT NOT NULL DEFAULT '{}',
                 created_at     TEXT NOT NULL,
                 updated_at     TEXT NOT NULL,
                 UNIQUE (cod_cvm, reference_year)
             );
             CREATE INDEX IF NOT EXISTS idx_filings_status_created
                 ON filings (status, created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Inserts or refreshes an issuer, keyed on (cod_cvm, cnpj).
    /// Descriptive attributes are updated; the first-seen timestamp and
    /// the row itself are never removed.
    pub fn upsert_issuer(&self, issuer: &Issuer) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO issuers (cod_cvm, cnpj, name, sector, situation, active, first_seen, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT (cod_cvm, cnpj) DO UPDATE SET
                 name = excluded.name,
                 sector = excluded.sector,
                 situation = excluded.situation,
                 active = excluded.active,
                 updated_at = excluded.updated_at",
            params![
                issuer.cod_cvm,
                issuer.cnpj,
                issuer.name,
                issuer.sector,
                issuer.situation,
                issuer.active,
                now,
            ],
        )?;
        tracing::debug!("Upserted issuer {} ({})", issuer.cod_cvm, issuer.name);
        Ok(())
    }

    pub fn get_issuer(&self, cod_cvm: u32, cnpj: &str) -> Result<Option<Issuer>, StoreError> {
        let conn = self.lock()?;
        let issuer = conn
            .query_row(
                "SELECT cod_cvm, cnpj, name, sector, situation, active
                 FROM issuers WHERE cod_cvm = ?1 AND cnpj = ?2",
                params![cod_cvm, cnpj],
                |row| {
                    Ok(Issuer {
                        cod_cvm: row.get(0)?,
                        cnpj: row.get(1)?,
                        name: row.get(2)?,
                        sector: row.get(3)?,
                        situation: row.get(4)?,
                        active: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(issuer)
    }

    /// Upserts a filing record keyed on (cod_cvm, reference_year).
    ///
    /// A newer version of the same year's filing fully replaces the
    /// existing record: status back to `pending`, attempts and error
    /// cleared, metadata emptied. This models "newer version supersedes
    /// in-flight processing of an older version".
    pub fn create_or_replace(&self, row: &FilingRow) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let id = conn.query_row(
            "INSERT INTO filings (cod_cvm, reference_year, reference_date, received_at, version,
                                  doc_id, category, url, status, attempts, last_error, metadata,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, '{}', ?10, ?10)
             ON CONFLICT (cod_cvm, reference_year) DO UPDATE SET
                 reference_date = excluded.reference_date,
                 received_at = excluded.received_at,
                 version = excluded.version,
                 doc_id = excluded.doc_id,
                 category = excluded.category,
                 url = excluded.url,
                 status = excluded.status,
                 attempts = 0,
                 last_error = NULL,
                 metadata = '{}',
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at
             RETURNING id",
            params![
                row.cod_cvm,
                row.reference_date.year(),
                row.reference_date.format("%Y-%m-%d").to_string(),
                row.received_at.format("%Y-%m-%d").to_string(),
                row.version,
                row.doc_id,
                row.category,
                row.url,
                ProcessingStatus::Pending.as_str(),
                now,
            ],
            |r| r.get(0),
        )?;
        tracing::debug!(
            "Registered filing {} for issuer {} year {}",
            row.doc_id,
            row.cod_cvm,
            row.reference_date.year()
        );
        Ok(id)
    }

    /// Returns up to `limit` records whose status is in `statuses` and
    /// whose attempt count is below `max_retries`, oldest first.
    pub fn next_pending(
        &self,
        limit: usize,
        statuses: &[ProcessingStatus],
        max_retries: u32,
    ) -> Result<Vec<FilingRecord>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {FILING_COLUMNS} FROM filings
             WHERE status IN ({placeholders}) AND attempts < ?
             ORDER BY created_at ASC, id ASC
             LIMIT ?"
        );

        let mut values: Vec<Value> = statuses
            .iter()
            .map(|s| Value::from(s.as_str().to_string()))
            .collect();
        values.push(Value::from(i64::from(max_retries)));
        values.push(Value::from(limit as i64));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(rusqlite::params_from_iter(values), RawFiling::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raws.into_iter().map(RawFiling::into_record).collect()
    }

    /// Atomically claims a record by conditional update: succeeds only if
    /// the record is still in `from`. This is the guard that keeps two
    /// workers from processing the same record. A successful claim counts
    /// as an attempt.
    pub fn claim(
        &self,
        record_id: i64,
        from: ProcessingStatus,
        to: ProcessingStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE filings SET status = ?1, attempts = attempts + 1, updated_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![to.as_str(), now, record_id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Advances a record to `new_status`.
    ///
    /// Runs in one transaction: validates the transition against the
    /// table, increments the attempt count unconditionally (every
    /// transition is an attempt, successful ones included), merges
    /// `metadata_patch` key-by-key into the stored metadata map, and
    /// records `error` as the last error when given. Keys not present in
    /// the patch are left untouched, so each stage only adds its own.
    pub fn advance(
        &self,
        record_id: i64,
        new_status: ProcessingStatus,
        error: Option<&str>,
        metadata_patch: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT status, metadata FROM filings WHERE id = ?1",
                params![record_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (status_text, metadata_text) = row.ok_or(StoreError::NotFound(record_id))?;

        let current: ProcessingStatus = status_text
            .parse()
            .map_err(StoreError::UnknownStatus)?;
        if !current.can_transition(new_status) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: new_status,
            });
        }

        let mut metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&metadata_text).unwrap_or_default();
        if let Some(patch) = metadata_patch {
            for (key, value) in patch {
                metadata.insert(key.clone(), value.clone());
            }
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE filings SET status = ?1, attempts = attempts + 1, updated_at = ?2,
                 metadata = ?3, last_error = COALESCE(?4, last_error)
             WHERE id = ?5",
            params![
                new_status.as_str(),
                now,
                serde_json::to_string(&metadata)?,
                error,
                record_id,
            ],
        )?;
        tx.commit()?;

        tracing::info!(
            "Filing {} advanced to {}{}",
            record_id,
            new_status,
            error.map(|e| format!(" (error: {e})")).unwrap_or_default()
        );
        Ok(())
    }

    pub fn get(&self, record_id: i64) -> Result<FilingRecord, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {FILING_COLUMNS} FROM filings WHERE id = ?1"),
                params![record_id],
                RawFiling::read,
            )
            .optional()?
            .ok_or(StoreError::NotFound(record_id))?;
        raw.into_record()
    }
}

/// Row image as stored; converted to the typed record outside the
/// rusqlite closure so parse failures map to StoreError.
struct RawFiling {
    id: i64,
    cod_cvm: i64,
    reference_year: i64,
    reference_date: String,
    received_at: String,
    version: i64,
    doc_id: String,
    category: String,
    url: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl RawFiling {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawFiling {
            id: row.get(0)?,
            cod_cvm: row.get(1)?,
            reference_year: row.get(2)?,
            reference_date: row.get(3)?,
            received_at: row.get(4)?,
            version: row.get(5)?,
            doc_id: row.get(6)?,
            category: row.get(7)?,
            url: row.get(8)?,
            status: row.get(9)?,
            attempts: row.get(10)?,
            last_error: row.get(11)?,
            metadata: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_record(self) -> Result<FilingRecord, StoreError> {
        let status = self
            .status
            .parse::<ProcessingStatus>()
            .map_err(StoreError::UnknownStatus)?;
        Ok(FilingRecord {
            id: self.id,
            cod_cvm: self.cod_cvm as u32,
            reference_year: self.reference_year as i32,
            reference_date: parse_date(&self.reference_date)?,
            received_at: parse_date(&self.received_at)?,
            version: self.version as u32,
            doc_id: self.doc_id,
            category: self.category,
            url: self.url,
            status,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_date(text: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("bad date {text}: {e}")))
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {text}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filing_row(cnpj: &str, cod_cvm: u32, version: u32, doc_id: &str) -> FilingRow {
        FilingRow {
            cnpj: cnpj.to_string(),
            cod_cvm,
            company_name: "Test Issuer SA".to_string(),
            category: "FRE".to_string(),
            reference_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            received_at: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            version,
            doc_id: doc_id.to_string(),
            url: format!("https://example.invalid/{doc_id}"),
        }
    }

    fn patch(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn new_records_start_pending_with_zero_attempts() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 1, 1, "d1")).unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
        assert!(record.metadata.is_empty());
        assert_eq!(record.reference_year, 2024);
    }

    #[test]
    fn replace_resets_state_and_keeps_one_record_per_year() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 1, 3, "old")).unwrap();

        store
            .advance(
                id,
                ProcessingStatus::Error,
                Some("boom"),
                Some(&patch(&[("archive_path", json!("/tmp/a.zip"))])),
            )
            .unwrap();

        let replaced = store.create_or_replace(&filing_row("X", 1, 5, "new")).unwrap();
        assert_eq!(replaced, id, "same (issuer, year) key must reuse the record");

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.version, 5);
        assert_eq!(record.doc_id, "new");
        assert!(record.last_error.is_none());
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn next_pending_is_fifo_and_respects_limit() {
        let store = FilingStore::open_in_memory().unwrap();
        let first = store.create_or_replace(&filing_row("A", 1, 1, "a")).unwrap();
        let second = store.create_or_replace(&filing_row("B", 2, 1, "b")).unwrap();
        let _third = store.create_or_replace(&filing_row("C", 3, 1, "c")).unwrap();

        let batch = store
            .next_pending(2, &[ProcessingStatus::Pending], 3)
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, first);
        assert_eq!(batch[1].id, second);
    }

    #[test]
    fn next_pending_filters_by_status() {
        let store = FilingStore::open_in_memory().unwrap();
        let a = store.create_or_replace(&filing_row("A", 1, 1, "a")).unwrap();
        let b = store.create_or_replace(&filing_row("B", 2, 1, "b")).unwrap();
        store
            .advance(a, ProcessingStatus::Error, Some("failed"), None)
            .unwrap();

        let pending = store
            .next_pending(10, &[ProcessingStatus::Pending], 3)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);

        let requeue = store
            .next_pending(10, &[ProcessingStatus::Pending, ProcessingStatus::Error], 3)
            .unwrap();
        assert_eq!(requeue.len(), 2);
    }

    #[test]
    fn retry_ceiling_excludes_exhausted_records() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 1, 1, "d")).unwrap();

        // Two attempts: pending -> downloading -> error.
        assert!(store
            .claim(id, ProcessingStatus::Pending, ProcessingStatus::Downloading)
            .unwrap());
        store
            .advance(id, ProcessingStatus::Error, Some("net down"), None)
            .unwrap();
        assert_eq!(store.get(id).unwrap().attempts, 2);

        let exhausted = store
            .next_pending(10, &[ProcessingStatus::Error], 2)
            .unwrap();
        assert!(exhausted.is_empty());

        // Raising the ceiling makes the record eligible again.
        let eligible = store
            .next_pending(10, &[ProcessingStatus::Error], 3)
            .unwrap();
        assert_eq!(eligible.len(), 1);
    }

    #[test]
    fn exhausted_record_reset_by_newer_version_is_eligible_again() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 1, 1, "d")).unwrap();
        for _ in 0..3 {
            assert!(store
                .claim(id, store.get(id).unwrap().status, ProcessingStatus::Downloading)
                .unwrap());
            store
                .advance(id, ProcessingStatus::Error, Some("flaky"), None)
                .unwrap();
        }
        assert!(store
            .next_pending(10, &[ProcessingStatus::Pending, ProcessingStatus::Error], 3)
            .unwrap()
            .is_empty());

        store.create_or_replace(&filing_row("X", 1, 2, "d2")).unwrap();
        let eligible = store
            .next_pending(10, &[ProcessingStatus::Pending], 3)
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].attempts, 0);
    }

    #[test]
    fn advance_rejects_transitions_outside_the_table() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 1, 1, "d")).unwrap();

        let err = store
            .advance(id, ProcessingStatus::Processed, None, None)
            .expect_err("pending cannot jump to processed");
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: ProcessingStatus::Pending,
                to: ProcessingStatus::Processed,
            }
        ));

        // Rejected transition leaves the record untouched.
        let record = store.get(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Pending);
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn disjoint_metadata_patches_accumulate() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 1, 1, "d")).unwrap();

        store
            .advance(
                id,
                ProcessingStatus::Downloading,
                None,
                Some(&patch(&[("archive_path", json!("/tmp/d.zip"))])),
            )
            .unwrap();
        store
            .advance(
                id,
                ProcessingStatus::Downloaded,
                None,
                Some(&patch(&[("xml_path", json!("/tmp/d.xml"))])),
            )
            .unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.metadata["archive_path"], json!("/tmp/d.zip"));
        assert_eq!(record.metadata["xml_path"], json!("/tmp/d.xml"));
    }

    #[test]
    fn last_error_persists_until_overwritten() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 1, 1, "d")).unwrap();

        store
            .advance(id, ProcessingStatus::Error, Some("first failure"), None)
            .unwrap();
        store
            .advance(id, ProcessingStatus::Downloading, None, None)
            .unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.last_error.as_deref(), Some("first failure"));
    }

    #[test]
    fn claim_is_conditional_on_current_status() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 1, 1, "d")).unwrap();

        assert!(store
            .claim(id, ProcessingStatus::Pending, ProcessingStatus::Downloading)
            .unwrap());
        // A second worker loses the race.
        assert!(!store
            .claim(id, ProcessingStatus::Pending, ProcessingStatus::Downloading)
            .unwrap());

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Downloading);
        assert_eq!(record.attempts, 1);
    }

    #[test]
    fn full_walk_to_processed_counts_five_attempts() {
        let store = FilingStore::open_in_memory().unwrap();
        let id = store.create_or_replace(&filing_row("X", 14206, 6, "d")).unwrap();

        assert!(store
            .claim(id, ProcessingStatus::Pending, ProcessingStatus::Downloading)
            .unwrap());
        store
            .advance(
                id,
                ProcessingStatus::Downloaded,
                None,
                Some(&patch(&[("archive_path", json!("/tmp/d.zip"))])),
            )
            .unwrap();
        store
            .advance(id, ProcessingStatus::Processing, None, None)
            .unwrap();
        store
            .advance(
                id,
                ProcessingStatus::XmlExtracted,
                None,
                Some(&patch(&[("xml_path", json!("/tmp/d.xml"))])),
            )
            .unwrap();
        store
            .advance(
                id,
                ProcessingStatus::Processed,
                None,
                Some(&patch(&[("esg", json!({"attachments": {}}))])),
            )
            .unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Processed);
        assert_eq!(record.attempts, 5);
        assert!(record.metadata.contains_key("archive_path"));
        assert!(record.metadata.contains_key("xml_path"));
        assert!(record.metadata.contains_key("esg"));
    }

    #[test]
    fn issuer_upsert_refreshes_without_duplicating() {
        let store = FilingStore::open_in_memory().unwrap();
        let mut issuer = Issuer {
            cod_cvm: 14206,
            cnpj: "60.840.055/0001-31".to_string(),
            name: "Old Name SA".to_string(),
            sector: String::new(),
            situation: String::new(),
            active: true,
        };
        store.upsert_issuer(&issuer).unwrap();

        issuer.name = "New Name SA".to_string();
        store.upsert_issuer(&issuer).unwrap();

        let stored = store
            .get_issuer(14206, "60.840.055/0001-31")
            .unwrap()
            .expect("issuer should exist");
        assert_eq!(stored.name, "New Name SA");
    }
}
