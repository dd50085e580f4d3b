// src/cvm/models.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One row of the bulk fre_cia_aberta dataset, as published by the CVM.
/// Field names mirror the CSV headers of the open-data file.
#[derive(Debug, Clone, Deserialize)]
pub struct FilingRow {
    #[serde(rename = "CNPJ_CIA")]
    pub cnpj: String,
    #[serde(rename = "CD_CVM")]
    pub cod_cvm: u32,
    #[serde(rename = "DENOM_CIA")]
    pub company_name: String,
    #[serde(rename = "CATEG_DOC", default = "default_category")]
    pub category: String,
    #[serde(rename = "DT_REFER")]
    pub reference_date: NaiveDate,
    #[serde(rename = "DT_RECEB")]
    pub received_at: NaiveDate,
    #[serde(rename = "VERSAO")]
    pub version: u32,
    #[serde(rename = "ID_DOC")]
    pub doc_id: String,
    #[serde(rename = "LINK_DOC")]
    pub url: String,
}

fn default_category() -> String {
    "FRE".to_string()
}

/// The reporting entity behind a filing. Upserted by (cod_cvm, cnpj),
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuer {
    pub cod_cvm: u32,
    pub cnpj: String,
    pub name: String,
    pub sector: String,
    pub situation: String,
    pub active: bool,
}

impl From<&FilingRow> for Issuer {
    fn from(row: &FilingRow) -> Self {
        // The bulk file carries no sector/situation columns; those arrive
        // empty and can be enriched from other CVM datasets later.
        Issuer {
            cod_cvm: row.cod_cvm,
            cnpj: row.cnpj.clone(),
            name: row.company_name.clone(),
            sector: String::new(),
            situation: String::new(),
            active: true,
        }
    }
}

/// Processing state of one filing record. Closed set; transitions outside
/// `can_transition` are rejected by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Downloading,
    Downloaded,
    Processing,
    XmlExtracted,
    Processed,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Downloading => "downloading",
            ProcessingStatus::Downloaded => "downloaded",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::XmlExtracted => "xml_extracted",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Error => "error",
        }
    }

    /// `Processed` is the only terminal state; `Error` records stay
    /// eligible for re-queueing.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStatus::Processed)
    }

    /// The transition table of the pipeline. Forward steps follow the
    /// stage order; `Error` is reachable from any non-terminal state and
    /// can be claimed back into `Downloading` on re-queue.
    pub fn can_transition(self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        match (self, next) {
            (Pending, Downloading)
            | (Downloading, Downloaded)
            | (Downloaded, Processing)
            | (Processing, XmlExtracted)
            | (XmlExtracted, Processed)
            | (Error, Downloading) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "downloading" => Ok(ProcessingStatus::Downloading),
            "downloaded" => Ok(ProcessingStatus::Downloaded),
            "processing" => Ok(ProcessingStatus::Processing),
            "xml_extracted" => Ok(ProcessingStatus::XmlExtracted),
            "processed" => Ok(ProcessingStatus::Processed),
            "error" => Ok(ProcessingStatus::Error),
            other => Err(other.to_string()),
        }
    }
}

/// A persisted filing record, one per (cod_cvm, reference_year).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingRecord {
    pub id: i64,
    pub cod_cvm: u32,
    pub reference_year: i32,
    pub reference_date: NaiveDate,
    pub received_at: NaiveDate,
    pub version: u32,
    pub doc_id: String,
    pub category: String,
    pub url: String,
    pub status: ProcessingStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Stage outputs accumulated across `advance` calls: archive path,
    /// XML path, extracted ESG payload, timing stats.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Downloading,
            ProcessingStatus::Downloaded,
            ProcessingStatus::Processing,
            ProcessingStatus::XmlExtracted,
            ProcessingStatus::Processed,
            ProcessingStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>(), Ok(status));
        }
    }

    #[test]
    fn transition_table_follows_stage_order() {
        use ProcessingStatus::*;
        assert!(Pending.can_transition(Downloading));
        assert!(Downloading.can_transition(Downloaded));
        assert!(Downloaded.can_transition(Processing));
        assert!(Processing.can_transition(XmlExtracted));
        assert!(XmlExtracted.can_transition(Processed));

        // No skipping stages, no going backwards.
        assert!(!Pending.can_transition(Downloaded));
        assert!(!Downloaded.can_transition(Pending));
        assert!(!XmlExtracted.can_transition(Downloading));
    }

    #[test]
    fn error_reachable_from_any_non_terminal_state() {
        use ProcessingStatus::*;
        for from in [Pending, Downloading, Downloaded, Processing, XmlExtracted, Error] {
            assert!(from.can_transition(Error), "{from} should reach error");
        }
        assert!(!Processed.can_transition(Error));
    }

    #[test]
    fn error_records_can_be_reclaimed() {
        assert!(ProcessingStatus::Error.can_transition(ProcessingStatus::Downloading));
        assert!(!ProcessingStatus::Processed.can_transition(ProcessingStatus::Downloading));
    }
}
