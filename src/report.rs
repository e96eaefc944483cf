//! Batch run reports.
//!
//! One record per input, in input order, so an enclosing pipeline can
//! correlate entries with the list it submitted. The batch itself never
//! raises on job failure; callers read the report and decide policy.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::ConfigError;
use crate::error::error_chain;
use crate::job::{JobOutcome, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to write report {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize report")]
    Json(#[from] serde_json::Error),
    #[error("failed to write report table")]
    Csv(#[from] csv::Error),
}

/// Terminal outcome of one input.
#[derive(Debug, Serialize)]
pub struct JobRecord {
    pub input: PathBuf,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub provenance: BTreeMap<String, String>,
}
impl From<JobOutcome> for JobRecord {
    fn from(outcome: JobOutcome) -> Self {
        Self {
            input: outcome.input,
            status: outcome.status,
            attempts: outcome.attempts,
            output: outcome.output,
            error_kind: outcome.error.as_ref().map(|error| error.kind().to_string()),
            error: outcome.error.as_ref().map(|error| error_chain(error)),
            provenance: outcome.provenance,
        }
    }
}
impl JobRecord {
    /// Record for a job that never started because the batch was cancelled.
    pub fn skipped(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            status: JobStatus::Skipped,
            attempts: 0,
            output: None,
            error_kind: None,
            error: None,
            provenance: BTreeMap::new(),
        }
    }
    /// Record for a job aborted at configuration resolution, before any
    /// conversion or engine work.
    pub fn config_failure(input: impl Into<PathBuf>, error: &ConfigError) -> Self {
        Self {
            input: input.into(),
            status: JobStatus::Failed,
            attempts: 0,
            output: None,
            error_kind: Some(error.kind().to_string()),
            error: Some(error_chain(error)),
            provenance: BTreeMap::new(),
        }
    }
}

/// Ordered per-input records plus aggregate counts.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    records: Vec<JobRecord>,
}
impl RunReport {
    pub fn new(records: Vec<JobRecord>) -> Self {
        let count =
            |status| records.iter().filter(|r| r.status == status).count();
        Self {
            succeeded: count(JobStatus::Succeeded),
            failed: count(JobStatus::Failed),
            skipped: count(JobStatus::Skipped),
            records,
        }
    }
    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }
    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.len()
    }

    pub fn summary(&self) {
        println!("RUN SUMMARY:");
        println!(" - # of inputs: {}", self.len());
        println!(
            " - succeeded: {}, failed: {}, skipped: {}",
            self.succeeded, self.failed, self.skipped
        );
        println!("    {:^14}  {:^8}  {}", "STATUS", "ATTEMPTS", "INPUT");
        for record in &self.records {
            let detail = match (&record.output, &record.error_kind) {
                (Some(output), _) => format!(" -> {}", output.display()),
                (None, Some(kind)) => format!(" ({})", kind),
                (None, None) => String::new(),
            };
            println!(
                "  - {:14}  {:>8}  {}{}",
                record.status.to_string(),
                record.attempts,
                record.input.display(),
                detail
            );
        }
    }

    pub fn to_json(&self, path: &Path) -> Result<(), ReportError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_csv(&self, path: &Path) -> Result<(), ReportError> {
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(["input", "status", "attempts", "output", "error_kind", "error"])?;
        for record in &self.records {
            wtr.write_record([
                record.input.display().to_string(),
                record.status.to_string(),
                record.attempts.to_string(),
                record
                    .output
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                record.error_kind.clone().unwrap_or_default(),
                record.error.clone().unwrap_or_default(),
            ])?;
        }
        wtr.flush().map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
