//! Per-accession outcome records and the end-of-run summary.

use crate::accession::AccessionRequest;
use crate::config::ReportConfig;
use crate::pipeline::download::DownloadCounts;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReportError {
	#[error("Failed to write report {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Failed to write CSV report {path}: {source}")]
	Csv {
		path: PathBuf,
		#[source]
		source: csv::Error,
	},
	#[error("Failed to serialize JSON report: {0}")]
	Json(#[from] serde_json::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum AccessionStatus {
	Success,
	Partial,
	Failed,
}

/// What happened to one accession number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessionReport {
	pub run_id: Uuid,
	pub accession: String,
	pub status: AccessionStatus,
	pub reasons: Vec<String>,
	pub matched_series: Vec<String>,
	pub retrieved_series: Vec<String>,
	pub failed_series: Vec<String>,
	/// Series folders converted to NIfTI.
	pub converted_series: Vec<String>,
	pub conversion_failed: Vec<String>,
	pub completed: usize,
	pub skipped: usize,
	pub failed: usize,
	pub timestamp: DateTime<Utc>,
}

impl AccessionReport {
	pub fn new(run_id: Uuid, accession: &AccessionRequest) -> Self {
		Self {
			run_id,
			accession: accession.as_str().to_owned(),
			status: AccessionStatus::Failed,
			reasons: Vec::new(),
			matched_series: Vec::new(),
			retrieved_series: Vec::new(),
			failed_series: Vec::new(),
			converted_series: Vec::new(),
			conversion_failed: Vec::new(),
			completed: 0,
			skipped: 0,
			failed: 0,
			timestamp: Utc::now(),
		}
	}

	pub fn reason(&mut self, reason: impl Display) {
		self.reasons.push(reason.to_string());
	}

	pub fn add_counts(&mut self, counts: DownloadCounts) {
		self.completed += counts.completed;
		self.skipped += counts.skipped;
		self.failed += counts.failed;
	}

	/// Derives the status from what was recorded and stamps the report.
	pub fn finish(&mut self) {
		self.status = if self.reasons.is_empty() {
			AccessionStatus::Success
		} else if !self.retrieved_series.is_empty() || self.completed + self.skipped > 0 {
			AccessionStatus::Partial
		} else {
			AccessionStatus::Failed
		};
		self.timestamp = Utc::now();
	}
}

/// Flat shape of an [`AccessionReport`] for CSV output.
#[derive(Serialize)]
struct CsvRow<'a> {
	run_id: String,
	accession: &'a str,
	status: AccessionStatus,
	reasons: String,
	matched_series: String,
	retrieved_series: String,
	failed_series: String,
	converted_series: String,
	conversion_failed: String,
	completed: usize,
	skipped: usize,
	failed: usize,
	timestamp: String,
}

impl<'a> From<&'a AccessionReport> for CsvRow<'a> {
	fn from(report: &'a AccessionReport) -> Self {
		Self {
			run_id: report.run_id.to_string(),
			accession: &report.accession,
			status: report.status,
			reasons: report.reasons.join("; "),
			matched_series: report.matched_series.join("; "),
			retrieved_series: report.retrieved_series.join("; "),
			failed_series: report.failed_series.join("; "),
			converted_series: report.converted_series.join("; "),
			conversion_failed: report.conversion_failed.join("; "),
			completed: report.completed,
			skipped: report.skipped,
			failed: report.failed,
			timestamp: report.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
		}
	}
}

pub fn write_csv(path: &Path, reports: &[AccessionReport]) -> Result<(), ReportError> {
	let csv_error = |source| ReportError::Csv {
		path: path.to_owned(),
		source,
	};
	let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
	for report in reports {
		writer.serialize(CsvRow::from(report)).map_err(csv_error)?;
	}
	writer.flush().map_err(|source| ReportError::Io {
		path: path.to_owned(),
		source,
	})
}

pub fn write_json(path: &Path, reports: &[AccessionReport]) -> Result<(), ReportError> {
	let json = serde_json::to_string_pretty(reports)?;
	std::fs::write(path, json).map_err(|source| ReportError::Io {
		path: path.to_owned(),
		source,
	})
}

/// Writes the configured report files.
pub fn write_reports(config: &ReportConfig, reports: &[AccessionReport]) -> Result<(), ReportError> {
	if let Some(path) = &config.csv {
		write_csv(path, reports)?;
		info!(path = %path.display(), "Wrote CSV report");
	}
	if let Some(path) = &config.json {
		write_json(path, reports)?;
		info!(path = %path.display(), "Wrote JSON report");
	}
	Ok(())
}

/// Totals of a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
	pub accessions: usize,
	pub resolved: usize,
	pub counts: DownloadCounts,
	pub elapsed: Duration,
}

impl RunSummary {
	pub fn log(&self) {
		info!(
			accessions = self.accessions,
			resolved = self.resolved,
			total = self.counts.total(),
			completed = self.counts.completed,
			skipped = self.counts.skipped,
			failed = self.counts.failed,
			elapsed_secs = self.elapsed.as_secs_f64(),
			"Finished run"
		);
	}
}
