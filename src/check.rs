//! Repairs the folder structure of a finished download.
//!
//! DWI instances that ended up in the wrong b-value folder are moved by their DiffusionBValue
//! and a plain `ADC` folder is removed when numbered `ADC_*` folders hold all of its instances.

use crate::config::ReportConfig;
use chrono::{DateTime, Utc};
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const DWI0: &str = "DWI0";
const DWI1000: &str = "DWI1000";
const ADC: &str = "ADC";

#[derive(Debug, Error)]
pub enum CheckError {
	#[error("Failed to access {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Failed to read DICOM file {path}: {message}")]
	Dicom { path: PathBuf, message: String },
	#[error("{0} has no SOPInstanceUID")]
	MissingUid(PathBuf),
	#[error("Failed to write CSV report {path}: {source}")]
	Csv {
		path: PathBuf,
		#[source]
		source: csv::Error,
	},
	#[error("Failed to serialize JSON report: {0}")]
	Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckError + '_ {
	move |source| CheckError::Io {
		path: path.to_owned(),
		source,
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum CheckKind {
	#[serde(rename = "DWI")]
	Dwi,
	#[serde(rename = "ADC")]
	Adc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action")]
pub enum FileOperation {
	Move { target: PathBuf },
	Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAction {
	pub source: PathBuf,
	#[serde(flatten)]
	pub operation: FileOperation,
	pub reason: String,
}

/// One checked series folder and what has to happen to its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesCheck {
	pub series_folder: String,
	pub kind: CheckKind,
	pub files_checked: usize,
	pub actions: Vec<FileAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyCheck {
	pub study_folder: String,
	/// Only series with at least one action.
	pub series: Vec<SeriesCheck>,
	pub moves: usize,
	pub deletes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
	pub studies: usize,
	pub series_with_issues: usize,
	pub files_checked: usize,
	pub moves: usize,
	pub deletes: usize,
	pub dwi_fixes: usize,
	pub adc_duplicates_removed: usize,
}

impl CheckSummary {
	pub fn log(&self, dry_run: bool) {
		info!(
			studies = self.studies,
			series = self.series_with_issues,
			files = self.files_checked,
			moves = self.moves,
			deletes = self.deletes,
			dry_run,
			"Finished check"
		);
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
	pub input: PathBuf,
	pub timestamp: DateTime<Utc>,
	pub dry_run: bool,
	pub studies: Vec<StudyCheck>,
	pub summary: CheckSummary,
}

fn open(path: &Path) -> Result<DefaultDicomObject, CheckError> {
	OpenFileOptions::new()
		.read_until(tags::PIXEL_DATA)
		.open_file(path)
		.map_err(|err| CheckError::Dicom {
			path: path.to_owned(),
			message: err.to_string(),
		})
}

fn b_value(object: &InMemDicomObject) -> Option<f64> {
	object
		.element_opt(tags::DIFFUSION_B_VALUE)
		.ok()??
		.to_float64()
		.ok()
}

/// DiffusionBValue of the instance, or of the first MR diffusion item.
fn read_b_value(path: &Path) -> Result<Option<f64>, CheckError> {
	let object = open(path)?;
	Ok(b_value(&object).or_else(|| {
		let sequence = object.element_opt(tags::MR_DIFFUSION_SEQUENCE).ok()??;
		b_value(sequence.items()?.first()?)
	}))
}

fn read_sop_instance_uid(path: &Path) -> Result<String, CheckError> {
	let object = open(path)?;
	object
		.element_opt(tags::SOP_INSTANCE_UID)
		.ok()
		.flatten()
		.and_then(|element| element.to_str().ok())
		.map(|uid| uid.trim_end_matches('\0').trim().to_owned())
		.filter(|uid| !uid.is_empty())
		.ok_or_else(|| CheckError::MissingUid(path.to_owned()))
}

/// The DWI folder an instance belongs in. A missing b-value counts as b=0, values other
/// than 0 and 1000 have no folder.
fn dwi_folder(b_value: Option<f64>) -> Option<&'static str> {
	match b_value {
		None => Some(DWI0),
		Some(value) if value.abs() < 0.5 => Some(DWI0),
		Some(value) if (value - 1000.0).abs() < 0.5 => Some(DWI1000),
		Some(_) => None,
	}
}

/// Subfolders of `dir` with their names, sorted by name.
fn subfolders(dir: &Path) -> Result<Vec<(String, PathBuf)>, CheckError> {
	let mut folders = Vec::new();
	for entry in fs::read_dir(dir).map_err(io_error(dir))? {
		let path = entry.map_err(io_error(dir))?.path();
		if !path.is_dir() {
			continue;
		}
		if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
			folders.push((name.to_owned(), path.clone()));
		}
	}
	folders.sort();
	Ok(folders)
}

fn dcm_files(dir: &Path) -> Result<Vec<PathBuf>, CheckError> {
	let mut files = Vec::new();
	for entry in fs::read_dir(dir).map_err(io_error(dir))? {
		let path = entry.map_err(io_error(dir))?.path();
		if path.is_file() && path.extension().is_some_and(|extension| extension == "dcm") {
			files.push(path);
		}
	}
	files.sort();
	Ok(files)
}

/// Plans moves between `DWI0` and `DWI1000`. Studies without both folders are skipped.
pub fn check_dwi(study_dir: &Path) -> Result<Vec<SeriesCheck>, CheckError> {
	let folders: Vec<(String, PathBuf)> = subfolders(study_dir)?
		.into_iter()
		.filter(|(name, _)| name == DWI0 || name == DWI1000)
		.collect();
	if folders.len() < 2 {
		return Ok(Vec::new());
	}

	let mut checks = Vec::new();
	for (name, dir) in folders {
		let files = dcm_files(&dir)?;
		let mut actions = Vec::new();
		for file in &files {
			let b_value = match read_b_value(file) {
				Ok(b_value) => b_value,
				Err(err) => {
					warn!("Skipping file: {err}");
					continue;
				}
			};
			let Some(target) = dwi_folder(b_value).filter(|target| *target != name) else {
				continue;
			};
			let Some(file_name) = file.file_name() else {
				continue;
			};
			let b_value = b_value.map_or_else(|| String::from("missing"), |value| value.to_string());
			actions.push(FileAction {
				source: file.clone(),
				operation: FileOperation::Move {
					target: study_dir.join(target).join(file_name),
				},
				reason: format!("b-value {b_value} belongs in {target}"),
			});
		}
		checks.push(SeriesCheck {
			series_folder: name,
			kind: CheckKind::Dwi,
			files_checked: files.len(),
			actions,
		});
	}
	Ok(checks)
}

/// Plans the removal of a plain `ADC` folder whose instances all exist in `ADC_*` folders.
pub fn check_adc(study_dir: &Path) -> Result<Vec<SeriesCheck>, CheckError> {
	let folders = subfolders(study_dir)?;
	let Some((_, plain)) = folders.iter().find(|(name, _)| name == ADC) else {
		return Ok(Vec::new());
	};
	let numbered: Vec<&(String, PathBuf)> = folders
		.iter()
		.filter(|(name, _)| name.starts_with("ADC_"))
		.collect();
	if numbered.is_empty() {
		return Ok(Vec::new());
	}

	let files = dcm_files(plain)?;
	let uids = files
		.iter()
		.map(|file| read_sop_instance_uid(file))
		.collect::<Result<HashSet<String>, CheckError>>()?;

	let mut numbered_uids = HashSet::new();
	for (_, dir) in &numbered {
		for file in dcm_files(dir)? {
			numbered_uids.insert(read_sop_instance_uid(&file)?);
		}
	}

	let duplicate = !uids.is_empty() && uids.is_subset(&numbered_uids);
	let actions = if duplicate {
		let names: Vec<&str> = numbered.iter().map(|(name, _)| name.as_str()).collect();
		let reason = format!("all {} instances are also in {}", uids.len(), names.join(", "));
		files
			.iter()
			.map(|file| FileAction {
				source: file.clone(),
				operation: FileOperation::Delete,
				reason: reason.clone(),
			})
			.collect()
	} else {
		Vec::new()
	};

	Ok(vec![SeriesCheck {
		series_folder: String::from(ADC),
		kind: CheckKind::Adc,
		files_checked: files.len(),
		actions,
	}])
}

/// Moves or deletes files. Does nothing but log in dry-run mode.
#[derive(Debug, Copy, Clone)]
pub struct StructureChecker {
	dry_run: bool,
}

impl StructureChecker {
	pub const fn new(dry_run: bool) -> Self {
		Self { dry_run }
	}

	/// Checks every study folder below `input`, or below `input/dicom` if that exists.
	/// A study whose check fails is logged and skipped.
	pub fn run(&self, input: &Path) -> Result<CheckReport, CheckError> {
		let nested = input.join("dicom");
		let root = if nested.is_dir() { nested } else { input.to_owned() };
		info!(path = %root.display(), dry_run = self.dry_run, "Checking download tree");

		let mut studies = Vec::new();
		let mut summary = CheckSummary::default();
		for (study_folder, study_dir) in subfolders(&root)? {
			summary.studies += 1;
			let mut study = StudyCheck {
				study_folder,
				series: Vec::new(),
				moves: 0,
				deletes: 0,
			};

			for (kind, checks) in [
				(CheckKind::Dwi, check_dwi(&study_dir)),
				(CheckKind::Adc, check_adc(&study_dir)),
			] {
				let checks = match checks {
					Ok(checks) => checks,
					Err(err) => {
						warn!(study = %study.study_folder, ?kind, "Check failed: {err}");
						continue;
					}
				};
				for check in checks {
					summary.files_checked += check.files_checked;
					if check.actions.is_empty() {
						continue;
					}
					let (moves, deletes) = self.apply(&check.actions)?;
					study.moves += moves;
					study.deletes += deletes;
					match kind {
						CheckKind::Dwi => summary.dwi_fixes += moves,
						CheckKind::Adc => summary.adc_duplicates_removed += deletes,
					}
					study.series.push(check);
				}
			}

			if !study.series.is_empty() {
				summary.series_with_issues += study.series.len();
				summary.moves += study.moves;
				summary.deletes += study.deletes;
				studies.push(study);
			}
		}

		Ok(CheckReport {
			input: root,
			timestamp: Utc::now(),
			dry_run: self.dry_run,
			studies,
			summary,
		})
	}

	/// Returns the number of moves and deletes. Folders emptied by them are removed.
	fn apply(&self, actions: &[FileAction]) -> Result<(usize, usize), CheckError> {
		let mut moves = 0;
		let mut deletes = 0;
		let mut emptied = BTreeSet::new();

		for action in actions {
			let source = &action.source;
			match &action.operation {
				FileOperation::Move { target } => {
					if self.dry_run {
						info!(source = %source.display(), target = %target.display(), "Would move file");
					} else {
						if let Some(parent) = target.parent() {
							fs::create_dir_all(parent).map_err(io_error(parent))?;
						}
						fs::rename(source, target).map_err(io_error(source))?;
						info!(source = %source.display(), target = %target.display(), "Moved file");
					}
					moves += 1;
				}
				FileOperation::Delete => {
					if self.dry_run {
						info!(path = %source.display(), "Would delete file");
					} else {
						fs::remove_file(source).map_err(io_error(source))?;
						info!(path = %source.display(), "Deleted file");
					}
					deletes += 1;
				}
			}
			if let Some(parent) = source.parent() {
				emptied.insert(parent.to_owned());
			}
		}

		if !self.dry_run {
			for folder in emptied {
				let empty = fs::read_dir(&folder).is_ok_and(|mut entries| entries.next().is_none());
				if !empty {
					continue;
				}
				match fs::remove_dir(&folder) {
					Ok(()) => debug!(path = %folder.display(), "Removed empty folder"),
					Err(err) => warn!(path = %folder.display(), "Failed to remove empty folder: {err}"),
				}
			}
		}
		Ok((moves, deletes))
	}
}

/// Flat shape of a [`FileAction`] for CSV output.
#[derive(Serialize)]
struct CheckRow<'a> {
	study_folder: &'a str,
	series_folder: &'a str,
	check_type: CheckKind,
	action: &'static str,
	source_path: String,
	target_path: String,
	reason: &'a str,
}

pub fn write_csv(path: &Path, report: &CheckReport) -> Result<(), CheckError> {
	let csv_error = |source| CheckError::Csv {
		path: path.to_owned(),
		source,
	};
	let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
	for study in &report.studies {
		for series in &study.series {
			for action in &series.actions {
				let (operation, target) = match &action.operation {
					FileOperation::Move { target } => ("Move", target.display().to_string()),
					FileOperation::Delete => ("Delete", String::new()),
				};
				writer
					.serialize(CheckRow {
						study_folder: &study.study_folder,
						series_folder: &series.series_folder,
						check_type: series.kind,
						action: operation,
						source_path: action.source.display().to_string(),
						target_path: target,
						reason: &action.reason,
					})
					.map_err(csv_error)?;
			}
		}
	}
	writer.flush().map_err(io_error(path))
}

pub fn write_json(path: &Path, report: &CheckReport) -> Result<(), CheckError> {
	let json = serde_json::to_string_pretty(report)?;
	fs::write(path, json).map_err(io_error(path))
}

/// Writes the configured report files.
pub fn write_reports(config: &ReportConfig, report: &CheckReport) -> Result<(), CheckError> {
	if let Some(path) = &config.csv {
		write_csv(path, report)?;
		info!(path = %path.display(), "Wrote CSV check report");
	}
	if let Some(path) = &config.json {
		write_json(path, report)?;
		info!(path = %path.display(), "Wrote JSON check report");
	}
	Ok(())
}
