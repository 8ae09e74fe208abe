//! NIfTI conversion of downloaded series with dcm2niix.

use crate::config::ConversionConfig;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ConversionError {
	#[error("Failed to run {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},
	#[error("Converter exited with {status}: {message}")]
	Failed { status: ExitStatus, message: String },
	#[error("Converter produced no NIfTI file for {0}")]
	NoOutput(String),
	#[error("Failed to access {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// Files written for one converted series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertedSeries {
	pub nifti: Vec<PathBuf>,
	/// BIDS sidecars written next to the images.
	pub sidecars: Vec<PathBuf>,
	pub removed_dicom: usize,
}

/// Runs dcm2niix on series folders and places the output in a tree mirroring the study
/// folders of the download tree.
#[derive(Debug, Clone)]
pub struct NiftiConverter {
	program: String,
	args: Vec<String>,
	output: PathBuf,
	delete_dicom: bool,
}

impl NiftiConverter {
	pub fn new(config: &ConversionConfig) -> Self {
		Self {
			program: config.program.clone(),
			args: config.args.clone(),
			output: config.output.clone(),
			delete_dicom: config.delete_dicom,
		}
	}

	/// Whether the program can be started at all. Its exit status does not matter.
	pub async fn is_available(&self) -> bool {
		let status = Command::new(&self.program)
			.arg("-h")
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status()
			.await;
		match status {
			Ok(_) => true,
			Err(err) => {
				debug!(program = %self.program, "Converter is not available: {err}");
				false
			}
		}
	}

	/// Converts the DICOM files in `series_dir` into `{output}/{study_folder}`, naming the
	/// output after `series_folder`.
	#[instrument(skip_all, fields(study = study_folder, series = series_folder))]
	pub async fn convert_series(
		&self,
		series_dir: &Path,
		study_folder: &str,
		series_folder: &str,
	) -> Result<ConvertedSeries, ConversionError> {
		let target = self.output.join(study_folder);
		fs::create_dir_all(&target)
			.await
			.map_err(|source| ConversionError::Io {
				path: target.clone(),
				source,
			})?;

		let started = Instant::now();
		let output = Command::new(&self.program)
			.args(&self.args)
			.arg("-f")
			.arg(series_folder)
			.arg("-o")
			.arg(&target)
			.arg(series_dir)
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.output()
			.await
			.map_err(|source| ConversionError::Spawn {
				program: self.program.clone(),
				source,
			})?;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
			let message = if stderr.is_empty() {
				String::from_utf8_lossy(&output.stdout).trim().to_owned()
			} else {
				stderr
			};
			return Err(ConversionError::Failed {
				status: output.status,
				message,
			});
		}

		let mut converted = converted_files(&target, series_folder).await?;
		if converted.nifti.is_empty() {
			return Err(ConversionError::NoOutput(series_folder.to_owned()));
		}
		info!(
			files = converted.nifti.len(),
			elapsed_secs = started.elapsed().as_secs_f64(),
			"Converted series to NIfTI"
		);

		if self.delete_dicom {
			converted.removed_dicom = remove_dicom_files(series_dir).await?;
			debug!(removed = converted.removed_dicom, "Removed converted DICOM files");
		}
		Ok(converted)
	}
}

/// `name` itself or `name` followed by a suffix dcm2niix appends (`_e2`, `_ph`, ...).
fn belongs_to(file_name: &str, name: &str) -> bool {
	file_name
		.strip_prefix(name)
		.is_some_and(|rest| rest.starts_with('.') || rest.starts_with('_'))
}

async fn converted_files(dir: &Path, name: &str) -> Result<ConvertedSeries, ConversionError> {
	let io_error = |source: std::io::Error| ConversionError::Io {
		path: dir.to_owned(),
		source,
	};
	let mut entries = fs::read_dir(dir).await.map_err(io_error)?;

	let mut converted = ConvertedSeries::default();
	while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
		let file_name = entry.file_name().to_string_lossy().into_owned();
		if !belongs_to(&file_name, name) {
			continue;
		}
		if file_name.ends_with(".nii") || file_name.ends_with(".nii.gz") {
			converted.nifti.push(entry.path());
		} else if file_name.ends_with(".json") {
			converted.sidecars.push(entry.path());
		}
	}
	converted.nifti.sort();
	converted.sidecars.sort();
	Ok(converted)
}

/// Deletes the `.dcm` files of a series folder and the folder itself once it is empty.
async fn remove_dicom_files(series_dir: &Path) -> Result<usize, ConversionError> {
	let io_error = |source: std::io::Error| ConversionError::Io {
		path: series_dir.to_owned(),
		source,
	};
	let mut entries = fs::read_dir(series_dir).await.map_err(io_error)?;

	let mut removed = 0;
	while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
		let path = entry.path();
		if path.extension().is_some_and(|extension| extension == "dcm") {
			fs::remove_file(&path)
				.await
				.map_err(|source| ConversionError::Io { path, source })?;
			removed += 1;
		}
	}

	if let Err(err) = fs::remove_dir(series_dir).await {
		warn!(path = %series_dir.display(), "Kept series folder after conversion: {err}");
	}
	Ok(removed)
}
