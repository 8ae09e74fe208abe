use crate::config::ClassificationConfig;
use crate::pipeline::download::InstanceDownloadTask;
use crate::summary::StudySummary;
use crate::types::ResourceId;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// Replacement for segments that are empty after sanitizing.
pub const PLACEHOLDER: &str = "unknown";

const INVALID_PATH_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const WINDOWS_RESERVED_NAMES: [&str; 22] = [
	"CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
	"COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Makes `text` usable as a single path segment on every platform.
pub fn sanitize_segment(text: &str) -> String {
	let cleaned: String = text
		.trim()
		.chars()
		.map(|c| if INVALID_PATH_CHARS.contains(&c) { '_' } else { c })
		.collect();

	if cleaned.is_empty() {
		String::from(PLACEHOLDER)
	} else if WINDOWS_RESERVED_NAMES.contains(&cleaned.to_ascii_uppercase().as_str()) {
		format!("_{cleaned}")
	} else {
		cleaned
	}
}

pub fn instance_file_name(instance_id: &str) -> String {
	format!("{}.dcm", sanitize_segment(instance_id))
}

/// Zero-pads a series number to three digits. Values that are not numbers are left-padded
/// with zeros as they are.
fn pad_series_number(number: Option<&str>) -> String {
	let number = number.map(str::trim).unwrap_or_default();
	match number.parse::<u32>() {
		Ok(value) => format!("{value:03}"),
		Err(_) => format!("{number:0>3}"),
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LabelOrigin {
	/// Assigned by the classification oracle or matched by keyword.
	Classified,
	/// The series description, used because classification produced nothing.
	Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesLabel {
	pub text: String,
	pub origin: LabelOrigin,
}

impl SeriesLabel {
	pub fn classified(text: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			origin: LabelOrigin::Classified,
		}
	}

	pub fn fallback(text: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			origin: LabelOrigin::Fallback,
		}
	}
}

/// A local series that is going to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSeries {
	pub series_id: ResourceId,
	pub label: SeriesLabel,
	pub number: Option<String>,
	pub instances: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesFolder {
	pub folder: String,
	pub series_id: ResourceId,
	pub instances: Vec<ResourceId>,
}

/// Everything that is downloaded for one study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlanEntry {
	pub study_folder: String,
	pub series: Vec<SeriesFolder>,
}

impl LocalPlanEntry {
	pub fn instance_count(&self) -> usize {
		self.series.iter().map(|series| series.instances.len()).sum()
	}

	/// Download tasks per series folder, rooted at `output`.
	pub fn tasks(&self, output: &Path) -> Vec<(&SeriesFolder, Vec<InstanceDownloadTask>)> {
		let study = output.join(&self.study_folder);
		self.series
			.iter()
			.map(|series| {
				let folder = study.join(&series.folder);
				let tasks = series
					.instances
					.iter()
					.map(|instance| InstanceDownloadTask {
						instance_id: instance.clone(),
						destination: folder.join(instance_file_name(instance)),
					})
					.collect();
				(series, tasks)
			})
			.collect()
	}
}

/// Turns labelled local series into folder names.
#[derive(Debug, Clone)]
pub struct DownloadPlanBuilder {
	number_sensitive: HashSet<String>,
	disambiguate_fallback_labels: bool,
}

impl DownloadPlanBuilder {
	pub fn new(config: &ClassificationConfig) -> Self {
		Self {
			number_sensitive: config.number_sensitive.iter().cloned().collect(),
			disambiguate_fallback_labels: config.disambiguate_fallback_labels,
		}
	}

	/// `{patient}_{date}_{modality}_{accession}` from the sampled payload, or
	/// `{accession}_{study id prefix}` if there is no payload or it lacks a study date.
	pub fn study_folder(&self, accession: &str, study_id: &str, sample: Option<&[u8]>) -> String {
		let key = sample.and_then(|payload| match StudySummary::from_bytes(payload) {
			Ok(summary) => summary.folder_key(),
			Err(err) => {
				debug!("Sample is not a readable DICOM file: {err}");
				None
			}
		});

		let key = key.unwrap_or_else(|| {
			let prefix: String = study_id.chars().take(8).collect();
			format!("{accession}_{prefix}")
		});
		sanitize_segment(&key)
	}

	/// Series without instances are left out. A label that occurs more than once and is
	/// number-sensitive gets the zero-padded series number appended.
	pub fn build(&self, study_folder: String, series: Vec<PlannedSeries>) -> LocalPlanEntry {
		let series: Vec<PlannedSeries> = series
			.into_iter()
			.filter(|series| !series.instances.is_empty())
			.collect();

		let mut occurrences: HashMap<&str, usize> = HashMap::new();
		for planned in &series {
			*occurrences.entry(planned.label.text.as_str()).or_default() += 1;
		}

		let folders = series
			.iter()
			.map(|planned| {
				let label = &planned.label;
				let eligible = label.origin == LabelOrigin::Classified
					|| self.disambiguate_fallback_labels;
				let folder = if eligible
					&& occurrences[label.text.as_str()] > 1
					&& self.number_sensitive.contains(&label.text)
				{
					format!("{}_{}", label.text, pad_series_number(planned.number.as_deref()))
				} else {
					label.text.clone()
				};

				SeriesFolder {
					folder: sanitize_segment(&folder),
					series_id: planned.series_id.clone(),
					instances: planned.instances.clone(),
				}
			})
			.collect();

		LocalPlanEntry {
			study_folder,
			series: folders,
		}
	}
}
