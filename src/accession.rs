//! Accession numbers given on the command line or in CSV/JSON files.

use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column or key names (after [`normalize_key`]) that hold accession numbers.
const ACCESSION_KEYS: [&str; 3] = ["accessionnumber", "accession", "acc"];

/// An accession number, trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessionRequest(String);

impl AccessionRequest {
	pub fn new(value: &str) -> Option<Self> {
		let value = value.trim();
		(!value.is_empty()).then(|| Self(value.to_owned()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for AccessionRequest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Error)]
pub enum InputError {
	#[error("Failed to read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Failed to parse CSV file {path}: {source}")]
	Csv {
		path: PathBuf,
		#[source]
		source: csv::Error,
	},
	#[error("Failed to parse JSON file {path}: {source}")]
	Json {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
	#[error("{0} must contain an array of strings or objects")]
	UnexpectedJson(PathBuf),
	#[error("Unsupported input file {0}, expected .csv or .json")]
	UnsupportedFormat(PathBuf),
	#[error("No accession number provided")]
	Empty,
}

/// The ordered, duplicate-free working set of accession numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessionList(Vec<AccessionRequest>);

impl AccessionList {
	/// Merges `direct` identifiers with those read from `input_file`, keeping the first occurrence
	/// of every accession number.
	pub fn collect(direct: &[String], input_file: Option<&Path>) -> Result<Self, InputError> {
		let mut values: Vec<String> = direct.to_vec();
		if let Some(path) = input_file {
			values.extend(read_file(path)?);
		}

		let list = Self::from_values(values);
		if list.0.is_empty() {
			return Err(InputError::Empty);
		}
		Ok(list)
	}

	pub fn from_values<I, S>(values: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut seen = HashSet::new();
		let requests = values
			.into_iter()
			.filter_map(|value| AccessionRequest::new(value.as_ref()))
			.filter(|request| seen.insert(request.clone()))
			.collect();
		Self(requests)
	}

	pub fn iter(&self) -> impl Iterator<Item = &AccessionRequest> {
		self.0.iter()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl<'a> IntoIterator for &'a AccessionList {
	type Item = &'a AccessionRequest;
	type IntoIter = std::slice::Iter<'a, AccessionRequest>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

fn normalize_key(name: &str) -> String {
	name.trim().to_lowercase().replace('_', "")
}

fn is_accession_key(name: &str) -> bool {
	ACCESSION_KEYS.contains(&normalize_key(name).as_str())
}

fn read_file(path: &Path) -> Result<Vec<String>, InputError> {
	let extension = path
		.extension()
		.and_then(|extension| extension.to_str())
		.map(str::to_ascii_lowercase);

	let parse: fn(&Path, &str) -> Result<Vec<String>, InputError> = match extension.as_deref() {
		Some("csv") => parse_csv,
		Some("json") => parse_json,
		_ => return Err(InputError::UnsupportedFormat(path.to_owned())),
	};

	let text = std::fs::read_to_string(path).map_err(|source| InputError::Io {
		path: path.to_owned(),
		source,
	})?;
	parse(path, text.trim_start_matches('\u{feff}'))
}

/// Uses the first column whose header is a known accession key, or the first column of every
/// row if there is no such header.
fn parse_csv(path: &Path, text: &str) -> Result<Vec<String>, InputError> {
	let to_error = |source| InputError::Csv {
		path: path.to_owned(),
		source,
	};
	let mut reader = csv::ReaderBuilder::new()
		.has_headers(false)
		.flexible(true)
		.from_reader(text.as_bytes());

	let mut rows = reader.records();
	let Some(first) = rows.next().transpose().map_err(to_error)? else {
		return Ok(Vec::new());
	};

	let header_column = first.iter().position(is_accession_key);
	let column = header_column.unwrap_or(0);

	let mut accessions = Vec::new();
	if header_column.is_none() {
		accessions.extend(first.get(column).map(str::to_owned));
	}
	for row in rows {
		let row = row.map_err(to_error)?;
		accessions.extend(row.get(column).map(str::to_owned));
	}
	Ok(accessions)
}

fn parse_json(path: &Path, text: &str) -> Result<Vec<String>, InputError> {
	let value: Value = serde_json::from_str(text).map_err(|source| InputError::Json {
		path: path.to_owned(),
		source,
	})?;
	let Value::Array(items) = value else {
		return Err(InputError::UnexpectedJson(path.to_owned()));
	};

	let accessions = items
		.iter()
		.filter_map(|item| match item {
			Value::String(value) => Some(value.clone()),
			Value::Object(fields) => fields
				.iter()
				.filter(|(key, _)| is_accession_key(key))
				.filter_map(|(_, value)| value.as_str())
				.find(|value| !value.trim().is_empty())
				.map(str::to_owned),
			_ => None,
		})
		.collect();
	Ok(accessions)
}
