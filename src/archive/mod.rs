//! The archive capability consumed by the retrieval pipeline.
//!
//! The pipeline never talks HTTP itself: it is written against [`Archive`], which mirrors the
//! query/retrieve/job surface of an Orthanc server. [`orthanc::OrthancClient`] is the production
//! implementation; tests substitute in-memory fakes.

pub mod orthanc;
mod resources;
pub mod tags;

use crate::types::{JobId, QueryRetrieveLevel, ResourceId, AE, UI};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
pub use resources::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use tags::TagSet;
use thiserror::Error;

#[async_trait]
pub trait Archive: Send + Sync {
	/// Searches the local store and returns the ids of matching resources.
	async fn find(&self, query: &ArchiveQuery) -> Result<Vec<ResourceId>, ArchiveError>;

	/// Issues a C-FIND against a remote modality and returns a handle to its answers.
	async fn query(&self, modality: &str, query: &ArchiveQuery)
		-> Result<QueryHandle, ArchiveError>;

	async fn answers(&self, handle: &QueryHandle) -> Result<Vec<String>, ArchiveError>;

	async fn answer_content(
		&self,
		handle: &QueryHandle,
		index: &str,
	) -> Result<TagSet, ArchiveError>;

	/// Asks the archive to C-MOVE a resource from `modality` to `request.target_aet`.
	/// Returns the job id for asynchronous moves and `None` for synchronous ones.
	async fn move_resource(
		&self,
		modality: &str,
		request: &MoveRequest,
	) -> Result<Option<JobId>, ArchiveError>;

	async fn job_status(&self, job: &str) -> Result<JobStatus, ArchiveError>;

	async fn study(&self, study: &str) -> Result<LocalStudy, ArchiveError>;

	async fn study_series(&self, study: &str) -> Result<Vec<SeriesEntry>, ArchiveError>;

	async fn series(&self, series: &str) -> Result<LocalSeries, ArchiveError>;

	async fn instance_file(&self, instance: &str) -> Result<Bytes, ArchiveError>;

	async fn delete_instance(&self, instance: &str) -> Result<(), ArchiveError>;

	/// Runs a remote query and collects the content of every answer in order.
	async fn query_all(
		&self,
		modality: &str,
		query: &ArchiveQuery,
	) -> Result<Vec<TagSet>, ArchiveError> {
		let handle = self.query(modality, query).await?;
		let answers = self.answers(&handle).await?;
		let handle = &handle;

		stream::iter(answers)
			.then(|index| async move { self.answer_content(handle, &index).await })
			.try_collect()
			.await
	}
}

#[derive(Debug, Error)]
pub enum ArchiveError {
	#[error("Request to {endpoint} failed: {source}")]
	Http {
		endpoint: String,
		#[source]
		source: reqwest::Error,
	},
	#[error("{endpoint} returned status {status}: {message}")]
	Status {
		endpoint: String,
		status: u16,
		message: String,
	},
	#[error("Unexpected response from {endpoint}: {message}")]
	Decode { endpoint: String, message: String },
}

/// Tag-based matching criteria for `find` and remote `query` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveQuery {
	pub level: QueryRetrieveLevel,
	/// DICOM keyword -> value, e.g. `AccessionNumber` -> `ACC123`.
	pub criteria: BTreeMap<String, String>,
	pub limit: Option<usize>,
}

impl ArchiveQuery {
	pub const fn new(level: QueryRetrieveLevel) -> Self {
		Self {
			level,
			criteria: BTreeMap::new(),
			limit: None,
		}
	}

	pub fn matching(mut self, keyword: &str, value: impl Into<String>) -> Self {
		self.criteria.insert(keyword.to_owned(), value.into());
		self
	}

	pub const fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}
}

/// Handle of a remote query whose answers are kept by the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHandle(pub String);

/// The resource a move addresses. The archive requires the full UID path down to the level
/// being moved, see [`ResourceIdentifier::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceIdentifier {
	#[serde(rename = "StudyInstanceUID")]
	pub study_instance_uid: UI,
	#[serde(rename = "SeriesInstanceUID", skip_serializing_if = "Option::is_none")]
	pub series_instance_uid: Option<UI>,
	#[serde(rename = "SOPInstanceUID", skip_serializing_if = "Option::is_none")]
	pub sop_instance_uid: Option<UI>,
}

impl ResourceIdentifier {
	pub fn study(study_instance_uid: impl Into<UI>) -> Self {
		Self {
			study_instance_uid: study_instance_uid.into(),
			..Self::default()
		}
	}

	pub fn series(mut self, series_instance_uid: impl Into<UI>) -> Self {
		self.series_instance_uid = Some(series_instance_uid.into());
		self
	}

	pub fn instance(mut self, sop_instance_uid: impl Into<UI>) -> Self {
		self.sop_instance_uid = Some(sop_instance_uid.into());
		self
	}

	/// Checks that every UID the archive needs for a move at `level` is present and non-empty.
	pub fn validate(&self, level: QueryRetrieveLevel) -> Result<(), MissingAttribute> {
		fn present(value: Option<&str>) -> bool {
			value.is_some_and(|value| !value.trim().is_empty())
		}

		if !present(Some(self.study_instance_uid.as_str())) {
			return Err(MissingAttribute::StudyInstanceUid);
		}
		match level {
			QueryRetrieveLevel::Series if !present(self.series_instance_uid.as_deref()) => {
				Err(MissingAttribute::SeriesInstanceUid)
			}
			QueryRetrieveLevel::Instance if !present(self.sop_instance_uid.as_deref()) => {
				Err(MissingAttribute::SopInstanceUid)
			}
			_ => Ok(()),
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum MissingAttribute {
	#[error("StudyInstanceUID (0020,000D)")]
	StudyInstanceUid,
	#[error("SeriesInstanceUID (0020,000E)")]
	SeriesInstanceUid,
	#[error("SOPInstanceUID (0008,0018)")]
	SopInstanceUid,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MoveMode {
	/// The call blocks until the archive finished the move (or its own timeout elapsed).
	Synchronous,
	/// The archive answers immediately with a job id.
	Asynchronous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
	pub level: QueryRetrieveLevel,
	pub identifier: ResourceIdentifier,
	pub target_aet: AE,
	pub mode: MoveMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
	Pending,
	Running,
	Success,
	Failure,
}

impl JobState {
	pub const fn is_terminal(&self) -> bool {
		matches!(self, Self::Success | Self::Failure)
	}
}

impl From<&str> for JobState {
	fn from(value: &str) -> Self {
		match value {
			"Running" | "Paused" | "Retry" => Self::Running,
			"Success" => Self::Success,
			"Failure" => Self::Failure,
			_ => Self::Pending,
		}
	}
}

impl Display for JobState {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Pending => write!(f, "Pending"),
			Self::Running => write!(f, "Running"),
			Self::Success => write!(f, "Success"),
			Self::Failure => write!(f, "Failure"),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
	pub state: JobState,
	/// Completion in percent as reported by the archive.
	pub progress: f64,
	pub error_detail: Option<String>,
}
