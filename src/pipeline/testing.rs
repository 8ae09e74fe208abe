//! In-memory archive and oracle used by the pipeline tests.

use crate::archive::tags::{tag_key, TagSet};
use crate::archive::{
	Archive, ArchiveError, ArchiveQuery, JobState, JobStatus, LocalSeries, LocalStudy,
	MoveMode, MoveRequest, PatientTags, QueryHandle, SeriesEntry, SeriesTags, StudyTags,
};
use crate::oracle::{ClassificationOracle, OracleError};
use crate::types::{JobId, QueryRetrieveLevel, ResourceId};
use async_trait::async_trait;
use bytes::Bytes;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// One instance on the remote modality.
#[derive(Debug, Clone)]
pub struct RemoteInstance {
	pub accession: String,
	pub study_uid: String,
	pub series_uid: String,
	pub description: String,
	pub number: String,
	pub sop_uid: String,
	pub payload: Bytes,
}

impl RemoteInstance {
	pub fn new(accession: &str, series: &str, number: &str, index: usize, payload: &[u8]) -> Self {
		Self {
			accession: accession.to_owned(),
			study_uid: format!("1.2.{accession}"),
			series_uid: format!("1.2.{accession}.{series}"),
			description: series.to_owned(),
			number: number.to_owned(),
			sop_uid: format!("1.2.{accession}.{series}.{index}"),
			payload: Bytes::copy_from_slice(payload),
		}
	}

	pub fn series(
		accession: &str,
		series: &str,
		number: &str,
		count: usize,
		sample: &[u8],
	) -> Vec<Self> {
		(0..count)
			.map(|index| Self::new(accession, series, number, index, sample))
			.collect()
	}

	pub fn local_study_id(&self) -> ResourceId {
		format!("study-{}", self.study_uid)
	}

	pub fn local_series_id(&self) -> ResourceId {
		format!("series-{}", self.series_uid)
	}

	pub fn local_instance_id(&self) -> ResourceId {
		format!("inst-{}", self.sop_uid)
	}
}

#[derive(Default)]
pub struct FakeState {
	pub remote: Vec<RemoteInstance>,
	pub local_studies: BTreeMap<ResourceId, LocalStudy>,
	pub local_series: BTreeMap<ResourceId, LocalSeries>,
	/// Series ids of each local study, in insertion order.
	pub study_series: BTreeMap<ResourceId, Vec<ResourceId>>,
	pub files: HashMap<ResourceId, Bytes>,
	pub sops: HashMap<String, ResourceId>,
	/// Statuses every new job reports, one per poll. The last one repeats.
	pub job_script: Vec<JobStatus>,
	pub jobs: HashMap<JobId, VecDeque<JobStatus>>,
	pub queries: Vec<ArchiveQuery>,
	pub moves: Vec<MoveRequest>,
	pub deleted: Vec<ResourceId>,
	pub polls: usize,
	pub fetches: usize,
	/// Series moves are accepted but no job id is returned.
	pub omit_job_id: bool,
	/// Remote queries fail with a 401.
	pub reject_queries: bool,
	/// Series answers leave out NumberOfSeriesRelatedInstances.
	pub omit_instance_counts: bool,
}

#[derive(Default)]
pub struct FakeArchive {
	state: Mutex<FakeState>,
}

pub fn status(state: JobState) -> JobStatus {
	JobStatus {
		state,
		progress: 0.0,
		error_detail: None,
	}
}

fn tag_set(entries: &[(Tag, &str)]) -> TagSet {
	let attributes = entries
		.iter()
		.map(|(tag, value)| (tag_key(*tag), json!({ "Value": value })))
		.collect::<Map<String, Value>>();
	serde_json::from_value(Value::Object(attributes)).unwrap()
}

impl FakeArchive {
	pub fn new(remote: Vec<RemoteInstance>) -> Self {
		let archive = Self::default();
		archive.state().remote = remote;
		archive
	}

	pub fn state(&self) -> MutexGuard<'_, FakeState> {
		self.state.lock().unwrap()
	}

	/// Places a remote instance into the local store, as a finished move would.
	pub fn store_locally(&self, instance: &RemoteInstance) {
		Self::store(&mut self.state(), instance);
	}

	fn store(state: &mut FakeState, instance: &RemoteInstance) {
		let study_id = instance.local_study_id();
		let series_id = instance.local_series_id();
		let instance_id = instance.local_instance_id();

		state
			.local_studies
			.entry(study_id.clone())
			.or_insert_with(|| LocalStudy {
				id: study_id.clone(),
				tags: StudyTags {
					study_instance_uid: Some(instance.study_uid.clone()),
					accession_number: Some(instance.accession.clone()),
					study_date: Some(String::from("20240101")),
					modalities_in_study: Some(String::from("MR")),
				},
				patient: PatientTags {
					patient_id: Some(String::from("P01")),
				},
			});

		let listed = state.study_series.entry(study_id).or_default();
		if !listed.contains(&series_id) {
			listed.push(series_id.clone());
		}

		let series = state
			.local_series
			.entry(series_id.clone())
			.or_insert_with(|| LocalSeries {
				id: series_id,
				tags: SeriesTags {
					series_instance_uid: Some(instance.series_uid.clone()),
					series_description: Some(instance.description.clone()),
					series_number: Some(instance.number.clone()),
				},
				instances: Vec::new(),
			});
		if !series.instances.contains(&instance_id) {
			series.instances.push(instance_id.clone());
		}

		state
			.files
			.insert(instance_id.clone(), instance.payload.clone());
		state.sops.insert(instance.sop_uid.clone(), instance_id);
	}

	fn criterion<'a>(query: &'a ArchiveQuery, keyword: &str) -> Option<&'a str> {
		query
			.criteria
			.get(keyword)
			.map(String::as_str)
			.filter(|value| !value.is_empty())
	}

	fn answer(state: &FakeState, query: &ArchiveQuery) -> Vec<TagSet> {
		let matches = |instance: &&RemoteInstance| {
			Self::criterion(query, "AccessionNumber").is_none_or(|value| instance.accession == value)
				&& Self::criterion(query, "StudyInstanceUID")
					.is_none_or(|value| instance.study_uid == value)
				&& Self::criterion(query, "SeriesInstanceUID")
					.is_none_or(|value| instance.series_uid == value)
		};

		let mut seen = Vec::new();
		let mut answers = Vec::new();
		for instance in state.remote.iter().filter(matches) {
			let (key, answer_tags) = match query.level {
				QueryRetrieveLevel::Study => (
					instance.study_uid.clone(),
					tag_set(&[
						(tags::STUDY_INSTANCE_UID, instance.study_uid.as_str()),
						(tags::ACCESSION_NUMBER, instance.accession.as_str()),
						(tags::PATIENT_ID, "P01"),
						(tags::STUDY_DATE, "20240101"),
					]),
				),
				QueryRetrieveLevel::Series => {
					let count = state
						.remote
						.iter()
						.filter(|other| other.series_uid == instance.series_uid)
						.count()
						.to_string();
					let mut entries = vec![
						(tags::STUDY_INSTANCE_UID, instance.study_uid.as_str()),
						(tags::SERIES_INSTANCE_UID, instance.series_uid.as_str()),
						(tags::SERIES_DESCRIPTION, instance.description.as_str()),
						(tags::SERIES_NUMBER, instance.number.as_str()),
					];
					if !state.omit_instance_counts {
						entries.push((tags::NUMBER_OF_SERIES_RELATED_INSTANCES, count.as_str()));
					}
					(instance.series_uid.clone(), tag_set(&entries))
				}
				QueryRetrieveLevel::Instance => (
					instance.sop_uid.clone(),
					tag_set(&[
						(tags::STUDY_INSTANCE_UID, instance.study_uid.as_str()),
						(tags::SERIES_INSTANCE_UID, instance.series_uid.as_str()),
						(tags::SOP_INSTANCE_UID, instance.sop_uid.as_str()),
					]),
				),
			};
			if !seen.contains(&key) {
				seen.push(key);
				answers.push(answer_tags);
			}
		}
		if let Some(limit) = query.limit {
			answers.truncate(limit);
		}
		answers
	}

	fn not_found(endpoint: String) -> ArchiveError {
		ArchiveError::Status {
			endpoint,
			status: 404,
			message: String::from("Unknown resource"),
		}
	}
}

#[async_trait]
impl Archive for FakeArchive {
	async fn find(&self, query: &ArchiveQuery) -> Result<Vec<ResourceId>, ArchiveError> {
		let state = self.state();
		let ids = match query.level {
			QueryRetrieveLevel::Study => state
				.local_studies
				.values()
				.filter(|study| {
					Self::criterion(query, "AccessionNumber")
						.is_none_or(|value| study.tags.accession_number.as_deref() == Some(value))
						&& Self::criterion(query, "StudyInstanceUID").is_none_or(|value| {
							study.tags.study_instance_uid.as_deref() == Some(value)
						})
				})
				.map(|study| study.id.clone())
				.collect(),
			QueryRetrieveLevel::Series => state
				.local_series
				.values()
				.filter(|series| {
					Self::criterion(query, "SeriesInstanceUID").is_none_or(|value| {
						series.tags.series_instance_uid.as_deref() == Some(value)
					})
				})
				.map(|series| series.id.clone())
				.collect(),
			QueryRetrieveLevel::Instance => Self::criterion(query, "SOPInstanceUID")
				.and_then(|sop| state.sops.get(sop).cloned())
				.into_iter()
				.collect(),
		};
		Ok(ids)
	}

	async fn query(
		&self,
		_modality: &str,
		query: &ArchiveQuery,
	) -> Result<QueryHandle, ArchiveError> {
		let mut state = self.state();
		if state.reject_queries {
			return Err(ArchiveError::Status {
				endpoint: String::from("modalities/PACS/query"),
				status: 401,
				message: String::from("Unauthorized"),
			});
		}
		state.queries.push(query.clone());
		Ok(QueryHandle(format!("q-{}", state.queries.len() - 1)))
	}

	async fn answers(&self, handle: &QueryHandle) -> Result<Vec<String>, ArchiveError> {
		let state = self.state();
		let query = Self::query_of(&state, handle)?;
		Ok((0..Self::answer(&state, query).len())
			.map(|index| index.to_string())
			.collect())
	}

	async fn answer_content(
		&self,
		handle: &QueryHandle,
		index: &str,
	) -> Result<TagSet, ArchiveError> {
		let state = self.state();
		let query = Self::query_of(&state, handle)?;
		index
			.parse::<usize>()
			.ok()
			.and_then(|index| Self::answer(&state, query).into_iter().nth(index))
			.ok_or_else(|| Self::not_found(format!("queries/{}/answers/{index}", handle.0)))
	}

	async fn move_resource(
		&self,
		_modality: &str,
		request: &MoveRequest,
	) -> Result<Option<JobId>, ArchiveError> {
		let mut state = self.state();
		state.moves.push(request.clone());

		let identifier = &request.identifier;
		let moved: Vec<RemoteInstance> = state
			.remote
			.iter()
			.filter(|instance| instance.study_uid == identifier.study_instance_uid)
			.filter(|instance| {
				identifier
					.series_instance_uid
					.as_ref()
					.is_none_or(|uid| &instance.series_uid == uid)
			})
			.filter(|instance| {
				identifier
					.sop_instance_uid
					.as_ref()
					.is_none_or(|uid| &instance.sop_uid == uid)
			})
			.cloned()
			.collect();
		for instance in &moved {
			Self::store(&mut state, instance);
		}

		if request.mode == MoveMode::Synchronous || state.omit_job_id {
			return Ok(None);
		}
		let job = format!("job-{}", state.jobs.len());
		let script = if state.job_script.is_empty() {
			VecDeque::from([status(JobState::Success)])
		} else {
			state.job_script.iter().cloned().collect()
		};
		state.jobs.insert(job.clone(), script);
		Ok(Some(job))
	}

	async fn job_status(&self, job: &str) -> Result<JobStatus, ArchiveError> {
		let mut state = self.state();
		state.polls += 1;
		let script = state
			.jobs
			.get_mut(job)
			.ok_or_else(|| Self::not_found(format!("jobs/{job}")))?;
		let current = if script.len() > 1 {
			script.pop_front()
		} else {
			script.front().cloned()
		};
		current.ok_or_else(|| Self::not_found(format!("jobs/{job}")))
	}

	async fn study(&self, study: &str) -> Result<LocalStudy, ArchiveError> {
		self.state()
			.local_studies
			.get(study)
			.cloned()
			.ok_or_else(|| Self::not_found(format!("studies/{study}")))
	}

	async fn study_series(&self, study: &str) -> Result<Vec<SeriesEntry>, ArchiveError> {
		let state = self.state();
		let ids = state
			.study_series
			.get(study)
			.ok_or_else(|| Self::not_found(format!("studies/{study}/series")))?;
		// Alternate between the two listing shapes the archive may answer with.
		Ok(ids
			.iter()
			.enumerate()
			.map(|(index, id)| match state.local_series.get(id) {
				Some(series) if index % 2 == 0 => SeriesEntry::Inline(series.clone()),
				_ => SeriesEntry::Reference(id.clone()),
			})
			.collect())
	}

	async fn series(&self, series: &str) -> Result<LocalSeries, ArchiveError> {
		self.state()
			.local_series
			.get(series)
			.cloned()
			.ok_or_else(|| Self::not_found(format!("series/{series}")))
	}

	async fn instance_file(&self, instance: &str) -> Result<Bytes, ArchiveError> {
		let mut state = self.state();
		state.fetches += 1;
		state
			.files
			.get(instance)
			.cloned()
			.ok_or_else(|| Self::not_found(format!("instances/{instance}/file")))
	}

	async fn delete_instance(&self, instance: &str) -> Result<(), ArchiveError> {
		let mut state = self.state();
		state.deleted.push(instance.to_owned());
		state.files.remove(instance);
		state.sops.retain(|_, id| id != instance);
		for series in state.local_series.values_mut() {
			series.instances.retain(|id| id != instance);
		}
		Ok(())
	}
}

impl FakeArchive {
	fn query_of<'a>(
		state: &'a FakeState,
		handle: &QueryHandle,
	) -> Result<&'a ArchiveQuery, ArchiveError> {
		handle
			.0
			.strip_prefix("q-")
			.and_then(|index| index.parse::<usize>().ok())
			.and_then(|index| state.queries.get(index))
			.ok_or_else(|| Self::not_found(format!("queries/{}", handle.0)))
	}
}

/// Labels payloads by their exact content and counts calls.
#[derive(Default)]
pub struct FakeOracle {
	labels: HashMap<Bytes, String>,
	calls: Mutex<usize>,
	fail: bool,
}

impl FakeOracle {
	pub fn new<'a>(labels: impl IntoIterator<Item = (&'a [u8], &'a str)>) -> Self {
		Self {
			labels: labels
				.into_iter()
				.map(|(payload, label)| (Bytes::copy_from_slice(payload), label.to_owned()))
				.collect(),
			..Self::default()
		}
	}

	pub fn failing() -> Self {
		Self {
			fail: true,
			..Self::default()
		}
	}

	pub fn calls(&self) -> usize {
		*self.calls.lock().unwrap()
	}
}

#[async_trait]
impl ClassificationOracle for FakeOracle {
	async fn classify(&self, payload: Bytes) -> Result<Option<String>, OracleError> {
		*self.calls.lock().unwrap() += 1;
		if self.fail {
			return Err(OracleError::Status {
				status: 500,
				message: String::from("model unavailable"),
			});
		}
		let response = json!([{
			"series_type": self.labels.get(&payload).map_or("unknown", String::as_str)
		}]);
		crate::oracle::parse_label(&response)
	}
}
